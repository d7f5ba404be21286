//! Static list of operations the provider supports

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use mantle_common::model::{RESOURCE_PROVIDER_NAMESPACE, RESOURCE_TYPE_CLUSTERS};

use super::{ApiVersion, AppState};
use crate::error::CloudError;

const PROVIDER_DISPLAY_NAME: &str = "Azure Red Hat OpenShift";
const RESOURCE_DISPLAY_NAME: &str = "openShiftClusters";

#[derive(Debug, Deserialize)]
pub(crate) struct OperationsPath {
    provider_namespace: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    name: String,
    display: Display,
    origin: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Display {
    provider: &'static str,
    resource: &'static str,
    operation: &'static str,
    description: &'static str,
}

#[derive(Debug, Serialize)]
struct OperationList {
    value: Vec<Operation>,
}

/// (action, operation, description)
const CLUSTER_ACTIONS: [(&str, &str, &str); 4] = [
    ("read", "Read OpenShift cluster", "Gets an OpenShift cluster"),
    ("write", "Write OpenShift cluster", "Creates or updates an OpenShift cluster"),
    ("delete", "Delete OpenShift cluster", "Deletes an OpenShift cluster"),
    (
        "listCredentials/action",
        "List credentials of an OpenShift cluster",
        "Lists credentials of an OpenShift cluster",
    ),
];

fn operations() -> OperationList {
    let mut value: Vec<Operation> = CLUSTER_ACTIONS
        .iter()
        .map(|&(action, operation, description)| Operation {
            name: format!(
                "{}/{}/{}",
                RESOURCE_PROVIDER_NAMESPACE, RESOURCE_TYPE_CLUSTERS, action
            ),
            display: Display {
                provider: PROVIDER_DISPLAY_NAME,
                resource: RESOURCE_DISPLAY_NAME,
                operation,
                description,
            },
            origin: "user,system",
        })
        .collect();
    value.push(Operation {
        name: format!("{}/operations/read", RESOURCE_PROVIDER_NAMESPACE),
        display: Display {
            provider: PROVIDER_DISPLAY_NAME,
            resource: "Operations",
            operation: "Read operations",
            description: "Lists operations available on the resource provider",
        },
        origin: "user,system",
    });
    OperationList { value }
}

pub(crate) async fn list_operations(
    State(state): State<AppState>,
    Path(path): Path<OperationsPath>,
    Query(query): Query<ApiVersion>,
) -> Result<Response, CloudError> {
    state.converter(
        &path.provider_namespace,
        RESOURCE_TYPE_CLUSTERS,
        &query.api_version,
    )?;
    Ok(Json(operations()).into_response())
}

#[cfg(test)]
mod tests {
    use crate::frontend::tests::{with_version, Harness};
    use axum::http::{Method, StatusCode};

    #[tokio::test]
    async fn operations_are_listed() {
        let harness = Harness::new();
        let (status, body) = harness
            .send(
                Method::GET,
                &with_version("/providers/Microsoft.RedHatOpenShift/operations"),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["value"]
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|op| op["name"].as_str())
            .collect();
        assert!(names.contains(&"Microsoft.RedHatOpenShift/openShiftClusters/read"));
        assert!(names.contains(&"Microsoft.RedHatOpenShift/openShiftClusters/listCredentials/action"));
        assert!(names.contains(&"Microsoft.RedHatOpenShift/operations/read"));
    }

    #[tokio::test]
    async fn operations_need_an_api_version() {
        let harness = Harness::new();
        let (status, _) = harness
            .send(Method::GET, "/providers/Microsoft.RedHatOpenShift/operations", None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
