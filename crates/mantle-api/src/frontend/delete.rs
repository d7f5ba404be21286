//! DELETE of a cluster

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::info;

use mantle_common::model::ProvisioningState;
use mantle_common::retry::retry_on_conflict;
use mantle_common::Result;

use super::{ApiVersion, AppState, ResourcePath};
use crate::error::CloudError;
use crate::provisioning::DeleteDecision;

pub(crate) async fn delete_cluster(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
    Query(query): Query<ApiVersion>,
) -> std::result::Result<Response, CloudError> {
    state.converter(
        &path.provider_namespace,
        &path.resource_type,
        &query.api_version,
    )?;
    let key = path.key();
    let cancel = state.cancel.child_token();
    let decision = retry_on_conflict(&state.retry, "delete", &cancel, || {
        begin_delete(&state, &key)
    })
    .await??;

    let Some(decision) = decision else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    if decision == DeleteDecision::Begin {
        info!(cluster = %key, "cluster deletion accepted");
    }
    state.dispatcher.dispatch(&key);
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Move the document to Deleting; `None` when there is nothing to delete
async fn begin_delete(
    state: &AppState,
    key: &str,
) -> Result<std::result::Result<Option<DeleteDecision>, CloudError>> {
    let mut doc = match state.store.get(key).await {
        Ok(doc) => doc,
        Err(e) if e.is_not_found() => return Ok(Ok(None)),
        Err(e) => return Err(e),
    };
    let decision = match state.policy.delete(doc.state()) {
        Ok(decision) => decision,
        Err(e) => return Ok(Err(e)),
    };
    if decision == DeleteDecision::Begin {
        let props = &mut doc.cluster.properties;
        props.provisioning_state = ProvisioningState::Deleting;
        props.last_error = None;
        state.store.update(doc).await?;
    }
    Ok(Ok(Some(decision)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v20191231preview::tests::valid_body;
    use crate::frontend::tests::{with_version, Harness, CLUSTER_URI};
    use axum::http::Method;
    use mantle_common::model::resource_key;
    use mantle_store::DocumentStore;

    async fn seed(harness: &Harness, state: ProvisioningState) {
        let (status, _) = harness
            .send(Method::PUT, &with_version(CLUSTER_URI), Some(valid_body()))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let mut doc = harness
            .store
            .get(&resource_key(CLUSTER_URI))
            .await
            .expect("stored");
        doc.cluster.properties.provisioning_state = state;
        harness.store.update(doc).await.expect("update");
    }

    async fn stored_state(harness: &Harness) -> (ProvisioningState, String) {
        let doc = harness
            .store
            .get(&resource_key(CLUSTER_URI))
            .await
            .expect("stored");
        (doc.state(), doc.etag)
    }

    #[tokio::test]
    async fn delete_of_succeeded_cluster_is_accepted() {
        let harness = Harness::new();
        seed(&harness, ProvisioningState::Succeeded).await;

        let (status, _) = harness
            .send(Method::DELETE, &with_version(CLUSTER_URI), None)
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(stored_state(&harness).await.0, ProvisioningState::Deleting);
        assert_eq!(harness.dispatcher.keys.lock().len(), 2);
    }

    #[tokio::test]
    async fn repeated_delete_leaves_the_document_alone() {
        let harness = Harness::new();
        seed(&harness, ProvisioningState::Deleting).await;
        let (_, etag) = stored_state(&harness).await;

        let (status, _) = harness
            .send(Method::DELETE, &with_version(CLUSTER_URI), None)
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(stored_state(&harness).await.1, etag);
    }

    #[tokio::test]
    async fn delete_while_creating_is_refused() {
        let harness = Harness::new();
        seed(&harness, ProvisioningState::Creating).await;
        let (_, etag) = stored_state(&harness).await;

        let (status, body) = harness
            .send(Method::DELETE, &with_version(CLUSTER_URI), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "RequestNotAllowed");
        assert_eq!(stored_state(&harness).await, (ProvisioningState::Creating, etag));
    }

    #[tokio::test]
    async fn deleting_a_missing_cluster_is_no_content() {
        let harness = Harness::new();
        let (status, _) = harness
            .send(Method::DELETE, &with_version(CLUSTER_URI), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(harness.dispatcher.keys.lock().is_empty());
    }
}
