//! Reads: one cluster, or a collection by resource group or subscription

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use mantle_common::model::resource_key;

use super::{load, project, ApiVersion, AppState, ResourcePath};
use crate::api::Converter;
use crate::error::CloudError;

/// Path of a resource group collection
#[derive(Debug, Deserialize)]
pub(crate) struct ResourceGroupPath {
    subscription_id: String,
    resource_group: String,
    provider_namespace: String,
    resource_type: String,
}

/// Path of a subscription collection
#[derive(Debug, Deserialize)]
pub(crate) struct SubscriptionPath {
    subscription_id: String,
    provider_namespace: String,
    resource_type: String,
}

pub(crate) async fn get_cluster(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
    Query(query): Query<ApiVersion>,
) -> Result<Response, CloudError> {
    let converter = state.converter(
        &path.provider_namespace,
        &path.resource_type,
        &query.api_version,
    )?;
    let doc = load(&state, &path).await?;
    let external = project(converter.as_ref(), doc.cluster, Some(&path))?;
    Ok(Json(external).into_response())
}

pub(crate) async fn list_by_resource_group(
    State(state): State<AppState>,
    Path(path): Path<ResourceGroupPath>,
    Query(query): Query<ApiVersion>,
) -> Result<Response, CloudError> {
    let converter = state.converter(
        &path.provider_namespace,
        &path.resource_type,
        &query.api_version,
    )?;
    let prefix = format!(
        "{}/",
        resource_key(&format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}",
            path.subscription_id, path.resource_group, path.provider_namespace, path.resource_type
        ))
    );
    list(&state, converter.as_ref(), &prefix, None).await
}

pub(crate) async fn list_by_subscription(
    State(state): State<AppState>,
    Path(path): Path<SubscriptionPath>,
    Query(query): Query<ApiVersion>,
) -> Result<Response, CloudError> {
    let converter = state.converter(
        &path.provider_namespace,
        &path.resource_type,
        &query.api_version,
    )?;
    let prefix = format!("{}/", resource_key(&format!("/subscriptions/{}", path.subscription_id)));
    let segment = format!(
        "/providers/{}/{}/",
        path.provider_namespace, path.resource_type
    )
    .to_lowercase();
    list(&state, converter.as_ref(), &prefix, Some(&segment)).await
}

/// `{"value":[...]}` of every document under `prefix`
///
/// With `segment`, only keys containing it are kept.
async fn list(
    state: &AppState,
    converter: &dyn Converter,
    prefix: &str,
    segment: Option<&str>,
) -> Result<Response, CloudError> {
    let docs = state.store.list(prefix).await?;
    let value = docs
        .into_iter()
        .filter(|doc| segment.is_none_or(|s| doc.key.contains(s)))
        .map(|doc| project(converter, doc.cluster, None))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(json!({ "value": value })).into_response())
}
