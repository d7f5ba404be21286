//! Admin credentials of a running cluster

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;

use mantle_common::model::ProvisioningState;

use super::{load, ApiVersion, AppState, ResourcePath};
use crate::error::CloudError;

pub(crate) async fn list_credentials(
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
    if doc.state() != ProvisioningState::Succeeded {
        return Err(CloudError::request_not_allowed(doc.state()));
    }
    let credentials = converter.credentials_to_external(&doc.cluster)?;
    Ok(Json(credentials).into_response())
}
