//! PUT and PATCH of a cluster

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::Value;
use tracing::info;

use mantle_common::model::{
    Cluster, ClusterDocument, Installation, ProvisioningState, Secret,
};
use mantle_common::retry::retry_on_conflict;
use mantle_common::{generate, Result};

use super::{project, ApiVersion, AppState, ResourcePath};
use crate::api::{merge, Converter, RequestContext};
use crate::error::{codes, CloudError};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// What one write attempt decided
type Attempt = std::result::Result<(ClusterDocument, bool), CloudError>;

pub(crate) async fn put_or_patch(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<ResourcePath>,
    Query(query): Query<ApiVersion>,
    headers: HeaderMap,
    body: Body,
) -> std::result::Result<Response, CloudError> {
    let converter = state.converter(
        &path.provider_namespace,
        &path.resource_type,
        &query.api_version,
    )?;
    require_json(&headers)?;

    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| {
            CloudError::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                codes::INVALID_RESOURCE,
                "",
                "The resource definition is invalid.",
            )
        })?;
    let body: Value = serde_json::from_slice(&bytes).map_err(CloudError::invalid_request_content)?;
    if !body.is_object() {
        return Err(CloudError::invalid_request_content("expected a JSON object"));
    }

    let patch = method == Method::PATCH;
    let cancel = state.cancel.child_token();
    let (doc, created) = retry_on_conflict(&state.retry, "put_or_patch", &cancel, || {
        write_once(&state, converter.as_ref(), &path, &body, patch)
    })
    .await??;

    info!(
        cluster = %doc.key,
        state = %doc.state(),
        created,
        "cluster accepted"
    );
    state.dispatcher.dispatch(&doc.key);

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let external = project(converter.as_ref(), doc.cluster, Some(&path))?;
    Ok((status, Json(external)).into_response())
}

fn require_json(headers: &HeaderMap) -> std::result::Result<(), CloudError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let media = content_type.split(';').next().unwrap_or_default().trim();
    if media.eq_ignore_ascii_case("application/json") {
        return Ok(());
    }
    Err(CloudError::new(
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
        codes::UNSUPPORTED_MEDIA_TYPE,
        "",
        format!(
            "The content media type '{}' is not supported. Only 'application/json' is supported.",
            content_type
        ),
    ))
}

/// One read-merge-validate-write cycle
///
/// Store errors come back as `Err` so lost races are retried; decisions
/// for the client come back as `Ok(Err(_))` and end the loop.
async fn write_once(
    state: &AppState,
    converter: &dyn Converter,
    path: &ResourcePath,
    body: &Value,
    patch: bool,
) -> Result<Attempt> {
    let key = path.key();
    let existing = match state.store.get(&key).await {
        Ok(doc) => Some(doc),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };

    let resource_id = path.resource_id();
    let resource_type = path.qualified_type();
    let ctx = RequestContext {
        resource_id: &resource_id,
        name: &path.resource_name,
        resource_type: &resource_type,
        location: &state.location,
        tenant_id: &state.tenant_id,
    };

    let (mut external, target) = match &existing {
        None => (
            converter.to_external(&identity(path, ProvisioningState::Creating))?,
            ProvisioningState::Creating,
        ),
        Some(doc) => {
            let target = match state.policy.put_or_patch(&doc.cluster) {
                Ok(target) => target,
                Err(e) => return Ok(Err(e)),
            };
            let base = if patch {
                converter.to_external(&doc.cluster)?
            } else {
                converter.to_external(&identity(path, doc.state()))?
            };
            (base, target)
        }
    };
    merge(&mut external, body.clone());

    let current = existing.as_ref().map(|doc| &doc.cluster);
    let mut cluster = current.cloned().unwrap_or_default();
    if let Err(e) = converter.apply(external, &ctx, current, &mut cluster) {
        return Ok(Err(e));
    }

    let props = &mut cluster.properties;
    props.provisioning_state = target;
    props.last_error = None;

    let stored = match existing {
        None => {
            initialize(&mut cluster, path)?;
            let doc = ClusterDocument::new(uuid::Uuid::new_v4().to_string(), key, cluster);
            (state.store.create(doc).await?, true)
        }
        Some(mut doc) => {
            doc.cluster = cluster;
            (state.store.update(doc).await?, false)
        }
    };
    Ok(Ok(stored))
}

/// A cluster carrying only identity and state, the base of a PUT
fn identity(path: &ResourcePath, state: ProvisioningState) -> Cluster {
    let mut cluster = Cluster {
        id: path.resource_id(),
        name: path.resource_name.clone(),
        resource_type: path.qualified_type(),
        ..Default::default()
    };
    cluster.properties.provisioning_state = state;
    cluster
}

/// Identity and generate-once fields of a new cluster
fn initialize(cluster: &mut Cluster, path: &ResourcePath) -> Result<()> {
    cluster.id = path.resource_id();
    cluster.name = path.resource_name.clone();
    cluster.resource_type = path.qualified_type();

    let props = &mut cluster.properties;
    props.provisioning_state = ProvisioningState::Creating;
    props.resource_group = path.resource_name.clone();
    props.domain_name = path.resource_name.clone();
    props.cluster_id = generate::cluster_slug(&path.resource_name);
    props.storage_suffix = generate::storage_suffix();
    props.ssh_key = Secret::new(generate::ssh_private_key()?);
    props.kubeadmin_password = Secret::new(generate::kubeadmin_password());
    props.installation = Some(Installation::started_at(Utc::now()));
    Ok(())
}
