//! ARM-facing HTTP frontend
//!
//! Every route except `/healthz/ready` sits behind the environment's caller
//! authentication. Each request runs in its own span tagged with the ARM
//! correlation id.

mod credentials;
mod delete;
mod get;
mod operations;
mod put_or_patch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use mantle_common::model::{resource_key, Cluster, ClusterDocument, RESOURCE_PROVIDER_NAMESPACE};
use mantle_common::retry::RetryConfig;
use mantle_install::Dispatcher;
use mantle_store::DocumentStore;

use crate::api::{Converter, Registry};
use crate::environment::Environment;
use crate::error::{codes, CloudError};
use crate::provisioning::ProvisioningPolicy;

/// Header ARM uses to correlate one client operation across services
pub const CORRELATION_ID_HEADER: &str = "x-ms-correlation-request-id";

const CLUSTER_COLLECTION: &str = "/subscriptions/{subscription_id}/resourceGroups/{resource_group}/providers/{provider_namespace}/{resource_type}";
const CLUSTER: &str = "/subscriptions/{subscription_id}/resourceGroups/{resource_group}/providers/{provider_namespace}/{resource_type}/{resource_name}";
const CLUSTER_CREDENTIALS: &str = "/subscriptions/{subscription_id}/resourceGroups/{resource_group}/providers/{provider_namespace}/{resource_type}/{resource_name}/credentials";
const SUBSCRIPTION_COLLECTION: &str =
    "/subscriptions/{subscription_id}/providers/{provider_namespace}/{resource_type}";
const OPERATIONS: &str = "/providers/{provider_namespace}/operations";
const READY: &str = "/healthz/ready";

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn DocumentStore>,
    dispatcher: Arc<dyn Dispatcher>,
    env: Arc<Environment>,
    registry: Arc<Registry>,
    policy: ProvisioningPolicy,
    retry: RetryConfig,
    location: String,
    tenant_id: String,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl AppState {
    /// State with the default registry, policy and conflict retry budget
    ///
    /// The listener starts out not ready; see [`mark_ready`](Self::mark_ready).
    pub fn new(
        store: Arc<dyn DocumentStore>,
        dispatcher: Arc<dyn Dispatcher>,
        env: Arc<Environment>,
        location: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            env,
            registry: Arc::new(Registry::default()),
            policy: ProvisioningPolicy::default(),
            retry: RetryConfig::conflict(),
            location: location.into(),
            tenant_id: tenant_id.into(),
            ready: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Override the provisioning policy
    pub fn with_policy(mut self, policy: ProvisioningPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the conflict retry budget
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Abort in-flight write loops when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start answering readiness probes with 200
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Fail readiness probes so load balancers drain this instance
    pub fn mark_unready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// True when the listener and the environment are both ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.env.is_ready()
    }

    /// The converter serving a request, or the ARM 404 for it
    fn converter(
        &self,
        namespace: &str,
        resource_type: &str,
        api_version: &str,
    ) -> Result<Arc<dyn Converter>, CloudError> {
        if !namespace.eq_ignore_ascii_case(RESOURCE_PROVIDER_NAMESPACE) {
            return Err(CloudError::new(
                StatusCode::NOT_FOUND,
                codes::INVALID_RESOURCE_NAMESPACE,
                "",
                format!("The resource namespace '{}' is invalid.", namespace),
            ));
        }
        self.registry
            .get(api_version, resource_type)
            .ok_or_else(|| {
                CloudError::new(
                    StatusCode::NOT_FOUND,
                    codes::INVALID_RESOURCE_TYPE,
                    "",
                    format!(
                        "The resource type '{}' could not be found in the namespace '{}' for api version '{}'.",
                        resource_type, namespace, api_version
                    ),
                )
            })
    }
}

/// Path of a single cluster
#[derive(Debug, Deserialize)]
pub(crate) struct ResourcePath {
    subscription_id: String,
    resource_group: String,
    provider_namespace: String,
    resource_type: String,
    resource_name: String,
}

impl ResourcePath {
    /// Resource id in the casing the caller used
    pub(crate) fn resource_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}",
            self.subscription_id,
            self.resource_group,
            self.provider_namespace,
            self.resource_type,
            self.resource_name
        )
    }

    pub(crate) fn key(&self) -> String {
        resource_key(&self.resource_id())
    }

    pub(crate) fn qualified_type(&self) -> String {
        format!("{}/{}", self.provider_namespace, self.resource_type)
    }

    fn not_found(&self) -> CloudError {
        CloudError::resource_not_found(
            &self.qualified_type(),
            &self.resource_name,
            &self.resource_group,
        )
    }
}

/// The `api-version` query parameter; absent reads as empty
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiVersion {
    #[serde(rename = "api-version", default)]
    api_version: String,
}

/// The stored document for `path`, or the ARM 404
async fn load(state: &AppState, path: &ResourcePath) -> Result<ClusterDocument, CloudError> {
    match state.store.get(&path.key()).await {
        Ok(doc) => Ok(doc),
        Err(e) if e.is_not_found() => Err(path.not_found()),
        Err(e) => Err(e.into()),
    }
}

/// External projection of `cluster` with secrets removed
///
/// With `path`, the identity fields are re-stamped from the request.
fn project(
    converter: &dyn Converter,
    mut cluster: Cluster,
    path: Option<&ResourcePath>,
) -> Result<Value, CloudError> {
    cluster.scrub_secrets();
    if let Some(path) = path {
        cluster.id = path.resource_id();
        cluster.name = path.resource_name.clone();
        cluster.resource_type = path.qualified_type();
    }
    Ok(converter.to_external(&cluster)?)
}

/// Build the frontend router
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            CLUSTER,
            get(get::get_cluster)
                .put(put_or_patch::put_or_patch)
                .patch(put_or_patch::put_or_patch)
                .delete(delete::delete_cluster),
        )
        .route(CLUSTER_CREDENTIALS, post(credentials::list_credentials))
        .route(CLUSTER_COLLECTION, get(get::list_by_resource_group))
        .route(SUBSCRIPTION_COLLECTION, get(get::list_by_subscription))
        .route(OPERATIONS, get(operations::list_operations))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route(READY, get(ready))
        .merge(api)
        .layer(middleware::from_fn(trace_request))
        .with_state(state)
}

async fn ready(State(state): State<AppState>) -> Response {
    if state.is_ready() {
        StatusCode::OK.into_response()
    } else {
        CloudError::internal().into_response()
    }
}

async fn authenticate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.env.authenticate(request.headers()) {
        next.run(request).await
    } else {
        CloudError::forbidden().into_response()
    }
}

async fn trace_request(request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let span = info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        correlation_id = %correlation_id,
    );

    async move {
        let started = Instant::now();
        let mut response = next.run(request).await;
        info!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Method;
    use mantle_store::MemoryStore;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    pub(crate) const API_VERSION: &str = "2019-12-31-preview";
    pub(crate) const CLUSTER_URI: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.RedHatOpenShift/openShiftClusters/dev";

    /// Records every dispatched key
    #[derive(Default)]
    pub(crate) struct RecordingDispatcher {
        pub(crate) keys: Mutex<Vec<String>>,
    }

    impl Dispatcher for RecordingDispatcher {
        fn dispatch(&self, key: &str) {
            self.keys.lock().push(key.to_string());
        }
    }

    pub(crate) struct Harness {
        pub(crate) store: Arc<MemoryStore>,
        pub(crate) dispatcher: Arc<RecordingDispatcher>,
        pub(crate) state: AppState,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let dispatcher = Arc::new(RecordingDispatcher::default());
            let state = AppState::new(
                store.clone(),
                dispatcher.clone(),
                Arc::new(Environment::Development),
                "eastus",
                "tenant",
            );
            state.mark_ready();
            Self {
                store,
                dispatcher,
                state,
            }
        }

        pub(crate) async fn send(
            &self,
            method: Method,
            uri: &str,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            let body = match body {
                Some(json) => {
                    builder = builder.header("content-type", "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };
            let request = builder.body(body).expect("request");
            let response = router(self.state.clone())
                .oneshot(request)
                .await
                .expect("router is infallible");
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
                .await
                .expect("read body");
            let json = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).expect("json body")
            };
            (status, json)
        }
    }

    pub(crate) fn with_version(path: &str) -> String {
        format!("{}?api-version={}", path, API_VERSION)
    }

    #[tokio::test]
    async fn readiness_tracks_the_listener_flag() {
        let harness = Harness::new();
        let (status, _) = harness.send(Method::GET, READY, None).await;
        assert_eq!(status, StatusCode::OK);

        harness.state.mark_unready();
        let (status, body) = harness.send(Method::GET, READY, None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "InternalServerError");
    }

    #[tokio::test]
    async fn correlation_id_is_echoed() {
        let harness = Harness::new();
        let request = Request::builder()
            .uri(READY)
            .header(CORRELATION_ID_HEADER, "abc-123")
            .body(Body::empty())
            .expect("request");
        let response = router(harness.state.clone())
            .oneshot(request)
            .await
            .expect("router is infallible");
        assert_eq!(
            response.headers().get(CORRELATION_ID_HEADER).map(|v| v.as_bytes()),
            Some(&b"abc-123"[..])
        );
    }

    #[tokio::test]
    async fn unknown_namespace_and_version_are_not_found() {
        let harness = Harness::new();
        let (status, body) = harness
            .send(
                Method::GET,
                "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/openShiftClusters/dev?api-version=2019-12-31-preview",
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "InvalidResourceNamespace");

        let (status, body) = harness
            .send(Method::GET, &format!("{}?api-version=2020-04-30", CLUSTER_URI), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "InvalidResourceType");

        let (status, body) = harness.send(Method::GET, CLUSTER_URI, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "InvalidResourceType");
    }

    #[tokio::test]
    async fn production_rejects_unauthenticated_callers_but_not_health() {
        use crate::metadata::tests::{epoch, source_with, ManualClock};
        use crate::metadata::{MetadataCache, METADATA_REFRESH_INTERVAL};

        let cache = MetadataCache::new(
            Arc::new(source_with(b"trusted")),
            ManualClock::at(epoch()),
            METADATA_REFRESH_INTERVAL,
        );
        cache.refresh_once().await.expect("refresh");
        let state = AppState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingDispatcher::default()),
            Arc::new(Environment::Production {
                metadata: Arc::new(cache),
            }),
            "eastus",
            "tenant",
        );
        state.mark_ready();

        let call = |uri: String| {
            let app = router(state.clone());
            async move {
                app.oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
                    .await
                    .expect("router is infallible")
                    .status()
            }
        };
        assert_eq!(call(with_version(CLUSTER_URI)).await, StatusCode::FORBIDDEN);
        assert_eq!(call(READY.to_string()).await, StatusCode::OK);
    }
}
