//! Shared harness: an in-process provider with fake ARM clients

mod concurrency;
mod lifecycle;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use mantle_api::{router, AppState, Environment};
use mantle_common::model::{Cluster, Secret};
use mantle_common::{Result, Settings};
use mantle_install::azure::{
    Deployment, DeploymentsClient, OperationStatus, PollHandle, PollKind, RecordSets,
    ResourceGroupsClient, SubnetClient,
};
use mantle_install::{
    AzureClients, Backend, BootstrapProbe, DnsRegistrar, Installer, LocalDispatcher, ProbeFactory,
};
use mantle_store::MemoryStore;

pub const API_VERSION: &str = "2019-12-31-preview";
pub const LOCATION: &str = "eastus";
pub const TENANT: &str = "tenant";
pub const RP_SUBSCRIPTION: &str = "rp-sub";
pub const RP_RESOURCE_GROUP: &str = "rp-rg";
pub const ZONE: &str = "osadev.example.com";

pub const RESOURCE_GROUP_URI: &str =
    "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.RedHatOpenShift/openShiftClusters";
pub const CLUSTER_URI: &str =
    "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.RedHatOpenShift/openShiftClusters/dev";

const SUBNETS: &str =
    "/subscriptions/sub/resourceGroups/vnet-rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets";

/// Append the served api-version to a path
pub fn versioned(path: &str) -> String {
    format!("{}?api-version={}", path, API_VERSION)
}

/// A create request that passes validation
pub fn cluster_body() -> Value {
    json!({
        "location": LOCATION,
        "tags": {"team": "platform"},
        "properties": {
            "servicePrincipalProfile": {"clientId": "app", "clientSecret": "s3cret"},
            "networkProfile": {"podCidr": "10.128.0.0/14", "serviceCidr": "172.30.0.0/16"},
            "masterProfile": {"vmSize": "Standard_D8s_v3", "subnetId": format!("{}/master", SUBNETS)},
            "workerProfiles": [{
                "name": "worker",
                "vmSize": "Standard_D4s_v3",
                "diskSizeGB": 128,
                "subnetId": format!("{}/worker", SUBNETS),
                "count": 3,
            }],
        },
    })
}

fn handle(url: String) -> PollHandle {
    PollHandle {
        url,
        kind: PollKind::AsyncOperation,
        retry_after: None,
    }
}

/// Records what the pipeline asked of ARM; every operation succeeds unless
/// told otherwise
#[derive(Default)]
pub struct FakeArm {
    pub fail_resources: AtomicBool,
    pub deployments: Mutex<Vec<String>>,
    pub deleted_groups: Mutex<Vec<String>>,
    pub records: Mutex<BTreeMap<String, String>>,
}

#[async_trait]
impl DeploymentsClient for FakeArm {
    async fn begin_create_or_update(
        &self,
        _subscription: &str,
        resource_group: &str,
        deployment_name: &str,
        _deployment: &Deployment,
    ) -> Result<PollHandle> {
        self.deployments.lock().push(deployment_name.to_string());
        Ok(handle(format!(
            "https://arm.test/{}/deployments/{}",
            resource_group, deployment_name
        )))
    }

    async fn poll(&self, handle: &PollHandle) -> Result<OperationStatus> {
        if handle.url.ends_with("/deployments/azuredeploy")
            && self.fail_resources.load(Ordering::SeqCst)
        {
            return Ok(OperationStatus::Failed {
                code: "QuotaExceeded".into(),
                message: "Operation results in exceeding quota limits of Core".into(),
            });
        }
        Ok(OperationStatus::Succeeded)
    }
}

#[async_trait]
impl ResourceGroupsClient for FakeArm {
    async fn create_or_update(&self, _subscription: &str, _name: &str, _location: &str) -> Result<()> {
        Ok(())
    }

    async fn begin_delete(&self, _subscription: &str, name: &str) -> Result<Option<PollHandle>> {
        self.deleted_groups.lock().push(name.to_string());
        Ok(Some(handle(format!("https://arm.test/groups/{}", name))))
    }

    async fn poll(&self, _handle: &PollHandle) -> Result<OperationStatus> {
        Ok(OperationStatus::Succeeded)
    }
}

#[async_trait]
impl SubnetClient for FakeArm {
    async fn address_prefix(&self, subnet_id: &str) -> Result<Option<String>> {
        let prefix = if subnet_id.ends_with("/master") {
            "10.0.0.0/24"
        } else {
            "10.0.1.0/24"
        };
        Ok(Some(prefix.to_string()))
    }
}

#[async_trait]
impl RecordSets for FakeArm {
    async fn list_zones(&self, _subscription: &str, _resource_group: &str) -> Result<Vec<String>> {
        Ok(vec![ZONE.to_string()])
    }

    async fn create_or_update_cname(
        &self,
        _subscription: &str,
        _resource_group: &str,
        _zone: &str,
        name: &str,
        target: &str,
        _ttl: u64,
    ) -> Result<()> {
        self.records.lock().insert(name.to_string(), target.to_string());
        Ok(())
    }

    async fn delete_cname(
        &self,
        _subscription: &str,
        _resource_group: &str,
        _zone: &str,
        name: &str,
    ) -> Result<()> {
        self.records.lock().remove(name);
        Ok(())
    }
}

/// Bootstrap finishes whenever the shared flag is set
struct FlagProbes {
    bootstrapped: Arc<AtomicBool>,
}

struct FlagProbe {
    bootstrapped: Arc<AtomicBool>,
}

impl ProbeFactory for FlagProbes {
    fn probe_for(&self, _cluster: &Cluster) -> Box<dyn BootstrapProbe> {
        Box::new(FlagProbe {
            bootstrapped: self.bootstrapped.clone(),
        })
    }
}

#[async_trait]
impl BootstrapProbe for FlagProbe {
    async fn is_complete(&self) -> Result<bool> {
        Ok(self.bootstrapped.load(Ordering::SeqCst))
    }
}

/// Frontend and backend sharing one store
pub struct Provider {
    pub store: Arc<MemoryStore>,
    pub arm: Arc<FakeArm>,
    pub bootstrapped: Arc<AtomicBool>,
    pub backend: Arc<Backend>,
    pub dispatcher: Arc<LocalDispatcher>,
    state: AppState,
    shutdown: CancellationToken,
}

impl Provider {
    pub async fn start() -> Self {
        Self::with_store(Arc::new(MemoryStore::new())).await
    }

    pub async fn with_store(store: Arc<MemoryStore>) -> Self {
        let arm = Arc::new(FakeArm::default());
        let bootstrapped = Arc::new(AtomicBool::new(true));
        let clients = AzureClients {
            deployments: arm.clone(),
            resource_groups: arm.clone(),
            subnets: arm.clone(),
            record_sets: arm.clone(),
        };
        let dns = Arc::new(
            DnsRegistrar::discover(clients.record_sets.clone(), RP_SUBSCRIPTION, RP_RESOURCE_GROUP)
                .await
                .expect("one zone"),
        );
        let settings = Settings {
            location: LOCATION.into(),
            tenant_id: TENANT.into(),
            subscription_id: RP_SUBSCRIPTION.into(),
            resource_group: RP_RESOURCE_GROUP.into(),
            pull_secret: Secret::new("{\"auths\":{}}"),
            base_domain: dns.zone().to_string(),
        };
        let installer = Installer::new(
            store.clone(),
            settings,
            &clients,
            dns.clone(),
            Arc::new(FlagProbes {
                bootstrapped: bootstrapped.clone(),
            }),
        )
        .with_poll_interval(Duration::from_millis(1))
        .with_readiness(Duration::from_millis(5), Duration::from_secs(30));
        let backend = Arc::new(
            Backend::new(store.clone(), installer, dns, clients.resource_groups.clone())
                .with_poll_interval(Duration::from_millis(1)),
        );

        let shutdown = CancellationToken::new();
        let dispatcher = Arc::new(LocalDispatcher::new(backend.clone(), shutdown.child_token()));
        let state = AppState::new(
            store.clone(),
            dispatcher.clone(),
            Arc::new(Environment::Development),
            LOCATION,
            TENANT,
        )
        .with_cancellation(shutdown.child_token());
        state.mark_ready();

        Self {
            store,
            arm,
            bootstrapped,
            backend,
            dispatcher,
            state,
            shutdown,
        }
    }

    pub async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
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

    /// Poll GET until the cluster reports `state`
    pub async fn wait_for_state(&self, uri: &str, state: &str) -> Value {
        let mut last = Value::Null;
        for _ in 0..2000 {
            let (status, body) = self.send(Method::GET, &versioned(uri), None).await;
            if status == StatusCode::OK && body["properties"]["provisioningState"] == state {
                return body;
            }
            last = body;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cluster never reached {}; last response {}", state, last);
    }

    /// Poll GET until the cluster is gone
    pub async fn wait_for_absent(&self, uri: &str) {
        for _ in 0..2000 {
            let (status, _) = self.send(Method::GET, &versioned(uri), None).await;
            if status == StatusCode::NOT_FOUND {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cluster was never deleted");
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.dispatcher.shutdown().await;
    }
}
