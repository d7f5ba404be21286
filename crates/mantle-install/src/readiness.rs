//! Bootstrap readiness
//!
//! After the control plane VMs are up, the bootstrap node signals completion
//! by writing `status: complete` into the `kube-system/bootstrap` ConfigMap
//! of the new cluster. The installer polls for it with [`await_completion`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use mantle_common::model::{Cluster, InstallPhase, Secret};
use mantle_common::{Error, Result};

/// Delay between bootstrap probes
pub const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How long bootstrap may take
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const BOOTSTRAP_NAMESPACE: &str = "kube-system";
const BOOTSTRAP_CONFIGMAP: &str = "bootstrap";

/// Probe `probe` every `interval` until it reports `true`
///
/// Probe errors before the deadline are logged and ignored. At the deadline
/// the last probe error is returned if there was one, otherwise a Timeout.
pub async fn await_completion<F, Fut>(
    operation: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut last_error = None;

    loop {
        match probe().await {
            Ok(true) => return Ok(()),
            Ok(false) => debug!(operation = %operation, "not ready yet"),
            Err(e) => {
                warn!(operation = %operation, error = %e, "readiness probe failed");
                last_error = Some(e);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(last_error.unwrap_or_else(|| Error::timeout(operation, started.elapsed())));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(interval.min(deadline - now)) => {}
        }
    }
}

/// One cluster's bootstrap signal
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapProbe: Send + Sync {
    /// True once bootstrap has finished
    async fn is_complete(&self) -> Result<bool>;
}

/// Builds a [`BootstrapProbe`] for a cluster
#[cfg_attr(test, automock)]
pub trait ProbeFactory: Send + Sync {
    /// A probe for `cluster`
    fn probe_for(&self, cluster: &Cluster) -> Box<dyn BootstrapProbe>;
}

/// Reads the bootstrap ConfigMap of one cluster
///
/// Uses the cluster's admin kubeconfig when it has one. Otherwise a
/// service-wide kubeconfig may be supplied, with its server pointed at the
/// cluster's API endpoint.
pub struct KubeBootstrapProbe {
    cluster: String,
    kubeconfig: Option<Secret>,
    server: Option<String>,
    client: OnceCell<Client>,
}

impl KubeBootstrapProbe {
    /// A probe for `cluster`; the client is built on first use
    pub fn new(cluster: &Cluster) -> Self {
        Self {
            cluster: cluster.id.clone(),
            kubeconfig: cluster.properties.admin_kubeconfig.clone(),
            server: None,
            client: OnceCell::new(),
        }
    }

    /// Use `kubeconfig` against `server` instead of the cluster's own
    pub fn with_kubeconfig(mut self, kubeconfig: Secret, server: impl Into<String>) -> Self {
        self.kubeconfig = Some(kubeconfig);
        self.server = Some(server.into());
        self
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let raw = self.kubeconfig.as_ref().ok_or_else(|| {
                    self.error("cluster has no admin kubeconfig and no bootstrap kubeconfig is configured")
                })?;
                let kubeconfig = parse_kubeconfig(raw.expose(), self.server.as_deref())
                    .map_err(|e| self.error(e))?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| self.error(format!("failed to build config: {}", e)))?;
                Client::try_from(config)
                    .map_err(|e| self.error(format!("failed to create client: {}", e)))
            })
            .await
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::install(&self.cluster, InstallPhase::AwaitBootstrap.as_str(), message)
    }
}

#[async_trait]
impl BootstrapProbe for KubeBootstrapProbe {
    async fn is_complete(&self) -> Result<bool> {
        let client = self.client().await?.clone();
        let config_maps: Api<ConfigMap> = Api::namespaced(client, BOOTSTRAP_NAMESPACE);
        let config_map = config_maps
            .get_opt(BOOTSTRAP_CONFIGMAP)
            .await
            .map_err(|e| Error::provider_for(&self.cluster, "kubernetes", e.to_string()))?;
        Ok(is_bootstrap_complete(config_map.as_ref()))
    }
}

/// Parse a kubeconfig, optionally pointing every cluster entry at `server`
fn parse_kubeconfig(raw: &str, server: Option<&str>) -> std::result::Result<Kubeconfig, String> {
    let mut kubeconfig: Kubeconfig =
        serde_yaml::from_str(raw).map_err(|e| format!("invalid kubeconfig: {}", e))?;
    if let Some(server) = server {
        for named in &mut kubeconfig.clusters {
            if let Some(cluster) = named.cluster.as_mut() {
                cluster.server = Some(server.to_string());
            }
        }
    }
    Ok(kubeconfig)
}

fn is_bootstrap_complete(config_map: Option<&ConfigMap>) -> bool {
    config_map
        .and_then(|cm| cm.data.as_ref())
        .and_then(|data| data.get("status"))
        .is_some_and(|status| status == "complete")
}

/// Builds [`KubeBootstrapProbe`]s
#[derive(Clone, Debug, Default)]
pub struct KubeProbeFactory {
    fallback: Option<FallbackKubeconfig>,
}

#[derive(Clone, Debug)]
struct FallbackKubeconfig {
    kubeconfig: Secret,
    base_domain: String,
}

impl KubeProbeFactory {
    /// Probes that rely on each cluster's admin kubeconfig
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `kubeconfig` for clusters that have no admin kubeconfig
    ///
    /// Its server is replaced with `https://api.{domainName}.{base_domain}:6443`.
    pub fn with_fallback(mut self, kubeconfig: Secret, base_domain: impl Into<String>) -> Self {
        self.fallback = Some(FallbackKubeconfig {
            kubeconfig,
            base_domain: base_domain.into(),
        });
        self
    }

    fn probe(&self, cluster: &Cluster) -> KubeBootstrapProbe {
        let probe = KubeBootstrapProbe::new(cluster);
        match &self.fallback {
            Some(fallback) if cluster.properties.admin_kubeconfig.is_none() => {
                let server = format!(
                    "https://api.{}.{}:6443",
                    cluster.properties.domain_name, fallback.base_domain
                );
                probe.with_kubeconfig(fallback.kubeconfig.clone(), server)
            }
            _ => probe,
        }
    }
}

impl ProbeFactory for KubeProbeFactory {
    fn probe_for(&self, cluster: &Cluster) -> Box<dyn BootstrapProbe> {
        Box::new(self.probe(cluster))
    }
}
