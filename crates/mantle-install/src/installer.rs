//! Cluster install pipeline
//!
//! One [`Installer::install`] call drives a Creating document through every
//! stage in order: resolve artifacts, deploy storage, deploy the core
//! resources, register public DNS, and wait for bootstrap. The phase about
//! to run is persisted before each stage. The attempt ends in exactly one of
//! three outcomes:
//!
//! - every stage succeeded: the document moves to Succeeded
//! - a stage failed: the document moves to Failed with the error recorded
//! - the attempt was cancelled: the document is left as it was

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use mantle_common::model::{
    ClusterDocument, FailureRecord, InstallPhase, Installation, ProvisioningState, ResourceId,
};
use mantle_common::subnet::{load_balancer_address, parse_cidr};
use mantle_common::{Error, Result, Settings};
use mantle_store::{mutate, DocumentStore};

use crate::azure::{DeploymentsClient, RecordSets, ResourceGroupsClient, SubnetClient};
use crate::deploy::Deployer;
use crate::dns::DnsRegistrar;
use crate::graph::{Resolver, RESOLVE_STAGE};
use crate::readiness::{await_completion, ProbeFactory, BOOTSTRAP_POLL_INTERVAL, BOOTSTRAP_TIMEOUT};
use crate::stages::{resources_stage, storage_stage};

/// Stage name reported when the cluster resource group cannot be created
const RESOURCE_GROUP_STAGE: &str = "ensure-resource-group";

/// How an install attempt ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The cluster is installed
    Succeeded,
    /// A stage failed; the error is on the document
    Failed,
    /// The attempt was cancelled before it finished
    Cancelled,
}

/// The ARM clients the pipeline talks to
#[derive(Clone)]
pub struct AzureClients {
    /// Template deployments
    pub deployments: Arc<dyn DeploymentsClient>,
    /// Resource groups
    pub resource_groups: Arc<dyn ResourceGroupsClient>,
    /// Subnet lookups
    pub subnets: Arc<dyn SubnetClient>,
    /// Public DNS
    pub record_sets: Arc<dyn RecordSets>,
}

/// A stage error, tagged with the stage that raised it
struct StageFailure {
    stage: &'static str,
    error: Error,
}

trait AtStage<T> {
    fn at(self, stage: &'static str) -> std::result::Result<T, StageFailure>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: &'static str) -> std::result::Result<T, StageFailure> {
        self.map_err(|error| StageFailure { stage, error })
    }
}

/// Runs install attempts
pub struct Installer {
    store: Arc<dyn DocumentStore>,
    settings: Settings,
    deployer: Deployer,
    resource_groups: Arc<dyn ResourceGroupsClient>,
    subnets: Arc<dyn SubnetClient>,
    dns: Arc<DnsRegistrar>,
    probes: Arc<dyn ProbeFactory>,
    readiness_interval: Duration,
    readiness_timeout: Duration,
}

impl Installer {
    /// An installer with production timings
    pub fn new(
        store: Arc<dyn DocumentStore>,
        settings: Settings,
        clients: &AzureClients,
        dns: Arc<DnsRegistrar>,
        probes: Arc<dyn ProbeFactory>,
    ) -> Self {
        Self {
            store,
            settings,
            deployer: Deployer::new(clients.deployments.clone()),
            resource_groups: clients.resource_groups.clone(),
            subnets: clients.subnets.clone(),
            dns,
            probes,
            readiness_interval: BOOTSTRAP_POLL_INTERVAL,
            readiness_timeout: BOOTSTRAP_TIMEOUT,
        }
    }

    /// Override the deployment poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.deployer = self.deployer.with_poll_interval(interval);
        self
    }

    /// Override the bootstrap wait
    pub fn with_readiness(mut self, interval: Duration, timeout: Duration) -> Self {
        self.readiness_interval = interval;
        self.readiness_timeout = timeout;
        self
    }

    /// Install the cluster stored under `key`
    ///
    /// Errors are returned only when the outcome itself cannot be persisted;
    /// stage errors become [`Outcome::Failed`].
    #[instrument(skip(self, cancel), fields(cluster = %key))]
    pub async fn install(&self, key: &str, cancel: &CancellationToken) -> Result<Outcome> {
        info!("install started");
        match self.run(key, cancel).await {
            Ok(doc) => {
                self.record_success(&doc, cancel).await?;
                info!("install succeeded");
                Ok(Outcome::Succeeded)
            }
            Err(StageFailure { stage, error }) if error.is_cancelled() => {
                info!(stage, "install cancelled");
                Ok(Outcome::Cancelled)
            }
            Err(StageFailure { stage, error }) => {
                error!(stage, error = %error, "install failed");
                self.record_failure(key, stage, &error, cancel).await?;
                Ok(Outcome::Failed)
            }
        }
    }

    async fn run(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<ClusterDocument, StageFailure> {
        let doc = self.start(key, cancel).await.at(RESOLVE_STAGE)?;
        let cluster = &doc.cluster;
        let subscription = ResourceId::parse(&cluster.id).at(RESOLVE_STAGE)?.subscription;
        let resource_group = cluster.properties.resource_group.clone();

        let graph = Resolver::new(cluster.clone(), self.settings.clone())
            .resolve_all()
            .at(RESOLVE_STAGE)?;

        self.resource_groups
            .create_or_update(&subscription, &resource_group, &cluster.location)
            .await
            .at(RESOURCE_GROUP_STAGE)?;

        let phase = InstallPhase::DeployStorage;
        self.enter(key, phase, cancel).await.at(phase.as_str())?;
        let stage = storage_stage(cluster).at(phase.as_str())?;
        self.deployer
            .deploy(&subscription, &resource_group, &stage, cancel)
            .await
            .at(phase.as_str())?;

        let phase = InstallPhase::DeployResources;
        self.enter(key, phase, cancel).await.at(phase.as_str())?;
        let lb_address = self.load_balancer_address(&doc).await.at(phase.as_str())?;
        let stage = resources_stage(cluster, &graph, lb_address).at(phase.as_str())?;
        self.deployer
            .deploy(&subscription, &resource_group, &stage, cancel)
            .await
            .at(phase.as_str())?;

        let phase = InstallPhase::RegisterDns;
        self.enter(key, phase, cancel).await.at(phase.as_str())?;
        self.dns.register(cluster).await.at(phase.as_str())?;

        let phase = InstallPhase::AwaitBootstrap;
        let current = self.enter(key, phase, cancel).await.at(phase.as_str())?;
        let probe = self.probes.probe_for(&current.cluster);
        await_completion(
            phase.as_str(),
            self.readiness_interval,
            self.readiness_timeout,
            cancel,
            || probe.is_complete(),
        )
        .await
        .at(phase.as_str())?;

        Ok(current)
    }

    /// Read the document and make sure it carries an installation record
    async fn start(&self, key: &str, cancel: &CancellationToken) -> Result<ClusterDocument> {
        let doc = self.store.get(key).await?;
        if doc.state() != ProvisioningState::Creating {
            return Err(Error::internal_with_context(
                "installer",
                format!("cannot install a cluster in state {}", doc.state()),
            ));
        }
        if doc.cluster.properties.installation.is_some() {
            return Ok(doc);
        }
        let now = Utc::now();
        mutate(self.store.as_ref(), key, cancel, |doc| {
            doc.cluster
                .properties
                .installation
                .get_or_insert_with(|| Installation::started_at(now));
            Ok(())
        })
        .await
    }

    /// Persist the phase about to run
    async fn enter(
        &self,
        key: &str,
        phase: InstallPhase,
        cancel: &CancellationToken,
    ) -> Result<ClusterDocument> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(phase.as_str()));
        }
        let doc = mutate(self.store.as_ref(), key, cancel, |doc| {
            if doc.state() != ProvisioningState::Creating {
                return Err(Error::install(
                    key,
                    phase.as_str(),
                    format!("cluster left Creating (now {})", doc.state()),
                ));
            }
            let now = Utc::now();
            doc.cluster
                .properties
                .installation
                .get_or_insert_with(|| Installation::started_at(now))
                .phase = phase;
            Ok(())
        })
        .await?;
        info!(stage = phase.as_str(), "entering install phase");
        Ok(doc)
    }

    async fn load_balancer_address(&self, doc: &ClusterDocument) -> Result<std::net::Ipv4Addr> {
        let subnet_id = &doc.cluster.properties.master_profile.subnet_id;
        let prefix = self.subnets.address_prefix(subnet_id).await?.ok_or_else(|| {
            Error::validation_for_field(
                &doc.key,
                "properties.masterProfile.subnetId",
                format!("subnet {} does not exist", subnet_id),
            )
        })?;
        load_balancer_address(&parse_cidr(&prefix)?)
    }

    async fn record_success(&self, doc: &ClusterDocument, cancel: &CancellationToken) -> Result<()> {
        let domain = self
            .settings
            .cluster_domain(&doc.cluster.properties.domain_name);
        mutate(self.store.as_ref(), &doc.key, cancel, |doc| {
            let props = &mut doc.cluster.properties;
            props.provisioning_state = ProvisioningState::Succeeded;
            props.installation = None;
            props.last_error = None;
            props.apiserver_url = Some(format!("https://api.{}:6443/", domain));
            props.console_url = Some(format!(
                "https://console-openshift-console.apps.{}/",
                domain
            ));
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        key: &str,
        stage: &str,
        error: &Error,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record = FailureRecord {
            stage: stage.to_string(),
            message: error.to_string(),
            at: Utc::now(),
        };
        mutate(self.store.as_ref(), key, cancel, |doc| {
            let props = &mut doc.cluster.properties;
            props.provisioning_state = ProvisioningState::Failed;
            props.last_error = Some(record.clone());
            Ok(())
        })
        .await?;
        Ok(())
    }
}
