//! Internal cluster representation
//!
//! This is the shape persisted inside a [`ClusterDocument`](super::ClusterDocument).
//! External API versions convert to and from it; nothing here is exposed
//! on the wire directly.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse lifecycle phase of a cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningState {
    /// Initial install is running
    #[default]
    Creating,
    /// A change to a running cluster is being persisted
    Updating,
    /// Teardown is in progress
    Deleting,
    /// The last operation completed
    Succeeded,
    /// The last operation failed and halted
    Failed,
}

impl ProvisioningState {
    /// True for states that accept a new client operation
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Wire name of the state
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "Creating",
            Self::Updating => "Updating",
            Self::Deleting => "Deleting",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secret string that never appears in `Debug` output
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret value
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// True when no secret is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(<redacted>)")
        }
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A cluster resource: identity plus properties
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Full resource id as first seen at creation
    pub id: String,
    /// Resource name
    pub name: String,
    /// Resource type (`Microsoft.RedHatOpenShift/openShiftClusters`)
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Azure region, immutable after creation
    pub location: String,
    /// Resource tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Specification and status
    pub properties: Properties,
}

/// Cluster specification plus server-generated state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    /// Current lifecycle phase
    pub provisioning_state: ProvisioningState,
    /// Infrastructure slug; prefix of every generated resource name
    #[serde(default)]
    pub cluster_id: String,
    /// DNS label of the cluster under the service base domain
    #[serde(default)]
    pub domain_name: String,
    /// Pod and service networks
    pub network_profile: NetworkProfile,
    /// Control plane machines
    pub master_profile: MasterProfile,
    /// Compute pools
    #[serde(default)]
    pub worker_profiles: Vec<WorkerProfile>,
    /// Credentials the cluster uses against the cloud
    pub service_principal_profile: ServicePrincipalProfile,
    /// Resource group holding the cluster infrastructure
    #[serde(default)]
    pub resource_group: String,
    /// Random suffix of the cluster storage account
    #[serde(default)]
    pub storage_suffix: String,
    /// PKCS#8 Ed25519 private key, base64
    #[serde(default)]
    pub ssh_key: Secret,
    /// Generated admin password
    #[serde(default)]
    pub kubeadmin_password: Secret,
    /// Admin kubeconfig for the new cluster, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_kubeconfig: Option<Secret>,
    /// API server URL, set when the install succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apiserver_url: Option<String>,
    /// Web console URL, set when the install succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_url: Option<String>,
    /// Install progress; present only while Creating (or after a failed create)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation: Option<Installation>,
    /// Error that moved the cluster to Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FailureRecord>,
}

/// Pod and service address ranges
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    /// Pod network CIDR
    pub pod_cidr: String,
    /// Service network CIDR
    pub service_cidr: String,
}

/// Control plane machine profile
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterProfile {
    /// VM size of every master
    pub vm_size: String,
    /// Subnet resource id the masters attach to
    pub subnet_id: String,
}

/// One compute pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProfile {
    /// Pool name
    pub name: String,
    /// VM size of every worker
    pub vm_size: String,
    /// OS disk size
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: u32,
    /// Subnet resource id the workers attach to
    pub subnet_id: String,
    /// Replica count
    pub count: u32,
}

/// Credentials the cluster uses to manage its own infrastructure
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePrincipalProfile {
    /// AAD tenant
    #[serde(default)]
    pub tenant_id: String,
    /// Application id
    pub client_id: String,
    /// Application secret; scrubbed from every response
    pub client_secret: Secret,
}

/// Install progress for a cluster being created
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    /// Stage about to run or running
    pub phase: InstallPhase,
    /// When the install was first requested; anchors time-bound artifacts
    pub now: DateTime<Utc>,
}

impl Installation {
    /// A fresh install record starting at the first stage
    pub fn started_at(now: DateTime<Utc>) -> Self {
        Self {
            phase: InstallPhase::DeployStorage,
            now,
        }
    }
}

/// Install pipeline stages, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstallPhase {
    /// Identity and storage account deployment
    DeployStorage,
    /// Core infrastructure deployment
    DeployResources,
    /// Public DNS registration
    RegisterDns,
    /// Waiting for the in-cluster bootstrap signal
    AwaitBootstrap,
}

impl InstallPhase {
    /// Stable identifier used in logs and errors
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeployStorage => "deploy-storage",
            Self::DeployResources => "deploy-resources",
            Self::RegisterDns => "register-dns",
            Self::AwaitBootstrap => "await-bootstrap",
        }
    }
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic record of the error that failed an operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    /// Stage or operation that failed
    pub stage: String,
    /// Error text
    pub message: String,
    /// When the failure was recorded
    pub at: DateTime<Utc>,
}

impl Cluster {
    /// Clear every secret so the value can leave the service
    pub fn scrub_secrets(&mut self) {
        let props = &mut self.properties;
        props.service_principal_profile.client_secret = Secret::default();
        props.ssh_key = Secret::default();
        props.kubeadmin_password = Secret::default();
        props.admin_kubeconfig = None;
    }
}
