//! Persisted data model
//!
//! A [`ClusterDocument`] is the unit of storage and of optimistic
//! concurrency: one document per cluster, addressed by its lower-cased
//! resource path, versioned by an opaque etag the store rewrites on every
//! write.

mod cluster;
mod ids;

pub use cluster::{
    Cluster, FailureRecord, InstallPhase, Installation, MasterProfile, NetworkProfile, Properties,
    ProvisioningState, Secret, ServicePrincipalProfile, WorkerProfile,
};
pub use ids::{resource_key, ResourceId, SubnetId};

use serde::{Deserialize, Serialize};

/// Resource provider namespace served by this service
pub const RESOURCE_PROVIDER_NAMESPACE: &str = "Microsoft.RedHatOpenShift";

/// Resource type served by this service
pub const RESOURCE_TYPE_CLUSTERS: &str = "openShiftClusters";

/// One persisted cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDocument {
    /// Server-assigned document id, immutable
    pub id: String,
    /// Lower-cased resource path, unique per store
    pub key: String,
    /// Concurrency token; owned by the store and round-tripped untouched
    #[serde(rename = "_etag", default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
    /// Embedded cluster
    pub cluster: Cluster,
}

impl ClusterDocument {
    /// A document that has never been written
    pub fn new(id: impl Into<String>, key: impl Into<String>, cluster: Cluster) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            etag: String::new(),
            cluster,
        }
    }

    /// Current provisioning state of the embedded cluster
    pub fn state(&self) -> ProvisioningState {
        self.cluster.properties.provisioning_state
    }
}

/// Fully qualified resource type (`namespace/type`)
pub fn qualified_resource_type() -> String {
    format!("{}/{}", RESOURCE_PROVIDER_NAMESPACE, RESOURCE_TYPE_CLUSTERS)
}
