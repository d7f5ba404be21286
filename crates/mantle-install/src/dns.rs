//! Public DNS registration
//!
//! The service owns exactly one public DNS zone in its own resource group.
//! Each cluster gets one CNAME in it, `api.{domainName}`, pointing at the
//! DNS label of the cluster's public API address.

use std::sync::Arc;

use tracing::info;

use mantle_common::model::Cluster;
use mantle_common::{Error, Result};

use crate::azure::RecordSets;

/// TTL of public cluster records, in seconds
pub const DNS_TTL: u64 = 300;

/// Record name of a cluster's API endpoint, relative to the zone
pub fn api_record_name(cluster: &Cluster) -> String {
    format!("api.{}", cluster.properties.domain_name)
}

/// Address the API record points at
pub fn api_record_target(cluster: &Cluster) -> String {
    format!(
        "{}.{}.cloudapp.azure.com",
        cluster.properties.cluster_id, cluster.location
    )
}

/// Upserts and deletes cluster records in the service zone
pub struct DnsRegistrar {
    record_sets: Arc<dyn RecordSets>,
    subscription: String,
    resource_group: String,
    zone: String,
}

impl DnsRegistrar {
    /// Find the service zone
    ///
    /// Fails unless the resource group holds exactly one zone; the zone
    /// name becomes the base domain of every cluster.
    pub async fn discover(
        record_sets: Arc<dyn RecordSets>,
        subscription: &str,
        resource_group: &str,
    ) -> Result<Self> {
        let mut zones = record_sets.list_zones(subscription, resource_group).await?;
        if zones.len() != 1 {
            return Err(Error::internal_with_context(
                "dns",
                format!(
                    "expected exactly one DNS zone in {}, found {}",
                    resource_group,
                    zones.len()
                ),
            ));
        }
        let zone = zones.remove(0);
        info!(zone = %zone, "discovered service DNS zone");
        Ok(Self::new(record_sets, subscription, resource_group, zone))
    }

    /// A registrar for a known zone
    pub fn new(
        record_sets: Arc<dyn RecordSets>,
        subscription: impl Into<String>,
        resource_group: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            record_sets,
            subscription: subscription.into(),
            resource_group: resource_group.into(),
            zone: zone.into(),
        }
    }

    /// The zone name (the service base domain)
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Point `record` at `target`, replacing any previous value
    pub async fn upsert(&self, record: &str, target: &str) -> Result<()> {
        self.record_sets
            .create_or_update_cname(
                &self.subscription,
                &self.resource_group,
                &self.zone,
                record,
                target,
                DNS_TTL,
            )
            .await?;
        info!(record = %record, target = %target, "upserted DNS record");
        Ok(())
    }

    /// Remove `record`; a missing record is not an error
    pub async fn delete(&self, record: &str) -> Result<()> {
        self.record_sets
            .delete_cname(&self.subscription, &self.resource_group, &self.zone, record)
            .await?;
        info!(record = %record, "deleted DNS record");
        Ok(())
    }

    /// Register the cluster's public API record
    pub async fn register(&self, cluster: &Cluster) -> Result<()> {
        self.upsert(&api_record_name(cluster), &api_record_target(cluster))
            .await
    }

    /// Remove the cluster's public API record
    pub async fn unregister(&self, cluster: &Cluster) -> Result<()> {
        self.delete(&api_record_name(cluster)).await
    }
}
