//! Service-level settings shared by the frontend and the backend

use crate::model::Secret;

/// Fixed values the service contributes to every cluster
///
/// None of these come from a cluster document. The base domain is
/// discovered at startup from the single DNS zone in the service resource
/// group.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Region this service instance serves
    pub location: String,
    /// Tenant of the service's own identity
    pub tenant_id: String,
    /// Subscription hosting service-owned resources
    pub subscription_id: String,
    /// Resource group holding the public DNS zone
    pub resource_group: String,
    /// Registry pull secret injected into every install config
    pub pull_secret: Secret,
    /// Public DNS zone clusters are registered under
    pub base_domain: String,
}

impl Settings {
    /// Fully qualified domain of a cluster
    pub fn cluster_domain(&self, domain_name: &str) -> String {
        format!("{}.{}", domain_name, self.base_domain)
    }
}
