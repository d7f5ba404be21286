//! Azure resource id parsing

use std::fmt;

use crate::Error;

/// Normalise a resource path into a document key
pub fn resource_key(resource_id: &str) -> String {
    resource_id.trim_end_matches('/').to_lowercase()
}

/// A parsed `/subscriptions/{s}/resourceGroups/{rg}/providers/{ns}/{type}/{name}` id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceId {
    /// Subscription id
    pub subscription: String,
    /// Resource group name
    pub resource_group: String,
    /// Provider namespace
    pub namespace: String,
    /// Resource type within the namespace
    pub resource_type: String,
    /// Resource name
    pub name: String,
}

impl ResourceId {
    /// Parse a top-level resource id, preserving the original casing
    pub fn parse(id: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = id.trim_start_matches('/').split('/').collect();
        match parts.as_slice() {
            [s, sub, rg, group, p, ns, ty, name]
                if s.eq_ignore_ascii_case("subscriptions")
                    && rg.eq_ignore_ascii_case("resourceGroups")
                    && p.eq_ignore_ascii_case("providers")
                    && [sub, group, ns, ty, name].iter().all(|v| !v.is_empty()) =>
            {
                Ok(Self {
                    subscription: sub.to_string(),
                    resource_group: group.to_string(),
                    namespace: ns.to_string(),
                    resource_type: ty.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(Error::validation(format!("invalid resource id '{}'", id))),
        }
    }

    /// Document key for this resource
    pub fn key(&self) -> String {
        resource_key(&self.to_string())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}",
            self.subscription, self.resource_group, self.namespace, self.resource_type, self.name
        )
    }
}

/// A parsed virtual network subnet id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetId {
    /// Subscription of the virtual network
    pub subscription: String,
    /// Resource group of the virtual network
    pub resource_group: String,
    /// Virtual network name
    pub virtual_network: String,
    /// Subnet name
    pub subnet: String,
}

impl SubnetId {
    /// Parse `/subscriptions/{s}/resourceGroups/{rg}/providers/Microsoft.Network/virtualNetworks/{vnet}/subnets/{subnet}`
    pub fn parse(id: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = id.trim_start_matches('/').split('/').collect();
        match parts.as_slice() {
            [s, sub, rg, group, p, ns, vn, vnet, sn, subnet]
                if s.eq_ignore_ascii_case("subscriptions")
                    && rg.eq_ignore_ascii_case("resourceGroups")
                    && p.eq_ignore_ascii_case("providers")
                    && ns.eq_ignore_ascii_case("Microsoft.Network")
                    && vn.eq_ignore_ascii_case("virtualNetworks")
                    && sn.eq_ignore_ascii_case("subnets")
                    && [sub, group, vnet, subnet].iter().all(|v| !v.is_empty()) =>
            {
                Ok(Self {
                    subscription: sub.to_string(),
                    resource_group: group.to_string(),
                    virtual_network: vnet.to_string(),
                    subnet: subnet.to_string(),
                })
            }
            _ => Err(Error::validation(format!("invalid subnet id '{}'", id))),
        }
    }

    /// Id of the virtual network that contains the subnet
    pub fn virtual_network_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}",
            self.subscription, self.resource_group, self.virtual_network
        )
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/subnets/{}", self.virtual_network_id(), self.subnet)
    }
}
