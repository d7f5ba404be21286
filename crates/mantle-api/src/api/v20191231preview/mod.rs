//! API version 2019-12-31-preview

mod validate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mantle_common::model::{self, Cluster, ProvisioningState, Secret};
use mantle_common::{Error, Result};

use super::{Converter, RequestContext};
use crate::error::CloudError;

/// An OpenShift cluster as seen by clients
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OpenShiftCluster {
    /// Resource id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Resource name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Resource type
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    /// Region
    #[serde(default)]
    pub location: String,
    /// Resource tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Cluster properties
    #[serde(default)]
    pub properties: Properties,
}

/// Cluster properties
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Properties {
    /// Read-only lifecycle state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<ProvisioningState>,
    /// Cloud credentials of the cluster
    #[serde(default)]
    pub service_principal_profile: ServicePrincipalProfile,
    /// Pod and service networks
    #[serde(default)]
    pub network_profile: NetworkProfile,
    /// Control plane profile
    #[serde(default)]
    pub master_profile: MasterProfile,
    /// Compute pools
    #[serde(default)]
    pub worker_profiles: Vec<WorkerProfile>,
    /// Read-only API server URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apiserver_url: Option<String>,
    /// Read-only console URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_url: Option<String>,
}

/// Cloud credentials
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServicePrincipalProfile {
    /// Application id
    #[serde(default)]
    pub client_id: String,
    /// Application secret; write-only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
}

/// Pod and service networks
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkProfile {
    /// Pod network CIDR
    #[serde(default)]
    pub pod_cidr: String,
    /// Service network CIDR
    #[serde(default)]
    pub service_cidr: String,
}

/// Control plane profile
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MasterProfile {
    /// VM size
    #[serde(default)]
    pub vm_size: String,
    /// Subnet resource id
    #[serde(default)]
    pub subnet_id: String,
}

/// Compute pool
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerProfile {
    /// Pool name
    #[serde(default)]
    pub name: String,
    /// VM size
    #[serde(default)]
    pub vm_size: String,
    /// OS disk size
    #[serde(rename = "diskSizeGB", default)]
    pub disk_size_gb: u32,
    /// Subnet resource id
    #[serde(default)]
    pub subnet_id: String,
    /// Replica count
    #[serde(default)]
    pub count: u32,
}

/// Admin credentials of a cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Password of the `kubeadmin` user
    pub kubeadmin_password: String,
}

impl From<&Cluster> for OpenShiftCluster {
    fn from(cluster: &Cluster) -> Self {
        let props = &cluster.properties;
        Self {
            id: cluster.id.clone(),
            name: cluster.name.clone(),
            resource_type: cluster.resource_type.clone(),
            location: cluster.location.clone(),
            tags: cluster.tags.clone(),
            properties: Properties {
                provisioning_state: Some(props.provisioning_state),
                service_principal_profile: ServicePrincipalProfile {
                    client_id: props.service_principal_profile.client_id.clone(),
                    client_secret: props
                        .service_principal_profile
                        .client_secret
                        .expose()
                        .to_string(),
                },
                network_profile: NetworkProfile {
                    pod_cidr: props.network_profile.pod_cidr.clone(),
                    service_cidr: props.network_profile.service_cidr.clone(),
                },
                master_profile: MasterProfile {
                    vm_size: props.master_profile.vm_size.clone(),
                    subnet_id: props.master_profile.subnet_id.clone(),
                },
                worker_profiles: props
                    .worker_profiles
                    .iter()
                    .map(|w| WorkerProfile {
                        name: w.name.clone(),
                        vm_size: w.vm_size.clone(),
                        disk_size_gb: w.disk_size_gb,
                        subnet_id: w.subnet_id.clone(),
                        count: w.count,
                    })
                    .collect(),
                apiserver_url: props.apiserver_url.clone(),
                console_url: props.console_url.clone(),
            },
        }
    }
}

impl OpenShiftCluster {
    /// Write the client-settable fields into `cluster`
    ///
    /// Read-only fields are ignored, and an empty client secret keeps the
    /// stored one.
    fn apply_to(self, tenant_id: &str, cluster: &mut Cluster) {
        if cluster.location.is_empty() {
            cluster.location = self.location;
        }
        cluster.tags = self.tags;

        let props = &mut cluster.properties;
        let input = self.properties;
        props.network_profile = model::NetworkProfile {
            pod_cidr: input.network_profile.pod_cidr,
            service_cidr: input.network_profile.service_cidr,
        };
        props.master_profile = model::MasterProfile {
            vm_size: input.master_profile.vm_size,
            subnet_id: input.master_profile.subnet_id,
        };
        props.worker_profiles = input
            .worker_profiles
            .into_iter()
            .map(|w| model::WorkerProfile {
                name: w.name,
                vm_size: w.vm_size,
                disk_size_gb: w.disk_size_gb,
                subnet_id: w.subnet_id,
                count: w.count,
            })
            .collect();

        let sp = &mut props.service_principal_profile;
        sp.tenant_id = tenant_id.to_string();
        sp.client_id = input.service_principal_profile.client_id;
        if !input.service_principal_profile.client_secret.is_empty() {
            sp.client_secret = Secret::new(input.service_principal_profile.client_secret);
        }
    }
}

/// Converter for `openShiftClusters` at this version
#[derive(Clone, Copy, Debug, Default)]
pub struct ClusterConverter;

impl Converter for ClusterConverter {
    fn to_external(&self, cluster: &Cluster) -> Result<Value> {
        serde_json::to_value(OpenShiftCluster::from(cluster))
            .map_err(|e| Error::serialization_for_kind("OpenShiftCluster", e.to_string()))
    }

    fn credentials_to_external(&self, cluster: &Cluster) -> Result<Value> {
        let credentials = Credentials {
            kubeadmin_password: cluster.properties.kubeadmin_password.expose().to_string(),
        };
        serde_json::to_value(credentials)
            .map_err(|e| Error::serialization_for_kind("Credentials", e.to_string()))
    }

    fn apply(
        &self,
        external: Value,
        ctx: &RequestContext<'_>,
        current: Option<&Cluster>,
        cluster: &mut Cluster,
    ) -> std::result::Result<(), CloudError> {
        let external: OpenShiftCluster =
            serde_json::from_value(external).map_err(CloudError::invalid_request_content)?;
        validate::validate(&external, ctx, current)?;
        external.apply_to(ctx.tenant_id, cluster);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) const RESOURCE_ID: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.RedHatOpenShift/openShiftClusters/dev";
    pub(crate) const MASTER_SUBNET: &str = "/subscriptions/sub/resourceGroups/vnet-rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets/master";
    pub(crate) const WORKER_SUBNET: &str = "/subscriptions/sub/resourceGroups/vnet-rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets/worker";

    /// A request body that passes validation
    pub(crate) fn valid_body() -> Value {
        json!({
            "location": "eastus",
            "tags": {"env": "dev"},
            "properties": {
                "servicePrincipalProfile": {"clientId": "app", "clientSecret": "s3cret"},
                "networkProfile": {"podCidr": "10.128.0.0/14", "serviceCidr": "172.30.0.0/16"},
                "masterProfile": {"vmSize": "Standard_D8s_v3", "subnetId": MASTER_SUBNET},
                "workerProfiles": [{
                    "name": "worker",
                    "vmSize": "Standard_D4s_v3",
                    "diskSizeGB": 128,
                    "subnetId": WORKER_SUBNET,
                    "count": 3,
                }],
            },
        })
    }

    pub(crate) fn ctx() -> RequestContext<'static> {
        RequestContext {
            resource_id: RESOURCE_ID,
            name: "dev",
            resource_type: "Microsoft.RedHatOpenShift/openShiftClusters",
            location: "eastus",
            tenant_id: "tenant",
        }
    }

    #[test]
    fn apply_copies_settable_fields() {
        let mut cluster = Cluster::default();
        ClusterConverter
            .apply(valid_body(), &ctx(), None, &mut cluster)
            .expect("valid body");

        let props = &cluster.properties;
        assert_eq!(cluster.location, "eastus");
        assert_eq!(cluster.tags.get("env").map(String::as_str), Some("dev"));
        assert_eq!(props.network_profile.pod_cidr, "10.128.0.0/14");
        assert_eq!(props.worker_profiles.len(), 1);
        assert_eq!(props.worker_profiles[0].disk_size_gb, 128);
        assert_eq!(props.service_principal_profile.tenant_id, "tenant");
        assert_eq!(props.service_principal_profile.client_secret.expose(), "s3cret");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut body = valid_body();
        body["properties"]["masterProfile"]["zones"] = json!(["1"]);
        let err = ClusterConverter
            .apply(body, &ctx(), None, &mut Cluster::default())
            .expect_err("unknown field");
        assert_eq!(err.code, crate::error::codes::INVALID_REQUEST_CONTENT);
    }

    #[test]
    fn read_only_fields_are_ignored() {
        let mut body = valid_body();
        body["properties"]["provisioningState"] = json!("Succeeded");
        body["properties"]["apiserverUrl"] = json!("https://evil/");
        let mut cluster = Cluster::default();
        ClusterConverter
            .apply(body, &ctx(), None, &mut cluster)
            .expect("read-only fields decode");
        assert_eq!(
            cluster.properties.provisioning_state,
            ProvisioningState::Creating
        );
        assert!(cluster.properties.apiserver_url.is_none());
    }

    #[test]
    fn absent_secret_keeps_the_stored_one() {
        let mut cluster = Cluster::default();
        ClusterConverter
            .apply(valid_body(), &ctx(), None, &mut cluster)
            .expect("create");
        let current = cluster.clone();

        let mut body = valid_body();
        body["properties"]["servicePrincipalProfile"] = json!({"clientId": "app"});
        ClusterConverter
            .apply(body, &ctx(), Some(&current), &mut cluster)
            .expect("update without secret");
        assert_eq!(
            cluster.properties.service_principal_profile.client_secret.expose(),
            "s3cret"
        );
    }

    #[test]
    fn external_projection_omits_empty_secret() {
        let mut cluster = Cluster::default();
        ClusterConverter
            .apply(valid_body(), &ctx(), None, &mut cluster)
            .expect("create");
        cluster.scrub_secrets();
        let external = ClusterConverter.to_external(&cluster).expect("serialize");
        assert!(external["properties"]["servicePrincipalProfile"]
            .get("clientSecret")
            .is_none());
        assert_eq!(external["properties"]["provisioningState"], "Creating");
        assert_eq!(
            external["properties"]["workerProfiles"][0]["diskSizeGB"],
            128
        );
    }

    #[test]
    fn credentials_hold_only_the_password() {
        let mut cluster = Cluster::default();
        cluster.properties.kubeadmin_password = Secret::new("abcde-fghij-klmno-pqrst");
        cluster.properties.service_principal_profile.client_secret = Secret::new("s");
        let credentials = ClusterConverter
            .credentials_to_external(&cluster)
            .expect("serialize");
        assert_eq!(
            credentials,
            json!({"kubeadminPassword": "abcde-fghij-klmno-pqrst"})
        );
    }
}
