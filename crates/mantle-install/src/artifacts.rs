//! Generated install artifacts
//!
//! Each artifact is plain data derived from the cluster document and the
//! service [`Settings`]. Constructors are pure: no clocks, no randomness.
//! Anything random was generated once when the document was created.

use std::fmt;

use serde::Serialize;

use mantle_common::generate::ssh_public_key;
use mantle_common::model::{Cluster, ResourceId, Secret, SubnetId};
use mantle_common::{Error, Result, Settings};

/// Control plane replica count
pub const MASTER_REPLICAS: u32 = 3;

/// Default OS disk size of control plane machines
pub const MASTER_DISK_SIZE_GB: u32 = 1024;

/// Availability zones machines are spread across
pub const ZONES: u32 = 3;

/// Installer configuration for one cluster
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfig {
    /// Schema version
    pub api_version: String,
    /// Cluster metadata
    pub metadata: ObjectMeta,
    /// Public key authorised on every node
    pub ssh_key: String,
    /// Public DNS zone the cluster lives under
    pub base_domain: String,
    /// Cluster networks
    pub networking: Networking,
    /// Control plane pool
    pub control_plane: MachinePool,
    /// Compute pools
    pub compute: Vec<MachinePool>,
    /// Azure platform settings
    pub platform: Platform,
    /// Registry pull secret
    pub pull_secret: Secret,
    /// Endpoint publishing strategy
    pub publish: String,
}

impl InstallConfig {
    /// Cluster name (the DNS label under the base domain)
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Fully qualified cluster domain, also the private zone name
    pub fn cluster_domain(&self) -> String {
        format!("{}.{}", self.metadata.name, self.base_domain)
    }
}

/// Name-only object metadata
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObjectMeta {
    /// Object name
    pub name: String,
}

/// Cluster network layout
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    /// Machine network; unused placeholder since machines use existing subnets
    #[serde(rename = "machineCIDR")]
    pub machine_cidr: String,
    /// SDN plugin
    pub network_type: String,
    /// Pod networks
    pub cluster_network: Vec<ClusterNetworkEntry>,
    /// Service networks
    pub service_network: Vec<String>,
}

/// One pod network block
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkEntry {
    /// Pod CIDR
    pub cidr: String,
    /// Per-node prefix length
    pub host_prefix: u8,
}

/// A named group of identical machines
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePool {
    /// Pool name
    pub name: String,
    /// Machine count
    pub replicas: u32,
    /// SMT setting
    pub hyperthreading: String,
    /// Azure machine settings
    pub platform: MachinePoolPlatform,
}

/// Azure settings of a machine pool
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolPlatform {
    /// VM size
    pub instance_type: String,
    /// OS disk size
    #[serde(rename = "osDiskSizeGB")]
    pub os_disk_size_gb: u32,
}

/// Azure platform settings of the cluster
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Region
    pub region: String,
    /// Cluster resource group
    pub resource_group_name: String,
    /// Resource group of the public DNS zone
    pub base_domain_resource_group_name: String,
    /// Resource group of the customer virtual network
    pub network_resource_group_name: String,
    /// Customer virtual network
    pub virtual_network: String,
    /// Subnet of the control plane
    pub control_plane_subnet: String,
    /// Subnet of the compute pool
    pub compute_subnet: String,
}

/// Credentials the installer acts with
#[derive(Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformCredentials {
    /// AAD tenant
    pub tenant_id: String,
    /// Application id
    pub client_id: String,
    /// Application secret
    pub client_secret: Secret,
    /// Subscription of the cluster resource
    pub subscription_id: String,
}

impl fmt::Debug for PlatformCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret)
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

/// One control plane machine
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Machine name
    pub name: String,
    /// Availability zone
    pub zone: u32,
    /// VM size
    pub vm_size: String,
    /// OS disk size
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: u32,
}

/// One compute machine set (one per zone)
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSet {
    /// Machine set name
    pub name: String,
    /// Availability zone
    pub zone: u32,
    /// Replicas in this zone
    pub replicas: u32,
    /// VM size
    pub vm_size: String,
    /// OS disk size
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: u32,
    /// Subnet name
    pub subnet: String,
}

/// Ignition pointer config fetched by a node on first boot
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Ignition {
    /// Ignition document
    pub ignition: IgnitionSpec,
}

/// Body of an ignition pointer config
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IgnitionSpec {
    /// Spec version
    pub version: String,
    /// Remote configs to merge
    pub config: IgnitionConfig,
}

/// Remote config references
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IgnitionConfig {
    /// Appended sources
    pub append: Vec<IgnitionSource>,
}

/// One remote config
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IgnitionSource {
    /// URL of the config
    pub source: String,
}

/// Build the install config from a cluster and service settings
pub fn build_install_config(cluster: &Cluster, settings: &Settings, ssh_key: &str) -> Result<InstallConfig> {
    let props = &cluster.properties;
    let worker = props.worker_profiles.first().ok_or_else(|| {
        Error::validation_for_field(&cluster.id, "properties.workerProfiles", "no worker profile")
    })?;
    let master_subnet = SubnetId::parse(&props.master_profile.subnet_id)?;
    let worker_subnet = SubnetId::parse(&worker.subnet_id)?;

    Ok(InstallConfig {
        api_version: "v1".to_string(),
        metadata: ObjectMeta {
            name: props.domain_name.clone(),
        },
        ssh_key: ssh_key.to_string(),
        base_domain: settings.base_domain.clone(),
        networking: Networking {
            machine_cidr: "127.0.0.0/8".to_string(),
            network_type: "OpenShiftSDN".to_string(),
            cluster_network: vec![ClusterNetworkEntry {
                cidr: props.network_profile.pod_cidr.clone(),
                host_prefix: 23,
            }],
            service_network: vec![props.network_profile.service_cidr.clone()],
        },
        control_plane: MachinePool {
            name: "master".to_string(),
            replicas: MASTER_REPLICAS,
            hyperthreading: "Enabled".to_string(),
            platform: MachinePoolPlatform {
                instance_type: props.master_profile.vm_size.clone(),
                os_disk_size_gb: MASTER_DISK_SIZE_GB,
            },
        },
        compute: vec![MachinePool {
            name: worker.name.clone(),
            replicas: worker.count,
            hyperthreading: "Enabled".to_string(),
            platform: MachinePoolPlatform {
                instance_type: worker.vm_size.clone(),
                os_disk_size_gb: worker.disk_size_gb,
            },
        }],
        platform: Platform {
            region: cluster.location.clone(),
            resource_group_name: props.resource_group.clone(),
            base_domain_resource_group_name: settings.resource_group.clone(),
            network_resource_group_name: master_subnet.resource_group.clone(),
            virtual_network: master_subnet.virtual_network.clone(),
            control_plane_subnet: master_subnet.subnet,
            compute_subnet: worker_subnet.subnet,
        },
        pull_secret: settings.pull_secret.clone(),
        publish: "External".to_string(),
    })
}

/// Public key line for the cluster's stored private key
pub fn build_ssh_public_key(cluster: &Cluster) -> Result<String> {
    ssh_public_key(cluster.properties.ssh_key.expose())
}

/// Credentials from the cluster's service principal
pub fn build_platform_credentials(cluster: &Cluster) -> Result<PlatformCredentials> {
    let id = ResourceId::parse(&cluster.id)?;
    let sp = &cluster.properties.service_principal_profile;
    Ok(PlatformCredentials {
        tenant_id: sp.tenant_id.clone(),
        client_id: sp.client_id.clone(),
        client_secret: sp.client_secret.clone(),
        subscription_id: id.subscription,
    })
}

/// Control plane machines, one per zone
pub fn build_master_machines(cluster_id: &str, config: &InstallConfig) -> Vec<Machine> {
    let pool = &config.control_plane;
    (0..pool.replicas)
        .map(|i| Machine {
            name: format!("{}-master-{}", cluster_id, i),
            zone: i % ZONES + 1,
            vm_size: pool.platform.instance_type.clone(),
            disk_size_gb: pool.platform.os_disk_size_gb,
        })
        .collect()
}

/// Compute machine sets, replicas spread evenly across zones
pub fn build_worker_machine_sets(cluster_id: &str, config: &InstallConfig) -> Vec<MachineSet> {
    config
        .compute
        .iter()
        .flat_map(|pool| {
            (0..ZONES).map(move |z| MachineSet {
                name: format!("{}-{}-{}{}", cluster_id, pool.name, config.platform.region, z + 1),
                zone: z + 1,
                replicas: pool.replicas / ZONES + u32::from(z < pool.replicas % ZONES),
                vm_size: pool.platform.instance_type.clone(),
                disk_size_gb: pool.platform.os_disk_size_gb,
                subnet: config.platform.compute_subnet.clone(),
            })
        })
        .collect()
}

/// Pointer ignition for a machine role, served by the machine config server
pub fn build_pointer_ignition(config: &InstallConfig, role: &str) -> Ignition {
    Ignition {
        ignition: IgnitionSpec {
            version: "2.2.0".to_string(),
            config: IgnitionConfig {
                append: vec![IgnitionSource {
                    source: format!(
                        "https://api-int.{}:22623/config/{}",
                        config.cluster_domain(),
                        role
                    ),
                }],
            },
        },
    }
}
