//! Infrastructure stages of a cluster install
//!
//! Two deployments run in order: [`storage_stage`] creates the managed
//! identity and the storage account that holds the boot image and the
//! bootstrap ignition; [`resources_stage`] creates everything else the
//! control plane needs. Every name is derived from the cluster slug, so a
//! re-run of either stage updates the resources of the previous run.

use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Value};

use mantle_common::model::{Cluster, InstallPhase, SubnetId};
use mantle_common::{Error, Result};

use crate::graph::ArtifactGraph;
use crate::template::{InfrastructureStage, Resource, ResourceName, Template};

/// Deployment name of the storage stage
pub const STORAGE_DEPLOYMENT: &str = "storage";

/// Deployment name of the core resources stage
pub const RESOURCES_DEPLOYMENT: &str = "azuredeploy";

/// Built-in Contributor role
const CONTRIBUTOR_ROLE: &str = "b24988ac-6180-42a0-ab88-20f7382dd24c";

/// TTL of the api and api-int records in the private zone
const PRIVATE_API_TTL: u32 = 300;

/// TTL of the etcd discovery records
const ETCD_TTL: u32 = 60;

const ETCD_PORT: u16 = 2380;
const API_PORT: u16 = 6443;
const MACHINE_CONFIG_PORT: u16 = 22623;

const BOOTSTRAP_VM_SIZE: &str = "Standard_D4s_v3";
const BOOTSTRAP_DISK_SIZE_GB: u32 = 100;

/// How long the bootstrap ignition SAS stays valid
const SAS_VALIDITY_HOURS: i64 = 24;

mod api_version {
    pub const AUTHORIZATION: &str = "2015-07-01";
    pub const COMPUTE: &str = "2019-03-01";
    pub const MANAGED_IDENTITY: &str = "2018-11-30";
    pub const NETWORK: &str = "2019-07-01";
    pub const PRIVATE_DNS: &str = "2018-09-01";
    pub const STORAGE: &str = "2019-04-01";
}

/// Deterministic resource names of one cluster
#[derive(Clone, Debug)]
pub struct ResourceNames {
    cluster_id: String,
    storage_suffix: String,
}

impl ResourceNames {
    /// Names for a cluster
    pub fn new(cluster: &Cluster) -> Self {
        Self {
            cluster_id: cluster.properties.cluster_id.clone(),
            storage_suffix: cluster.properties.storage_suffix.clone(),
        }
    }

    /// User-assigned identity of the cluster VMs
    pub fn identity(&self) -> String {
        format!("{}-identity", self.cluster_id)
    }

    /// Storage account for the image and ignition blobs
    pub fn storage_account(&self) -> String {
        format!("cluster{}", self.storage_suffix)
    }

    /// URL of the boot image blob
    pub fn image_blob_url(&self) -> String {
        format!(
            "https://{}.blob.core.windows.net/vhd/rhcos{}.vhd",
            self.storage_account(),
            self.storage_suffix
        )
    }

    /// URL of the bootstrap ignition blob, without a SAS token
    pub fn bootstrap_ignition_url(&self) -> String {
        format!(
            "https://{}.blob.core.windows.net/ignition/bootstrap.ign",
            self.storage_account()
        )
    }

    /// Node route table
    pub fn route_table(&self) -> String {
        format!("{}-node-routetable", self.cluster_id)
    }

    /// Public IP of the bootstrap node
    pub fn bootstrap_public_ip(&self) -> String {
        format!("{}-bootstrap-pip", self.cluster_id)
    }

    /// Public IP of the API server
    pub fn public_ip(&self) -> String {
        format!("{}-pip", self.cluster_id)
    }

    /// Public load balancer
    pub fn public_lb(&self) -> String {
        format!("{}-public-lb", self.cluster_id)
    }

    /// Internal load balancer
    pub fn internal_lb(&self) -> String {
        format!("{}-internal-lb", self.cluster_id)
    }

    /// Bootstrap NIC
    pub fn bootstrap_nic(&self) -> String {
        format!("{}-bootstrap-nic", self.cluster_id)
    }

    /// Control plane NICs
    pub fn master_nic(&self) -> ResourceName {
        ResourceName::indexed(format!("{}-master", self.cluster_id), "-nic")
    }

    /// Boot image
    pub fn image(&self) -> String {
        self.cluster_id.clone()
    }

    /// Bootstrap VM
    pub fn bootstrap_vm(&self) -> String {
        format!("{}-bootstrap", self.cluster_id)
    }

    /// Control plane VMs
    pub fn master_vm(&self) -> ResourceName {
        ResourceName::indexed(format!("{}-master-", self.cluster_id), "")
    }

    /// DNS label of the public API address
    pub fn public_dns_label(&self) -> &str {
        &self.cluster_id
    }
}

/// Parameter values of the core stage
///
/// `signedStart` is the install's creation time, so re-runs submit the same
/// values and ARM sees no change.
pub fn sas_parameters(now: DateTime<Utc>) -> Value {
    let start = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let expiry =
        (now + Duration::hours(SAS_VALIDITY_HOURS)).to_rfc3339_opts(SecondsFormat::Secs, true);
    json!({
        "sas": {
            "value": {
                "signedStart": start,
                "signedExpiry": expiry,
                "signedPermission": "rl",
                "signedResourceTypes": "o",
                "signedServices": "b",
                "signedProtocol": "https",
            }
        }
    })
}

/// Managed identity and storage account
pub fn storage_stage(cluster: &Cluster) -> Result<InfrastructureStage> {
    let names = ResourceNames::new(cluster);
    let location = &cluster.location;
    let account = names.storage_account();

    let identity = Resource::new(
        "Microsoft.ManagedIdentity/userAssignedIdentities",
        ResourceName::fixed(names.identity()),
        api_version::MANAGED_IDENTITY,
    )
    .location(location);

    let storage = Resource::new(
        "Microsoft.Storage/storageAccounts",
        ResourceName::fixed(&account),
        api_version::STORAGE,
    )
    .location(location)
    .sku(json!({ "name": "Standard_LRS" }))
    .kind("StorageV2")
    .properties(json!({ "supportsHttpsTrafficOnly": true }));

    let container = |name: &str| {
        Resource::new(
            "Microsoft.Storage/storageAccounts/blobServices/containers",
            ResourceName::fixed(format!("{}/default/{}", account, name)),
            api_version::STORAGE,
        )
        .depends_on(&storage)
    };
    let ignition = container("ignition");
    let vhd = container("vhd");

    InfrastructureStage::new(
        InstallPhase::DeployStorage.as_str(),
        STORAGE_DEPLOYMENT,
        Template::new(vec![identity, storage, ignition, vhd]),
        json!({}),
    )
}

/// Core infrastructure: role binding, private DNS, load balancers, NICs,
/// image and VMs
///
/// `lb_address` is the static address of the internal load balancer on the
/// control plane subnet.
pub fn resources_stage(
    cluster: &Cluster,
    graph: &ArtifactGraph,
    lb_address: Ipv4Addr,
) -> Result<InfrastructureStage> {
    let props = &cluster.properties;
    let names = ResourceNames::new(cluster);
    let location = cluster.location.as_str();
    let config = graph.install_config()?;
    let zone_name = config.cluster_domain();
    let masters = graph.master_machines()?;
    let master = masters.first().ok_or_else(|| {
        Error::install(
            &cluster.id,
            InstallPhase::DeployResources.as_str(),
            "no control plane machines",
        )
    })?;
    let master_count = u32::try_from(masters.len()).map_err(|e| {
        Error::internal_with_context("resources stage", e.to_string())
    })?;
    let installation = props.installation.as_ref().ok_or_else(|| {
        Error::install(
            &cluster.id,
            InstallPhase::DeployResources.as_str(),
            "cluster has no installation record",
        )
    })?;
    let master_subnet = props.master_profile.subnet_id.as_str();
    let vnet_id = SubnetId::parse(master_subnet)?.virtual_network_id();
    let lb_ip = lb_address.to_string();
    let identity_id = format!(
        "[resourceId('Microsoft.ManagedIdentity/userAssignedIdentities', '{}')]",
        names.identity()
    );
    let master_ignition = STANDARD.encode(serde_json::to_vec(graph.master_ignition()?)?);

    let role_assignment = Resource::new(
        "Microsoft.Authorization/roleAssignments",
        ResourceName::fixed(format!(
            "[guid(resourceGroup().id, '{}', 'contributor')]",
            names.identity()
        )),
        api_version::AUTHORIZATION,
    )
    .properties(json!({
        "roleDefinitionId": format!(
            "[resourceId('Microsoft.Authorization/roleDefinitions', '{}')]",
            CONTRIBUTOR_ROLE
        ),
        "principalId": format!(
            "[reference({}, '{}').principalId]",
            identity_id.trim_start_matches('[').trim_end_matches(']'),
            api_version::MANAGED_IDENTITY
        ),
    }));

    let zone = Resource::new(
        "Microsoft.Network/privateDnsZones",
        ResourceName::fixed(&zone_name),
        api_version::PRIVATE_DNS,
    )
    .location("global");

    let network_link = Resource::new(
        "Microsoft.Network/privateDnsZones/virtualNetworkLinks",
        ResourceName::fixed(format!("{}/{}-network-link", zone_name, config.name())),
        api_version::PRIVATE_DNS,
    )
    .location("global")
    .properties(json!({
        "virtualNetwork": { "id": vnet_id },
        "registrationEnabled": false,
    }))
    .depends_on(&zone);

    let a_record = |label: &str| {
        Resource::new(
            "Microsoft.Network/privateDnsZones/A",
            ResourceName::fixed(format!("{}/{}", zone_name, label)),
            api_version::PRIVATE_DNS,
        )
        .properties(json!({
            "ttl": PRIVATE_API_TTL,
            "aRecords": [{ "ipv4Address": lb_ip }],
        }))
        .depends_on(&zone)
    };
    let api_int_record = a_record("api-int");
    let api_record = a_record("api");

    let route_table = Resource::new(
        "Microsoft.Network/routeTables",
        ResourceName::fixed(names.route_table()),
        api_version::NETWORK,
    )
    .location(location);

    let public_ip = |name: String, dns_label: Option<&str>| {
        let mut properties = json!({ "publicIPAllocationMethod": "Static" });
        if let Some(label) = dns_label {
            properties["dnsSettings"] = json!({ "domainNameLabel": label });
        }
        Resource::new(
            "Microsoft.Network/publicIPAddresses",
            ResourceName::fixed(name),
            api_version::NETWORK,
        )
        .location(location)
        .sku(json!({ "name": "Standard" }))
        .properties(properties)
    };
    let bootstrap_pip = public_ip(names.bootstrap_public_ip(), None);
    let api_pip = public_ip(names.public_ip(), Some(names.public_dns_label()));

    let public_lb_name = names.public_lb();
    let public_lb = Resource::new(
        "Microsoft.Network/loadBalancers",
        ResourceName::fixed(&public_lb_name),
        api_version::NETWORK,
    )
    .location(location)
    .sku(json!({ "name": "Standard" }))
    .properties(json!({
        "frontendIPConfigurations": [{
            "name": "public-lb-ip",
            "properties": {
                "publicIPAddress": {
                    "id": format!(
                        "[resourceId('Microsoft.Network/publicIPAddresses', '{}')]",
                        names.public_ip()
                    ),
                },
            },
        }],
        "backendAddressPools": [{ "name": format!("{}-public-lb-control-plane", props.cluster_id) }],
        "loadBalancingRules": [lb_rule(&public_lb_name, "api-internal", "public-lb-ip",
            &format!("{}-public-lb-control-plane", props.cluster_id), API_PORT)],
        "probes": [lb_probe("api-internal-probe", API_PORT, "/readyz")],
    }))
    .depends_on(&api_pip);

    let internal_lb_name = names.internal_lb();
    let internal_pool = format!("{}-internal-controlplane", props.cluster_id);
    let internal_lb = Resource::new(
        "Microsoft.Network/loadBalancers",
        ResourceName::fixed(&internal_lb_name),
        api_version::NETWORK,
    )
    .location(location)
    .sku(json!({ "name": "Standard" }))
    .properties(json!({
        "frontendIPConfigurations": [{
            "name": "internal-lb-ip",
            "properties": {
                "privateIPAllocationMethod": "Static",
                "privateIPAddress": lb_ip,
                "subnet": { "id": master_subnet },
            },
        }],
        "backendAddressPools": [{ "name": internal_pool }],
        "loadBalancingRules": [
            lb_rule(&internal_lb_name, "api-internal", "internal-lb-ip", &internal_pool, API_PORT),
            lb_rule(&internal_lb_name, "sint", "internal-lb-ip", &internal_pool, MACHINE_CONFIG_PORT),
        ],
        "probes": [
            lb_probe("api-internal-probe", API_PORT, "/readyz"),
            lb_probe("sint-probe", MACHINE_CONFIG_PORT, "/healthz"),
        ],
    }));

    let backend_pools = json!([
        { "id": pool_id(&public_lb_name, &format!("{}-public-lb-control-plane", props.cluster_id)) },
        { "id": pool_id(&internal_lb_name, &internal_pool) },
    ]);

    let bootstrap_nic = Resource::new(
        "Microsoft.Network/networkInterfaces",
        ResourceName::fixed(names.bootstrap_nic()),
        api_version::NETWORK,
    )
    .location(location)
    .properties(json!({
        "ipConfigurations": [{
            "name": "bootstrap-nic-ip",
            "properties": {
                "privateIPAllocationMethod": "Dynamic",
                "subnet": { "id": master_subnet },
                "publicIPAddress": {
                    "id": format!(
                        "[resourceId('Microsoft.Network/publicIPAddresses', '{}')]",
                        names.bootstrap_public_ip()
                    ),
                },
                "loadBalancerBackendAddressPools": backend_pools,
            },
        }],
    }))
    .depends_on(&bootstrap_pip)
    .depends_on(&public_lb)
    .depends_on(&internal_lb);

    let master_nic = Resource::new(
        "Microsoft.Network/networkInterfaces",
        names.master_nic(),
        api_version::NETWORK,
    )
    .location(location)
    .copies(master_count)
    .properties(json!({
        "ipConfigurations": [{
            "name": "pipConfig",
            "properties": {
                "privateIPAllocationMethod": "Dynamic",
                "subnet": { "id": master_subnet },
                "loadBalancerBackendAddressPools": backend_pools,
            },
        }],
    }))
    .depends_on(&public_lb)
    .depends_on(&internal_lb);

    let srv_record = Resource::new(
        "Microsoft.Network/privateDnsZones/SRV",
        ResourceName::fixed(format!("{}/_etcd-server-ssl._tcp", zone_name)),
        api_version::PRIVATE_DNS,
    )
    .properties(json!({
        "ttl": ETCD_TTL,
        "srvRecords": (0..master_count)
            .map(|i| json!({
                "priority": 10,
                "weight": 10,
                "port": ETCD_PORT,
                "target": format!("etcd-{}.{}", i, zone_name),
            }))
            .collect::<Vec<_>>(),
    }))
    .depends_on(&zone);

    let etcd_records = Resource::new(
        "Microsoft.Network/privateDnsZones/A",
        ResourceName::indexed(format!("{}/etcd-", zone_name), ""),
        api_version::PRIVATE_DNS,
    )
    .copies(master_count)
    .properties(json!({
        "ttl": ETCD_TTL,
        "aRecords": [{
            "ipv4Address": format!(
                "[reference(resourceId('Microsoft.Network/networkInterfaces', concat('{}-master', copyIndex(), '-nic')), '{}').ipConfigurations[0].properties.privateIPAddress]",
                props.cluster_id,
                api_version::NETWORK
            ),
        }],
    }))
    .depends_on(&zone)
    .depends_on(&master_nic);

    let image = Resource::new(
        "Microsoft.Compute/images",
        ResourceName::fixed(names.image()),
        api_version::COMPUTE,
    )
    .location(location)
    .properties(json!({
        "storageProfile": {
            "osDisk": {
                "osType": "Linux",
                "osState": "Generalized",
                "blobUri": names.image_blob_url(),
                "storageAccountType": "Premium_LRS",
            },
        },
    }));

    let mut assigned = serde_json::Map::new();
    assigned.insert(identity_id, json!({}));
    let vm_identity = json!({
        "type": "UserAssigned",
        "userAssignedIdentities": assigned,
    });

    let bootstrap_custom_data = format!(
        "[base64(concat('{{\"ignition\":{{\"version\":\"2.2.0\",\"config\":{{\"replace\":{{\"source\":\"{}?', listAccountSas(resourceId('Microsoft.Storage/storageAccounts', '{}'), '{}', parameters('sas')).accountSasToken, '\"}}}}}}}}'))]",
        names.bootstrap_ignition_url(),
        names.storage_account(),
        api_version::STORAGE
    );

    let bootstrap_vm = Resource::new(
        "Microsoft.Compute/virtualMachines",
        ResourceName::fixed(names.bootstrap_vm()),
        api_version::COMPUTE,
    )
    .location(location)
    .identity(vm_identity.clone())
    .properties(vm_properties(
        &names,
        BOOTSTRAP_VM_SIZE,
        BOOTSTRAP_DISK_SIZE_GB,
        &format!("{}_OSDisk", names.bootstrap_vm()),
        &format!("{}-bootstrap", config.name()),
        &bootstrap_custom_data,
        &format!(
            "[resourceId('Microsoft.Network/networkInterfaces', '{}')]",
            names.bootstrap_nic()
        ),
    ))
    .depends_on(&bootstrap_nic)
    .depends_on(&image);

    let master_vm = Resource::new(
        "Microsoft.Compute/virtualMachines",
        names.master_vm(),
        api_version::COMPUTE,
    )
    .location(location)
    .copies(master_count)
    .zones(vec!["[copyIndex(1)]".to_string()])
    .identity(vm_identity)
    .properties(vm_properties(
        &names,
        &master.vm_size,
        master.disk_size_gb,
        &format!("[concat('{}-master-', copyIndex(), '_OSDisk')]", props.cluster_id),
        &format!("[concat('{}-master-', copyIndex())]", config.name()),
        &master_ignition,
        &format!(
            "[resourceId('Microsoft.Network/networkInterfaces', concat('{}-master', copyIndex(), '-nic'))]",
            props.cluster_id
        ),
    ))
    .depends_on(&master_nic)
    .depends_on(&image)
    .depends_on(&bootstrap_vm)
    .depends_on(&role_assignment);

    InfrastructureStage::new(
        InstallPhase::DeployResources.as_str(),
        RESOURCES_DEPLOYMENT,
        Template::new(vec![
            role_assignment,
            zone,
            network_link,
            api_int_record,
            api_record,
            route_table,
            bootstrap_pip,
            api_pip,
            public_lb,
            internal_lb,
            bootstrap_nic,
            master_nic,
            srv_record,
            etcd_records,
            image,
            bootstrap_vm,
            master_vm,
        ])
        .with_object_parameter("sas"),
        sas_parameters(installation.now),
    )
}

fn lb_rule(lb: &str, name: &str, frontend: &str, pool: &str, port: u16) -> Value {
    json!({
        "name": name,
        "properties": {
            "frontendIPConfiguration": {
                "id": format!(
                    "[concat(resourceId('Microsoft.Network/loadBalancers', '{}'), '/frontendIPConfigurations/{}')]",
                    lb, frontend
                ),
            },
            "backendAddressPool": { "id": pool_id(lb, pool) },
            "probe": {
                "id": format!(
                    "[concat(resourceId('Microsoft.Network/loadBalancers', '{}'), '/probes/{}-probe')]",
                    lb, name
                ),
            },
            "protocol": "Tcp",
            "loadDistribution": "Default",
            "idleTimeoutInMinutes": 30,
            "frontendPort": port,
            "backendPort": port,
        },
    })
}

fn lb_probe(name: &str, port: u16, path: &str) -> Value {
    json!({
        "name": name,
        "properties": {
            "protocol": "Https",
            "port": port,
            "requestPath": path,
            "intervalInSeconds": 10,
            "numberOfProbes": 3,
        },
    })
}

fn pool_id(lb: &str, pool: &str) -> String {
    format!(
        "[concat(resourceId('Microsoft.Network/loadBalancers', '{}'), '/backendAddressPools/{}')]",
        lb, pool
    )
}

fn vm_properties(
    names: &ResourceNames,
    vm_size: &str,
    disk_size_gb: u32,
    disk_name: &str,
    computer_name: &str,
    custom_data: &str,
    nic_id: &str,
) -> Value {
    json!({
        "hardwareProfile": { "vmSize": vm_size },
        "storageProfile": {
            "imageReference": {
                "id": format!("[resourceId('Microsoft.Compute/images', '{}')]", names.image()),
            },
            "osDisk": {
                "name": disk_name,
                "caching": "ReadOnly",
                "createOption": "FromImage",
                "diskSizeGB": disk_size_gb,
                "managedDisk": { "storageAccountType": "Premium_LRS" },
            },
        },
        "osProfile": {
            "computerName": computer_name,
            "adminUsername": "core",
            "adminPassword": "NotActuallyApplied!",
            "customData": custom_data,
            "linuxConfiguration": { "disablePasswordAuthentication": false },
        },
        "networkProfile": { "networkInterfaces": [{ "id": nic_id }] },
        "diagnosticsProfile": {
            "bootDiagnostics": {
                "enabled": true,
                "storageUri": format!("https://{}.blob.core.windows.net/", names.storage_account()),
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{test_cluster, test_settings};
    use crate::graph::Resolver;
    use chrono::TimeZone;
    use mantle_common::model::Installation;

    fn installing_cluster() -> Cluster {
        let mut cluster = test_cluster();
        let now = Utc
            .with_ymd_and_hms(2019, 12, 31, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        cluster.properties.installation = Some(Installation::started_at(now));
        cluster
    }

    fn core_stage() -> InfrastructureStage {
        let cluster = installing_cluster();
        let graph = Resolver::new(cluster.clone(), test_settings())
            .resolve_all()
            .expect("resolve");
        resources_stage(&cluster, &graph, Ipv4Addr::new(10, 0, 0, 253)).expect("stage")
    }

    fn find<'a>(stage: &'a InfrastructureStage, reference: &str) -> &'a Resource {
        stage
            .template
            .resources
            .iter()
            .find(|r| r.reference() == reference)
            .unwrap_or_else(|| panic!("{} not declared", reference))
    }

    #[test]
    fn storage_stage_declares_identity_account_and_containers() {
        let stage = storage_stage(&test_cluster()).expect("stage");
        let refs: Vec<String> = stage.template.resources.iter().map(Resource::reference).collect();
        assert_eq!(
            refs,
            vec![
                "Microsoft.ManagedIdentity/userAssignedIdentities/test-cluster-abcde-identity",
                "Microsoft.Storage/storageAccounts/clusterxyz12",
                "Microsoft.Storage/storageAccounts/clusterxyz12/blobServices/default/containers/ignition",
                "Microsoft.Storage/storageAccounts/clusterxyz12/blobServices/default/containers/vhd",
            ]
        );
        assert_eq!(stage.deployment_name, STORAGE_DEPLOYMENT);
    }

    #[test]
    fn core_stage_names_derive_from_cluster_slug() {
        let stage = core_stage();
        find(&stage, "Microsoft.Network/loadBalancers/test-cluster-abcde-public-lb");
        find(&stage, "Microsoft.Network/loadBalancers/test-cluster-abcde-internal-lb");
        find(&stage, "Microsoft.Network/routeTables/test-cluster-abcde-node-routetable");
        find(&stage, "Microsoft.Network/publicIPAddresses/test-cluster-abcde-bootstrap-pip");
        find(&stage, "Microsoft.Compute/images/test-cluster-abcde");
        find(
            &stage,
            "Microsoft.Network/privateDnsZones/test-cluster.example.com/virtualNetworkLinks/test-cluster-network-link",
        );
        let pip = find(&stage, "Microsoft.Network/publicIPAddresses/test-cluster-abcde-pip");
        assert_eq!(
            pip.properties.as_ref().expect("properties")["dnsSettings"]["domainNameLabel"],
            "test-cluster-abcde"
        );
    }

    #[test]
    fn internal_lb_and_api_records_use_the_load_balancer_address() {
        let stage = core_stage();
        let lb = find(&stage, "Microsoft.Network/loadBalancers/test-cluster-abcde-internal-lb");
        let props = lb.properties.as_ref().expect("properties");
        assert_eq!(
            props["frontendIPConfigurations"][0]["properties"]["privateIPAddress"],
            "10.0.0.253"
        );
        let ports: Vec<u64> = props["loadBalancingRules"]
            .as_array()
            .expect("rules")
            .iter()
            .filter_map(|r| r["properties"]["frontendPort"].as_u64())
            .collect();
        assert_eq!(ports, vec![6443, 22623]);

        for label in ["api", "api-int"] {
            let record = find(
                &stage,
                &format!("Microsoft.Network/privateDnsZones/test-cluster.example.com/A/{}", label),
            );
            let props = record.properties.as_ref().expect("properties");
            assert_eq!(props["ttl"], 300);
            assert_eq!(props["aRecords"][0]["ipv4Address"], "10.0.0.253");
        }
    }

    #[test]
    fn etcd_records_follow_master_nics() {
        let stage = core_stage();
        let srv = find(
            &stage,
            "Microsoft.Network/privateDnsZones/test-cluster.example.com/SRV/_etcd-server-ssl._tcp",
        );
        let props = srv.properties.as_ref().expect("properties");
        assert_eq!(props["ttl"], 60);
        assert_eq!(props["srvRecords"].as_array().expect("records").len(), 3);
        assert_eq!(props["srvRecords"][2]["target"], "etcd-2.test-cluster.example.com");
        assert_eq!(props["srvRecords"][0]["port"], 2380);

        let etcd = find(
            &stage,
            "[concat('Microsoft.Network/privateDnsZones/test-cluster.example.com/A/etcd-', copyIndex())]",
        );
        assert_eq!(etcd.instances(), 3);
        assert!(etcd.depends_on.contains(
            &"[concat('Microsoft.Network/networkInterfaces/test-cluster-abcde-master', copyIndex(), '-nic')]"
                .to_string()
        ));
    }

    #[test]
    fn control_plane_boots_after_bootstrap_across_zones() {
        let stage = core_stage();
        let masters = find(
            &stage,
            "[concat('Microsoft.Compute/virtualMachines/test-cluster-abcde-master-', copyIndex())]",
        );
        assert_eq!(masters.instances(), 3);
        assert_eq!(masters.zones, Some(vec!["[copyIndex(1)]".to_string()]));
        assert!(masters
            .depends_on
            .contains(&"Microsoft.Compute/virtualMachines/test-cluster-abcde-bootstrap".to_string()));

        let props = masters.properties.as_ref().expect("properties");
        assert_eq!(props["hardwareProfile"]["vmSize"], "Standard_D8s_v3");
        assert_eq!(props["storageProfile"]["osDisk"]["diskSizeGB"], 1024);
        let custom_data = props["osProfile"]["customData"].as_str().expect("custom data");
        let decoded = STANDARD.decode(custom_data).expect("base64");
        let ignition: Value = serde_json::from_slice(&decoded).expect("ignition json");
        assert_eq!(
            ignition["ignition"]["config"]["append"][0]["source"],
            "https://api-int.test-cluster.example.com:22623/config/master"
        );

        let bootstrap = find(&stage, "Microsoft.Compute/virtualMachines/test-cluster-abcde-bootstrap");
        let props = bootstrap.properties.as_ref().expect("properties");
        assert_eq!(props["hardwareProfile"]["vmSize"], "Standard_D4s_v3");
        assert!(props["osProfile"]["customData"]
            .as_str()
            .expect("custom data")
            .contains("listAccountSas(resourceId('Microsoft.Storage/storageAccounts', 'clusterxyz12')"));
    }

    #[test]
    fn sas_window_is_anchored_to_install_start() {
        let stage = core_stage();
        let sas = &stage.parameters["sas"]["value"];
        assert_eq!(sas["signedStart"], "2019-12-31T12:00:00Z");
        assert_eq!(sas["signedExpiry"], "2020-01-01T12:00:00Z");
        assert_eq!(sas["signedPermission"], "rl");
        assert_eq!(sas["signedProtocol"], "https");

        // Re-running the stage submits identical parameters
        assert_eq!(core_stage().parameters, stage.parameters);
    }

    #[test]
    fn core_stage_requires_an_installation_record() {
        let cluster = test_cluster();
        let graph = Resolver::new(cluster.clone(), test_settings())
            .resolve_all()
            .expect("resolve");
        let err = resources_stage(&cluster, &graph, Ipv4Addr::new(10, 0, 0, 253))
            .expect_err("no installation");
        assert!(matches!(err, Error::Install { .. }));
    }
}
