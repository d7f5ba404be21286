//! Static validation of 2019-12-31-preview request bodies

use ipnet::Ipv4Net;

use mantle_common::model::{Cluster, SubnetId};
use mantle_common::subnet::{overlaps, parse_cidr, reserved_overlap};

use super::{MasterProfile, NetworkProfile, OpenShiftCluster, WorkerProfile};
use crate::api::RequestContext;
use crate::error::CloudError;

/// VM sizes a control plane may use
pub const MASTER_VM_SIZES: [&str; 3] = ["Standard_D8s_v3", "Standard_D16s_v3", "Standard_D32s_v3"];

/// VM sizes a worker pool may use
pub const WORKER_VM_SIZES: [&str; 3] = ["Standard_D2s_v3", "Standard_D4s_v3", "Standard_D8s_v3"];

const WORKER_POOL_NAME: &str = "worker";
const MIN_WORKER_DISK_GB: u32 = 128;
const MIN_WORKERS: u32 = 3;
const MAX_WORKERS: u32 = 20;
const MAX_POD_PREFIX: u8 = 18;
const MAX_SERVICE_PREFIX: u8 = 22;

type Validation = Result<(), CloudError>;

pub(super) fn validate(
    oc: &OpenShiftCluster,
    ctx: &RequestContext<'_>,
    current: Option<&Cluster>,
) -> Validation {
    validate_identity(oc, ctx)?;
    validate_location(oc, ctx, current)?;

    let props = &oc.properties;
    let sp = &props.service_principal_profile;
    if sp.client_id.is_empty() {
        return Err(CloudError::invalid_parameter(
            "properties.servicePrincipalProfile.clientId",
            "The provided client ID '' is invalid.",
        ));
    }
    if sp.client_secret.is_empty() && current.is_none() {
        return Err(CloudError::invalid_parameter(
            "properties.servicePrincipalProfile.clientSecret",
            "The provided client secret is invalid.",
        ));
    }

    validate_network(&props.network_profile)?;
    let master_subnet = validate_master(&props.master_profile)?;
    validate_workers(&props.worker_profiles, &master_subnet)
}

fn validate_identity(oc: &OpenShiftCluster, ctx: &RequestContext<'_>) -> Validation {
    if !oc.id.is_empty() && !oc.id.eq_ignore_ascii_case(ctx.resource_id) {
        return Err(CloudError::invalid_parameter(
            "id",
            format!(
                "The provided resource ID '{}' did not match the resource ID in the URL '{}'.",
                oc.id, ctx.resource_id
            ),
        ));
    }
    if !oc.name.is_empty() && !oc.name.eq_ignore_ascii_case(ctx.name) {
        return Err(CloudError::invalid_parameter(
            "name",
            format!(
                "The provided resource name '{}' did not match the name in the URL '{}'.",
                oc.name, ctx.name
            ),
        ));
    }
    if !oc.resource_type.is_empty() && !oc.resource_type.eq_ignore_ascii_case(ctx.resource_type) {
        return Err(CloudError::invalid_parameter(
            "type",
            format!(
                "The provided resource type '{}' did not match the type in the URL '{}'.",
                oc.resource_type, ctx.resource_type
            ),
        ));
    }
    Ok(())
}

fn validate_location(
    oc: &OpenShiftCluster,
    ctx: &RequestContext<'_>,
    current: Option<&Cluster>,
) -> Validation {
    if let Some(current) = current {
        if !oc.location.eq_ignore_ascii_case(&current.location) {
            return Err(CloudError::invalid_parameter(
                "location",
                "Changing property 'location' is not allowed.",
            ));
        }
    }
    if !oc.location.eq_ignore_ascii_case(ctx.location) {
        return Err(CloudError::invalid_parameter(
            "location",
            format!("The provided location '{}' is invalid.", oc.location),
        ));
    }
    Ok(())
}

fn cidr(value: &str, target: &str, label: &str, max_prefix: u8) -> Result<Ipv4Net, CloudError> {
    let net = parse_cidr(value).map_err(|_| {
        CloudError::invalid_parameter(
            target,
            format!("The provided {} CIDR '{}' is invalid.", label, value),
        )
    })?;
    if net.prefix_len() > max_prefix {
        return Err(CloudError::invalid_parameter(
            target,
            format!(
                "The provided {} CIDR '{}' is invalid: must be /{} or larger.",
                label, value, max_prefix
            ),
        ));
    }
    if let Some(reserved) = reserved_overlap(&net) {
        return Err(CloudError::invalid_parameter(
            target,
            format!(
                "The provided {} CIDR '{}' overlaps the reserved range '{}'.",
                label, value, reserved
            ),
        ));
    }
    Ok(net)
}

fn validate_network(network: &NetworkProfile) -> Validation {
    let pod = cidr(
        &network.pod_cidr,
        "properties.networkProfile.podCidr",
        "pod",
        MAX_POD_PREFIX,
    )?;
    let service = cidr(
        &network.service_cidr,
        "properties.networkProfile.serviceCidr",
        "service",
        MAX_SERVICE_PREFIX,
    )?;
    if overlaps(&pod, &service) {
        return Err(CloudError::invalid_parameter(
            "properties.networkProfile.serviceCidr",
            format!(
                "The provided service CIDR '{}' overlaps the pod CIDR '{}'.",
                network.service_cidr, network.pod_cidr
            ),
        ));
    }
    Ok(())
}

fn validate_master(master: &MasterProfile) -> Result<SubnetId, CloudError> {
    if !MASTER_VM_SIZES.contains(&master.vm_size.as_str()) {
        return Err(CloudError::invalid_parameter(
            "properties.masterProfile.vmSize",
            format!("The provided master VM size '{}' is invalid.", master.vm_size),
        ));
    }
    SubnetId::parse(&master.subnet_id).map_err(|_| {
        CloudError::invalid_parameter(
            "properties.masterProfile.subnetId",
            format!("The provided master VM subnet '{}' is invalid.", master.subnet_id),
        )
    })
}

fn validate_workers(workers: &[WorkerProfile], master_subnet: &SubnetId) -> Validation {
    let worker = match workers {
        [worker] => worker,
        _ => {
            return Err(CloudError::invalid_parameter(
                "properties.workerProfiles",
                "There should be exactly one worker profile.",
            ))
        }
    };
    let path = format!("properties.workerProfiles['{}']", worker.name);

    if worker.name != WORKER_POOL_NAME {
        return Err(CloudError::invalid_parameter(
            format!("{}.name", path),
            format!("The provided worker name '{}' is invalid.", worker.name),
        ));
    }
    if !WORKER_VM_SIZES.contains(&worker.vm_size.as_str()) {
        return Err(CloudError::invalid_parameter(
            format!("{}.vmSize", path),
            format!("The provided worker VM size '{}' is invalid.", worker.vm_size),
        ));
    }
    if worker.disk_size_gb < MIN_WORKER_DISK_GB {
        return Err(CloudError::invalid_parameter(
            format!("{}.diskSizeGB", path),
            format!(
                "The provided worker disk size '{}' is invalid.",
                worker.disk_size_gb
            ),
        ));
    }

    let subnet_target = format!("{}.subnetId", path);
    let subnet = SubnetId::parse(&worker.subnet_id).map_err(|_| {
        CloudError::invalid_parameter(
            &subnet_target,
            format!("The provided worker VM subnet '{}' is invalid.", worker.subnet_id),
        )
    })?;
    if !subnet
        .virtual_network_id()
        .eq_ignore_ascii_case(&master_subnet.virtual_network_id())
    {
        return Err(CloudError::invalid_parameter(
            &subnet_target,
            format!(
                "The provided worker VM subnet '{}' is in a different vnet than the master VM subnet '{}'.",
                subnet, master_subnet
            ),
        ));
    }
    if subnet.to_string().eq_ignore_ascii_case(&master_subnet.to_string()) {
        return Err(CloudError::invalid_parameter(
            &subnet_target,
            format!(
                "The provided worker VM subnet '{}' and master VM subnet '{}' must be different.",
                subnet, master_subnet
            ),
        ));
    }

    if !(MIN_WORKERS..=MAX_WORKERS).contains(&worker.count) {
        return Err(CloudError::invalid_parameter(
            format!("{}.count", path),
            format!("The provided worker count '{}' is invalid.", worker.count),
        ));
    }
    Ok(())
}
