//! Which client operations each provisioning state admits

use mantle_common::model::{Cluster, ProvisioningState};

use crate::error::CloudError;

/// Outcome of gating a DELETE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteDecision {
    /// Move the document to Deleting
    Begin,
    /// A delete is already running; answer 202 without writing
    InFlight,
}

/// Operator policy over the provisioning state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProvisioningPolicy {
    /// Whether PUT/PATCH may re-enter a Failed cluster
    pub allow_retry_from_failed: bool,
}

impl Default for ProvisioningPolicy {
    fn default() -> Self {
        Self {
            allow_retry_from_failed: true,
        }
    }
}

impl ProvisioningPolicy {
    /// Target state of a PUT or PATCH against an existing cluster
    ///
    /// A Failed cluster that still carries an install record goes back to
    /// Creating so the install resumes; otherwise it is an update.
    pub fn put_or_patch(&self, cluster: &Cluster) -> Result<ProvisioningState, CloudError> {
        let state = cluster.properties.provisioning_state;
        match state {
            ProvisioningState::Succeeded => Ok(ProvisioningState::Updating),
            ProvisioningState::Failed if self.allow_retry_from_failed => {
                if cluster.properties.installation.is_some() {
                    Ok(ProvisioningState::Creating)
                } else {
                    Ok(ProvisioningState::Updating)
                }
            }
            _ => Err(CloudError::request_not_allowed(state)),
        }
    }

    /// Gate a DELETE
    pub fn delete(&self, state: ProvisioningState) -> Result<DeleteDecision, CloudError> {
        match state {
            ProvisioningState::Succeeded | ProvisioningState::Failed => Ok(DeleteDecision::Begin),
            ProvisioningState::Deleting => Ok(DeleteDecision::InFlight),
            ProvisioningState::Creating | ProvisioningState::Updating => {
                Err(CloudError::request_not_allowed(state))
            }
        }
    }
}
