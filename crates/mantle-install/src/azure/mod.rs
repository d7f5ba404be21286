//! Azure Resource Manager seams used by the install pipeline
//!
//! Each trait covers one ARM resource family. [`ArmClient`] implements all
//! of them over REST; tests substitute mocks or hand-written fakes.

mod auth;
mod client;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use mantle_common::Result;

use crate::template::Template;

pub use auth::{ClientCredentials, MANAGEMENT_RESOURCE};
pub use client::{ArmClient, ARM_ENDPOINT};

/// Where to ask about a long-running ARM operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollHandle {
    /// Absolute status URL returned by ARM
    pub url: String,
    /// Which status protocol the URL speaks
    pub kind: PollKind,
    /// Server-suggested delay before the first poll
    pub retry_after: Option<Duration>,
}

/// ARM long-running operation protocols
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollKind {
    /// `Azure-AsyncOperation`: body carries a `status` field
    AsyncOperation,
    /// `Location`: 202 while running, 2xx when done
    Location,
}

/// State of a long-running operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    /// Still running; poll again after the suggested delay
    InProgress {
        /// `Retry-After` from the last poll
        retry_after: Option<Duration>,
    },
    /// Finished successfully
    Succeeded,
    /// Finished unsuccessfully
    Failed {
        /// ARM error code
        code: String,
        /// ARM error message
        message: String,
    },
}

/// Template deployment request body
#[derive(Clone, Debug, Serialize)]
pub struct Deployment {
    /// Deployment properties
    pub properties: DeploymentProperties,
}

/// Template, parameter values and mode of a deployment
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentProperties {
    /// Template to deploy
    pub template: Template,
    /// Parameter values, keyed by parameter name
    pub parameters: serde_json::Value,
    /// Deployment mode
    pub mode: DeploymentMode,
}

/// How ARM treats resources missing from the template
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DeploymentMode {
    /// Leave unlisted resources alone; re-deploying is idempotent
    Incremental,
}

/// Template deployments
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentsClient: Send + Sync {
    /// Submit a deployment and return its status handle
    async fn begin_create_or_update(
        &self,
        subscription: &str,
        resource_group: &str,
        deployment_name: &str,
        deployment: &Deployment,
    ) -> Result<PollHandle>;

    /// Query a long-running operation once
    async fn poll(&self, handle: &PollHandle) -> Result<OperationStatus>;
}

/// Resource groups
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceGroupsClient: Send + Sync {
    /// Create the group if missing
    async fn create_or_update(&self, subscription: &str, name: &str, location: &str) -> Result<()>;

    /// Start deleting a group; `None` when it does not exist
    async fn begin_delete(&self, subscription: &str, name: &str) -> Result<Option<PollHandle>>;

    /// Query a long-running operation once
    async fn poll(&self, handle: &PollHandle) -> Result<OperationStatus>;
}

/// Virtual network subnets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SubnetClient: Send + Sync {
    /// Address prefix of a subnet; `None` when the subnet does not exist
    async fn address_prefix(&self, subnet_id: &str) -> Result<Option<String>>;
}

/// Public DNS zones and CNAME record sets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordSets: Send + Sync {
    /// Names of the DNS zones in a resource group
    async fn list_zones(&self, subscription: &str, resource_group: &str) -> Result<Vec<String>>;

    /// Create or replace a CNAME record
    async fn create_or_update_cname(
        &self,
        subscription: &str,
        resource_group: &str,
        zone: &str,
        name: &str,
        target: &str,
        ttl: u64,
    ) -> Result<()>;

    /// Delete a CNAME record; succeeds when it is already gone
    async fn delete_cname(
        &self,
        subscription: &str,
        resource_group: &str,
        zone: &str,
        name: &str,
    ) -> Result<()>;
}
