//! Infrastructure deployer
//!
//! Submits one [`InfrastructureStage`] as an incremental ARM deployment and
//! blocks until ARM reports a terminal status. A failed deployment or a
//! failed poll ends the stage; nothing is rolled back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use mantle_common::{Error, Result};

use crate::azure::{
    Deployment, DeploymentMode, DeploymentProperties, DeploymentsClient, OperationStatus,
    PollHandle,
};
use crate::template::InfrastructureStage;

/// Default delay between deployment status polls
pub const DEPLOYMENT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Poll a long-running operation until it finishes
///
/// The first poll waits for the handle's `Retry-After` (or `interval`);
/// later polls wait for the `Retry-After` of the previous response. A
/// failed terminal status and any poll error are returned as-is.
pub async fn wait_for_operation<F, Fut>(
    operation: &str,
    handle: &PollHandle,
    interval: Duration,
    cancel: &CancellationToken,
    mut poll: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<OperationStatus>>,
{
    let mut delay = handle.retry_after.unwrap_or(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(delay) => {}
        }

        match poll().await? {
            OperationStatus::Succeeded => return Ok(()),
            OperationStatus::Failed { code, message } => {
                return Err(Error::provider_permanent(
                    operation,
                    "arm",
                    format!("{}: {}", code, message),
                ));
            }
            OperationStatus::InProgress { retry_after } => {
                debug!(operation = %operation, "operation still running");
                delay = retry_after.unwrap_or(interval);
            }
        }
    }
}

/// Deploys stages into a cluster resource group
pub struct Deployer {
    client: Arc<dyn DeploymentsClient>,
    poll_interval: Duration,
}

impl Deployer {
    /// A deployer polling at [`DEPLOYMENT_POLL_INTERVAL`]
    pub fn new(client: Arc<dyn DeploymentsClient>) -> Self {
        Self {
            client,
            poll_interval: DEPLOYMENT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Submit `stage` and wait for it to finish
    #[instrument(
        skip(self, stage, cancel),
        fields(stage = stage.name, deployment = %stage.deployment_name)
    )]
    pub async fn deploy(
        &self,
        subscription: &str,
        resource_group: &str,
        stage: &InfrastructureStage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        stage.validate()?;
        let deployment = Deployment {
            properties: DeploymentProperties {
                template: stage.template.clone(),
                parameters: stage.parameters.clone(),
                mode: DeploymentMode::Incremental,
            },
        };

        let handle = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(stage.name)),
            submitted = self.client.begin_create_or_update(
                subscription,
                resource_group,
                &stage.deployment_name,
                &deployment,
            ) => submitted?,
        };
        info!(resources = stage.resource_count(), "deployment submitted");

        wait_for_operation(stage.name, &handle, self.poll_interval, cancel, || {
            self.client.poll(&handle)
        })
        .await?;
        info!("deployment succeeded");
        Ok(())
    }
}
