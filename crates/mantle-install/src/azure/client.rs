//! Resource Manager REST client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use mantle_common::{Error, Result};

use super::{
    ClientCredentials, Deployment, DeploymentsClient, OperationStatus, PollHandle, PollKind,
    RecordSets, ResourceGroupsClient, SubnetClient,
};

/// Public cloud Resource Manager endpoint
pub const ARM_ENDPOINT: &str = "https://management.azure.com";

const DEPLOYMENTS_API_VERSION: &str = "2019-05-01";
const RESOURCE_GROUPS_API_VERSION: &str = "2019-05-01";
const NETWORK_API_VERSION: &str = "2019-07-01";
const DNS_API_VERSION: &str = "2018-05-01";

const AZURE_ASYNC_OPERATION: &str = "azure-asyncoperation";

/// One client for every ARM resource family the service touches
///
/// Requests carry the service principal token from [`ClientCredentials`];
/// the subscription is part of every call, so one client serves all
/// cluster subscriptions.
pub struct ArmClient {
    http: reqwest::Client,
    endpoint: String,
    credentials: Arc<ClientCredentials>,
}

#[derive(Deserialize)]
struct ArmErrorBody {
    error: Option<ArmError>,
}

#[derive(Deserialize)]
struct ArmError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct AsyncOperationBody {
    status: String,
    error: Option<ArmError>,
}

#[derive(Deserialize)]
struct ZoneList {
    value: Vec<Named>,
}

#[derive(Deserialize)]
struct Named {
    name: String,
}

#[derive(Deserialize)]
struct Subnet {
    properties: SubnetProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubnetProperties {
    address_prefix: Option<String>,
}

impl ArmClient {
    /// Client against the public cloud endpoint
    pub fn new(http: reqwest::Client, credentials: Arc<ClientCredentials>) -> Self {
        Self::with_endpoint(http, credentials, ARM_ENDPOINT)
    }

    /// Client against a custom endpoint
    pub fn with_endpoint(
        http: reqwest::Client,
        credentials: Arc<ClientCredentials>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            credentials,
        }
    }

    fn url(&self, path: &str, api_version: &str) -> String {
        format!("{}{}?api-version={}", self.endpoint, path, api_version)
    }

    async fn send(
        &self,
        provider: &str,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self.credentials.token().await?;
        let mut request = self.http.request(method.clone(), url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::provider_for(url, provider, e.to_string()))?;
        debug!(method = %method, url = %url, status = %response.status(), "arm response");
        Ok(response)
    }

    async fn poll_handle(&self, provider: &str, handle: &PollHandle) -> Result<OperationStatus> {
        let response = self.send(provider, Method::GET, &handle.url, None).await?;
        let retry_after = retry_after(response.headers());
        match handle.kind {
            PollKind::AsyncOperation => {
                let response = check(provider, &handle.url, response).await?;
                let body: AsyncOperationBody = response
                    .json()
                    .await
                    .map_err(|e| Error::serialization_for_kind("async operation", e.to_string()))?;
                Ok(match body.status.as_str() {
                    "Succeeded" => OperationStatus::Succeeded,
                    "Failed" | "Canceled" => {
                        let error = body.error.unwrap_or(ArmError {
                            code: body.status.clone(),
                            message: String::new(),
                        });
                        OperationStatus::Failed {
                            code: error.code,
                            message: error.message,
                        }
                    }
                    _ => OperationStatus::InProgress { retry_after },
                })
            }
            PollKind::Location => {
                if response.status() == StatusCode::ACCEPTED {
                    return Ok(OperationStatus::InProgress { retry_after });
                }
                check(provider, &handle.url, response).await?;
                Ok(OperationStatus::Succeeded)
            }
        }
    }
}

/// Turn a non-success response into a provider error
async fn check(provider: &str, url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ArmErrorBody>(&text) {
        Ok(ArmErrorBody {
            error: Some(ArmError { code, message }),
        }) => format!("{} {}: {}", status, code, message),
        _ => format!("{}: {}", status, text),
    };
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(Error::provider_for(url, provider, message))
    } else {
        Err(Error::provider_permanent(url, provider, message))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Status handle from a long-running operation's initial response
fn poll_handle_from(headers: &HeaderMap) -> Option<PollHandle> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let (url, kind) = match header(AZURE_ASYNC_OPERATION) {
        Some(url) => (url, PollKind::AsyncOperation),
        None => (header(LOCATION.as_str())?, PollKind::Location),
    };
    Some(PollHandle {
        url,
        kind,
        retry_after: retry_after(headers),
    })
}

#[async_trait]
impl DeploymentsClient for ArmClient {
    async fn begin_create_or_update(
        &self,
        subscription: &str,
        resource_group: &str,
        deployment_name: &str,
        deployment: &Deployment,
    ) -> Result<PollHandle> {
        let url = self.url(
            &format!(
                "/subscriptions/{}/resourcegroups/{}/providers/Microsoft.Resources/deployments/{}",
                subscription, resource_group, deployment_name
            ),
            DEPLOYMENTS_API_VERSION,
        );
        let body = serde_json::to_value(deployment)?;
        let response = self.send("deployments", Method::PUT, &url, Some(body)).await?;
        let response = check("deployments", &url, response).await?;
        poll_handle_from(response.headers()).ok_or_else(|| {
            Error::provider_permanent(&url, "deployments", "response carried no operation status URL")
        })
    }

    async fn poll(&self, handle: &PollHandle) -> Result<OperationStatus> {
        self.poll_handle("deployments", handle).await
    }
}

#[async_trait]
impl ResourceGroupsClient for ArmClient {
    async fn create_or_update(&self, subscription: &str, name: &str, location: &str) -> Result<()> {
        let url = self.url(
            &format!("/subscriptions/{}/resourcegroups/{}", subscription, name),
            RESOURCE_GROUPS_API_VERSION,
        );
        let response = self
            .send("resourcegroups", Method::PUT, &url, Some(json!({ "location": location })))
            .await?;
        check("resourcegroups", &url, response).await?;
        Ok(())
    }

    async fn begin_delete(&self, subscription: &str, name: &str) -> Result<Option<PollHandle>> {
        let url = self.url(
            &format!("/subscriptions/{}/resourcegroups/{}", subscription, name),
            RESOURCE_GROUPS_API_VERSION,
        );
        let response = self.send("resourcegroups", Method::DELETE, &url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check("resourcegroups", &url, response).await?;
        Ok(poll_handle_from(response.headers()))
    }

    async fn poll(&self, handle: &PollHandle) -> Result<OperationStatus> {
        self.poll_handle("resourcegroups", handle).await
    }
}

#[async_trait]
impl SubnetClient for ArmClient {
    async fn address_prefix(&self, subnet_id: &str) -> Result<Option<String>> {
        let url = self.url(subnet_id, NETWORK_API_VERSION);
        let response = self.send("network", Method::GET, &url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check("network", &url, response).await?;
        let subnet: Subnet = response
            .json()
            .await
            .map_err(|e| Error::serialization_for_kind("subnet", e.to_string()))?;
        subnet.properties.address_prefix.map(Some).ok_or_else(|| {
            Error::provider_permanent(subnet_id, "network", "subnet has no address prefix")
        })
    }
}

#[async_trait]
impl RecordSets for ArmClient {
    async fn list_zones(&self, subscription: &str, resource_group: &str) -> Result<Vec<String>> {
        let url = self.url(
            &format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/dnszones",
                subscription, resource_group
            ),
            DNS_API_VERSION,
        );
        let response = self.send("dns", Method::GET, &url, None).await?;
        let response = check("dns", &url, response).await?;
        let zones: ZoneList = response
            .json()
            .await
            .map_err(|e| Error::serialization_for_kind("dns zone list", e.to_string()))?;
        Ok(zones.value.into_iter().map(|z| z.name).collect())
    }

    async fn create_or_update_cname(
        &self,
        subscription: &str,
        resource_group: &str,
        zone: &str,
        name: &str,
        target: &str,
        ttl: u64,
    ) -> Result<()> {
        let url = self.url(
            &cname_path(subscription, resource_group, zone, name),
            DNS_API_VERSION,
        );
        let body = json!({
            "properties": {
                "TTL": ttl,
                "CNAMERecord": { "cname": target },
            }
        });
        let response = self.send("dns", Method::PUT, &url, Some(body)).await?;
        check("dns", &url, response).await?;
        Ok(())
    }

    async fn delete_cname(
        &self,
        subscription: &str,
        resource_group: &str,
        zone: &str,
        name: &str,
    ) -> Result<()> {
        let url = self.url(
            &cname_path(subscription, resource_group, zone, name),
            DNS_API_VERSION,
        );
        let response = self.send("dns", Method::DELETE, &url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check("dns", &url, response).await?;
        Ok(())
    }
}

fn cname_path(subscription: &str, resource_group: &str, zone: &str, name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/dnszones/{}/CNAME/{}",
        subscription, resource_group, zone, name
    )
}
