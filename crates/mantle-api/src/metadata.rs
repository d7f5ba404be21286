//! Trust metadata for client certificate authentication
//!
//! In production the only callers are ARM front doors, which present a
//! certificate published by the ARM metadata endpoint. [`MetadataCache`]
//! refreshes that list in the background and answers two questions: is the
//! list fresh enough to serve traffic, and is a given certificate trusted
//! right now.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use mantle_common::{Error, Result};

/// ARM authentication metadata endpoint
pub const ARM_METADATA_URL: &str =
    "https://management.azure.com:24582/metadata/authentication?api-version=2015-01-01";

/// Delay between metadata refreshes
pub const METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Metadata older than this makes the service unready
pub const METADATA_MAX_AGE: Duration = Duration::from_secs(6 * 60 * 60);

/// Published authentication metadata
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Certificates ARM may present
    #[serde(default)]
    pub client_certificates: Vec<ClientCertificate>,
}

/// One trusted client certificate
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCertificate {
    /// SHA-1 thumbprint, informational
    #[serde(default)]
    pub thumbprint: String,
    /// Start of the trust window
    pub not_before: DateTime<Utc>,
    /// End of the trust window
    pub not_after: DateTime<Utc>,
    /// DER bytes
    #[serde(deserialize_with = "base64_bytes")]
    pub certificate: Vec<u8>,
}

fn base64_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

/// Where metadata comes from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetch the current metadata
    async fn fetch(&self) -> Result<Metadata>;
}

/// Wall clock, replaceable in tests
pub trait Clock: Send + Sync {
    /// The current time
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fetches metadata over HTTPS
pub struct HttpMetadataSource {
    http: reqwest::Client,
    url: String,
}

impl HttpMetadataSource {
    /// A source reading `url`
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(&self) -> Result<Metadata> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::internal_with_context("metadata", e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::internal_with_context(
                "metadata",
                format!("unexpected status {}", status),
            ));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !is_json(content_type) {
            return Err(Error::internal_with_context(
                "metadata",
                format!("unexpected content type '{}'", content_type),
            ));
        }

        response
            .json::<Metadata>()
            .await
            .map_err(|e| Error::serialization_for_kind("metadata", e.to_string()))
    }
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json"))
}

#[derive(Default)]
struct Snapshot {
    metadata: Metadata,
    refreshed_at: Option<DateTime<Utc>>,
}

/// Periodically refreshed view of the trust metadata
pub struct MetadataCache {
    source: Arc<dyn MetadataSource>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    snapshot: RwLock<Snapshot>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetadataCache {
    /// A cache that has not been filled yet
    pub fn new(source: Arc<dyn MetadataSource>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            source,
            clock,
            interval,
            snapshot: RwLock::new(Snapshot::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Refresh now and then every interval until [`stop`](Self::stop)
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let cache = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            loop {
                if let Err(e) = cache.refresh_once().await {
                    warn!(error = %e, "metadata refresh failed");
                }
                tokio::select! {
                    _ = cache.cancel.cancelled() => break,
                    _ = tokio::time::sleep(cache.interval) => {}
                }
            }
            debug!("metadata refresh stopped");
        }));
    }

    /// Stop the refresh loop and wait for it to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Fetch once and replace the snapshot on success
    pub async fn refresh_once(&self) -> Result<()> {
        let metadata = self.source.fetch().await?;
        let count = metadata.client_certificates.len();
        {
            let mut snapshot = self.snapshot.write();
            snapshot.metadata = metadata;
            snapshot.refreshed_at = Some(self.clock.now());
        }
        info!(certificates = count, "refreshed trust metadata");
        Ok(())
    }

    /// True while the last successful refresh is recent enough
    pub fn is_ready(&self) -> bool {
        let snapshot = self.snapshot.read();
        snapshot.refreshed_at.is_some_and(|at| {
            // A refresh stamped in the future counts as fresh
            (self.clock.now() - at)
                .to_std()
                .map_or(true, |age| age < METADATA_MAX_AGE)
        })
    }

    /// True when `der` matches a certificate inside its trust window
    pub fn allow_client_certificate(&self, der: &[u8]) -> bool {
        let now = self.clock.now();
        let snapshot = self.snapshot.read();
        snapshot.metadata.client_certificates.iter().any(|cert| {
            cert.not_before <= now && now < cert.not_after && cert.certificate == der
        })
    }
}
