//! AAD client-credentials tokens

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use tracing::debug;

use mantle_common::model::Secret;
use mantle_common::{Error, Result};

/// Token audience for Resource Manager
pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";

const AUTHORITY: &str = "https://login.microsoftonline.com";

/// Tokens are refreshed this long before they expire
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(deserialize_with = "seconds")]
    expires_in: u64,
}

/// AAD v1 sends `expires_in` as a string; v2 as a number
fn seconds<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(d)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Service principal that signs ARM requests, with a cached bearer token
pub struct ClientCredentials {
    http: reqwest::Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: Secret,
    resource: String,
    cached: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret)
            .field("resource", &self.resource)
            .finish()
    }
}

impl ClientCredentials {
    /// Credentials for Resource Manager in the public cloud
    pub fn new(
        http: reqwest::Client,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Secret,
    ) -> Self {
        Self {
            http,
            authority: AUTHORITY.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret,
            resource: MANAGEMENT_RESOURCE.to_string(),
            cached: Mutex::new(None),
        }
    }

    /// Point at a different authority host (sovereign clouds, tests)
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    /// A bearer token, fetched anew only near expiry
    pub async fn token(&self) -> Result<String> {
        let now = Instant::now();
        let cached = self
            .cached
            .lock()
            .as_ref()
            .filter(|t| t.is_fresh(now))
            .map(|t| t.value.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        let url = format!("{}/{}/oauth2/token", self.authority, self.tenant_id);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose()),
                ("resource", self.resource.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::provider_for(&self.client_id, "aad", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::provider_permanent(
                &self.client_id,
                "aad",
                format!("token request returned {}: {}", status, body),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::serialization_for_kind("aad token", e.to_string()))?;
        debug!(expires_in = token.expires_in, "acquired management token");

        *self.cached.lock() = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: now + Duration::from_secs(token.expires_in),
        });
        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_in_accepts_string_and_number() {
        let v1: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":"3599"}"#).expect("v1 shape");
        assert_eq!(v1.expires_in, 3599);
        let v2: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":3599}"#).expect("v2 shape");
        assert_eq!(v2.expires_in, 3599);
    }

    #[test]
    fn tokens_near_expiry_are_stale() {
        let now = Instant::now();
        let fresh = CachedToken {
            value: "t".into(),
            expires_at: now + Duration::from_secs(3600),
        };
        let stale = CachedToken {
            value: "t".into(),
            expires_at: now + Duration::from_secs(60),
        };
        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
    }

    #[tokio::test]
    async fn cached_token_is_reused_without_a_request() {
        // The authority is unroutable: any network call would fail the test
        let creds = ClientCredentials::new(
            reqwest::Client::new(),
            "tenant",
            "client",
            Secret::new("secret"),
        )
        .with_authority("http://127.0.0.1:1");
        *creds.cached.lock() = Some(CachedToken {
            value: "cached".into(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        });
        assert_eq!(creds.token().await.expect("cached token"), "cached");
    }

    #[test]
    fn debug_output_hides_secret() {
        let creds = ClientCredentials::new(
            reqwest::Client::new(),
            "tenant",
            "client",
            Secret::new("hunter2"),
        );
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
