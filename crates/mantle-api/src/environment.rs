//! Development and production behaviour
//!
//! The mode is chosen once at startup; handlers only ever ask the resulting
//! [`Environment`] where to listen, whether the service is ready, and
//! whether a caller is trusted.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use mantle_common::DEFAULT_LISTEN_PORT;

use crate::metadata::MetadataCache;

/// Header carrying the caller's client certificate, base64 DER
pub const CLIENT_CERTIFICATE_HEADER: &str = "x-client-certificate";

/// Deployment mode named on the command line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Local development
    Development,
    /// Behind ARM
    #[default]
    Production,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "unknown mode '{}'; expected development or production",
                other
            )),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Production => "production",
        })
    }
}

/// Mode-specific behaviour of the frontend
pub enum Environment {
    /// Localhost only, no caller authentication, always ready
    Development,
    /// All interfaces, ARM client certificates, ready while metadata is fresh
    Production {
        /// Trusted certificate cache
        metadata: Arc<MetadataCache>,
    },
}

impl Environment {
    /// Mode of this environment
    pub fn mode(&self) -> Mode {
        match self {
            Self::Development => Mode::Development,
            Self::Production { .. } => Mode::Production,
        }
    }

    /// Default listen address
    pub fn listen_address(&self) -> SocketAddr {
        let ip = match self {
            Self::Development => Ipv4Addr::LOCALHOST,
            Self::Production { .. } => Ipv4Addr::UNSPECIFIED,
        };
        SocketAddr::from((ip, DEFAULT_LISTEN_PORT))
    }

    /// Whether the environment can serve traffic
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Development => true,
            Self::Production { metadata } => metadata.is_ready(),
        }
    }

    /// Whether the caller that sent `headers` is trusted
    pub fn authenticate(&self, headers: &HeaderMap) -> bool {
        let Self::Production { metadata } = self else {
            return true;
        };
        let Some(encoded) = headers
            .get(CLIENT_CERTIFICATE_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            debug!("request without client certificate");
            return false;
        };
        match STANDARD.decode(encoded.trim()) {
            Ok(der) => metadata.allow_client_certificate(&der),
            Err(e) => {
                debug!(error = %e, "client certificate is not base64");
                false
            }
        }
    }
}
