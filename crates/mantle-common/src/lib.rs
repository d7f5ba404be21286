//! Common types for Mantle: the cluster data model, errors, retry policy,
//! and utilities shared by the frontend and the install backend

#![deny(missing_docs)]

pub mod error;
pub mod generate;
pub mod model;
pub mod retry;
pub mod settings;
pub mod subnet;
pub mod telemetry;

pub use error::{Error, StoreErrorKind};
pub use settings::Settings;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default HTTPS port for the frontend listener
pub const DEFAULT_LISTEN_PORT: u16 = 8443;

/// The only external API version served
pub const API_VERSION_2019_12_31_PREVIEW: &str = "2019-12-31-preview";
