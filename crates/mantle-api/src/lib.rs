//! Mantle frontend: ARM-facing HTTP API for OpenShift clusters
//!
//! Requests are validated and converted through the versioned [`api`]
//! registry, persisted with optimistic concurrency, and handed to the
//! install backend through a [`mantle_install::Dispatcher`].

#![deny(missing_docs)]

pub mod api;
pub mod environment;
pub mod error;
pub mod frontend;
pub mod metadata;
pub mod provisioning;
pub mod server;

pub use environment::{Environment, Mode};
pub use error::{CloudError, ServerError};
pub use frontend::{router, AppState};
pub use metadata::{HttpMetadataSource, MetadataCache, SystemClock};
pub use provisioning::ProvisioningPolicy;
pub use server::{serve, ServerConfig, TlsPem};
