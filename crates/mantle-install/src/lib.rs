//! Cluster install backend for Mantle
//!
//! The pipeline that turns a Creating cluster document into running
//! infrastructure:
//!
//! - [`graph`] resolves the install artifacts derived from the document
//! - [`stages`] and [`template`] declare the infrastructure
//! - [`deploy`] submits declarations to ARM and waits for them
//! - [`dns`] publishes the API record
//! - [`readiness`] waits for the bootstrap signal
//! - [`installer`] runs those steps in order and records the outcome
//! - [`backend`] dispatches work by document state

#![deny(missing_docs)]

pub mod artifacts;
pub mod azure;
pub mod backend;
pub mod deploy;
pub mod dns;
pub mod graph;
pub mod installer;
pub mod readiness;
pub mod stages;
pub mod template;

pub use backend::{Backend, Dispatcher, LocalDispatcher};
pub use dns::DnsRegistrar;
pub use installer::{AzureClients, Installer, Outcome};
pub use readiness::{BootstrapProbe, KubeProbeFactory, ProbeFactory};
