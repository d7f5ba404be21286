//! Error types for the Mantle resource provider
//!
//! Errors are structured with fields to aid debugging in production.
//! Store errors carry a [`StoreErrorKind`] so the request path can tell a
//! lost optimistic-concurrency race apart from a genuine failure.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Classification of document store failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// No document exists for the key
    NotFound,
    /// A document already exists for the key
    Conflict,
    /// The supplied etag does not match the stored one
    PreconditionFailed,
    /// The store could not be reached or throttled the request
    Unavailable,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::PreconditionFailed => "precondition failed",
            Self::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Main error type for Mantle operations
#[derive(Debug, Error)]
pub enum Error {
    /// Document store error
    #[error("store error ({kind}): {message}")]
    Store {
        /// What kind of store failure occurred
        kind: StoreErrorKind,
        /// Description of what failed
        message: String,
    },

    /// Validation error for a cluster specification
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Key or name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "properties.networkProfile.podCidr")
        field: Option<String>,
    },

    /// Cloud provider error
    #[error("provider error [{provider}] for {cluster}: {message}")]
    Provider {
        /// Key or name of the cluster being provisioned
        cluster: String,
        /// Provider service that failed (deployments, dns, network, ...)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Install pipeline stage error
    #[error("install error for {cluster} in stage {stage}: {message}")]
    Install {
        /// Key of the cluster being installed
        cluster: String,
        /// Stage that failed
        stage: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The payload kind being serialized (if known)
        kind: Option<String>,
    },

    /// A bounded wait expired
    #[error("{operation} timed out after {}s", elapsed.as_secs())]
    Timeout {
        /// Operation that was waiting
        operation: String,
        /// How long it waited
        elapsed: Duration,
    },

    /// The caller cancelled the operation
    #[error("{operation} was cancelled")]
    Cancelled {
        /// Operation that was aborted
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "resolver", "frontend")
        context: String,
    },
}

impl Error {
    /// Create a store error of the given kind
    pub fn store(kind: StoreErrorKind, msg: impl Into<String>) -> Self {
        Self::Store {
            kind,
            message: msg.into(),
        }
    }

    /// Create a NotFound store error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::store(StoreErrorKind::NotFound, msg)
    }

    /// Create a Conflict store error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::store(StoreErrorKind::Conflict, msg)
    }

    /// Create a PreconditionFailed store error
    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        Self::store(StoreErrorKind::PreconditionFailed, msg)
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider_for(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., a rejected deployment)
    pub fn provider_permanent(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an install stage error
    pub fn install(
        cluster: impl Into<String>,
        stage: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Install {
            cluster: cluster.into(),
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with payload kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// The store error kind, if this is a store error
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            Error::Store { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True when the store reported a missing document
    pub fn is_not_found(&self) -> bool {
        self.store_kind() == Some(StoreErrorKind::NotFound)
    }

    /// True when a write lost an optimistic-concurrency race
    ///
    /// Both a stale etag and a duplicate create count: either way another
    /// writer got there first and the caller should re-read.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(
            self.store_kind(),
            Some(StoreErrorKind::PreconditionFailed | StoreErrorKind::Conflict)
        )
    }

    /// True when this error came from cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and install-stage errors need a fix or an
    /// operator retry. Transient store and provider errors may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store { kind, .. } => matches!(
                kind,
                StoreErrorKind::PreconditionFailed
                    | StoreErrorKind::Conflict
                    | StoreErrorKind::Unavailable
            ),
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Install { .. } => false,
            Error::Serialization { .. } => false,
            Error::Timeout { .. } => false,
            Error::Cancelled { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Provider { cluster, .. } => Some(cluster),
            Error::Install { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the invalid field path for validation errors
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
