//! ARM-shaped HTTP errors
//!
//! Every failed request answers with `{"error":{"code","message","target"}}`
//! and an HTTP status. Client errors carry a specific code; anything the
//! client cannot act on becomes a generic 500 and the cause is logged.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use mantle_common::model::ProvisioningState;

/// Error codes used in response bodies
pub mod codes {
    /// Unexpected server failure
    pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
    /// The caller is not allowed to call this service
    pub const FORBIDDEN: &str = "Forbidden";
    /// A field failed validation
    pub const INVALID_PARAMETER: &str = "InvalidParameter";
    /// The body could not be decoded
    pub const INVALID_REQUEST_CONTENT: &str = "InvalidRequestContent";
    /// The body was rejected before decoding
    pub const INVALID_RESOURCE: &str = "InvalidResource";
    /// The provider namespace is not served here
    pub const INVALID_RESOURCE_NAMESPACE: &str = "InvalidResourceNamespace";
    /// The resource type or api-version is not served here
    pub const INVALID_RESOURCE_TYPE: &str = "InvalidResourceType";
    /// The operation is not allowed in the current state
    pub const REQUEST_NOT_ALLOWED: &str = "RequestNotAllowed";
    /// No such resource
    pub const RESOURCE_NOT_FOUND: &str = "ResourceNotFound";
    /// Only JSON bodies are accepted
    pub const UNSUPPORTED_MEDIA_TYPE: &str = "UnsupportedMediaType";
}

/// An error returned to an API client
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{status} {code}: {message}")]
pub struct CloudError {
    /// HTTP status of the response
    pub status: StatusCode,
    /// Machine-readable code
    pub code: &'static str,
    /// Field or segment the error refers to; may be empty
    pub target: String,
    /// Human-readable message
    pub message: String,
}

#[derive(Serialize)]
struct Body<'a> {
    error: Inner<'a>,
}

#[derive(Serialize)]
struct Inner<'a> {
    code: &'a str,
    message: &'a str,
    target: &'a str,
}

impl CloudError {
    /// A new error
    pub fn new(
        status: StatusCode,
        code: &'static str,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code,
            target: target.into(),
            message: message.into(),
        }
    }

    /// 400 InvalidParameter naming the offending field
    pub fn invalid_parameter(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_PARAMETER,
            target,
            message,
        )
    }

    /// 400 InvalidRequestContent for a body that does not decode
    pub fn invalid_request_content(detail: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_REQUEST_CONTENT,
            "",
            format!(
                "The request content was invalid and could not be deserialized: \"{}\".",
                detail
            ),
        )
    }

    /// 400 RequestNotAllowed for an operation the state machine refuses
    pub fn request_not_allowed(state: ProvisioningState) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::REQUEST_NOT_ALLOWED,
            "",
            format!("Request is not allowed in provisioningState '{}'.", state),
        )
    }

    /// 404 ResourceNotFound
    pub fn resource_not_found(resource_type: &str, name: &str, resource_group: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            codes::RESOURCE_NOT_FOUND,
            "",
            format!(
                "The Resource '{}/{}' under resource group '{}' was not found.",
                resource_type, name, resource_group
            ),
        )
    }

    /// 403 for a caller that failed authentication
    pub fn forbidden() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            codes::FORBIDDEN,
            "",
            "Forbidden.",
        )
    }

    /// Generic 500; the cause must be logged by the caller
    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::INTERNAL_SERVER_ERROR,
            "",
            "Internal server error.",
        )
    }
}

/// Listener setup and serving failures
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// TLS material or listener settings are unusable
    #[error("configuration error: {0}")]
    Config(String),
    /// The listener failed while serving
    #[error("server error: {0}")]
    Internal(String),
}

impl From<mantle_common::Error> for CloudError {
    fn from(err: mantle_common::Error) -> Self {
        match err {
            mantle_common::Error::Validation { message, field, .. } => {
                Self::invalid_parameter(field.unwrap_or_default(), message)
            }
            other => {
                error!(error = %other, "request failed");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for CloudError {
    fn into_response(self) -> Response {
        let body = Body {
            error: Inner {
                code: self.code,
                message: &self.message,
                target: &self.target,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}
