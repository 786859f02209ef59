//! Error types for the gateway.
//!
//! Configuration and lifecycle failures are [`GatewayError`]s returned to the
//! caller of the restart path. Per-call failures travel as [`tonic::Status`]
//! on both transports; the HTTP transport renders them with
//! [`ErrorResponse`].

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::{Code, Status};

use crate::config::TransportKind;

/// Gateway-level errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid listen address: {0}")]
    InvalidListenAddress(String),

    #[error("Invalid transport: {0} (expected none, http or rpc)")]
    InvalidTransport(String),

    #[error("Invalid HTTP path: {0:?} (must start with '/')")]
    InvalidHttpPath(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{transport} transport did not drain within {grace:?}")]
    ShutdownTimeout {
        transport: TransportKind,
        grace: Duration,
    },

    #[error("Connection failed: {0}")]
    Connect(#[from] tonic::transport::Error),
}

impl GatewayError {
    /// Whether the error comes from the configuration (fix config and commit
    /// another change to retry).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidListenAddress(_)
                | GatewayError::InvalidTransport(_)
                | GatewayError::InvalidHttpPath(_)
                | GatewayError::Bind { .. }
        )
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Status returned when no handler matches a canonical key.
pub fn route_not_found(key: &str) -> Status {
    Status::not_found(format!("no service can help you: {key}"))
}

/// Error response for HTTP clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Add details to the error response.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl From<&Status> for ErrorResponse {
    fn from(status: &Status) -> Self {
        Self::new(code_name(status.code()), status.message())
    }
}

/// Stable upper-case name of a gRPC code.
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// HTTP status used when a gRPC code is rendered by the HTTP transport.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        // 499 Client Closed Request
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render a call status as an HTTP response with a JSON body.
pub fn status_response(status: &Status) -> Response {
    (http_status(status.code()), Json(ErrorResponse::from(status))).into_response()
}
