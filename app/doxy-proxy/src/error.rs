//! Error types for the proxy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while gating, rewriting or forwarding a request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request path matched no allow-list pattern.
    #[error("'{0}' is not allowed.")]
    Forbidden(String),

    /// Request body could not be read or decoded.
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    /// Request body exceeded the rewrite buffer.
    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    /// Device mapping spec is not `host:container:perm`.
    #[error("Invalid device mapping: {0}")]
    InvalidDevice(String),

    /// Rewritten body could not be encoded.
    #[error("Failed to encode request body: {0}")]
    Encode(String),

    /// Backend socket could not be reached or the exchange failed.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Backend did not answer in time.
    #[error("Backend timeout: {0}")]
    Timeout(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server error.
    #[error("Server error: {0}")]
    Server(String),

    /// I/O error while setting up the listener.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidBody(_) | Self::InvalidDevice(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Encode(_) | Self::Config(_) | Self::Server(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns true if the error is a client disconnect rather than a fault.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        let msg = self.to_string().to_lowercase();
        msg.contains("broken pipe")
            || msg.contains("connection reset")
            || msg.contains("connection aborted")
            || msg.contains("unexpected eof")
    }
}

/// Docker-style error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub message: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), "{}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "{}", self);
        }
        let body = ErrorResponse {
            message: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}
