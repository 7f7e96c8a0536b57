//! Error types for the relay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt;

/// Relay error type.
#[derive(Debug)]
pub enum Error {
    /// Configuration error.
    Config(String),
    /// Single upstream attempt failure. Consumed by the dispatcher's
    /// retry loop; surfaces directly only on a mid-stream failure.
    Upstream { status: u16, message: String },
    /// Retry budget spent. Carries the last observed upstream status.
    Exhausted { status: u16, attempts: u32 },
    /// No credential available: the pool is empty.
    Disabled,
    /// Caller abandoned the request.
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::Upstream { status, message } => {
                write!(f, "upstream error (status {status}): {message}")
            }
            Error::Exhausted { status, attempts } => write!(
                f,
                "retry budget exhausted after {attempts} attempts (last status {status})"
            ),
            Error::Disabled => write!(f, "no usable api keys"),
            Error::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Upstream { status, .. } | Error::Exhausted { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            // Client-closed-request, as popularised by nginx.
            Error::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "success": false,
            "error": self.to_string()
        });
        (status, Json(body)).into_response()
    }
}
