//! Axum-specific error types and mappings.

use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use sharefetch_core::ports::CORS_HEADERS;

/// Axum-specific error type.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Bad request (invalid resource URL).
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Only `GET` and `HEAD` are served.
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The engine is shutting down.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The download never produced a response for this client.
    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    /// A status relayed from the origin or the engine.
    #[error("{message}")]
    Relayed { status: StatusCode, message: String },

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HttpError {
    /// Map an engine `send_error` status onto a variant.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            400 => Self::BadRequest(message),
            503 => Self::ServiceUnavailable(message),
            500 => Self::Internal(message),
            other => Self::Relayed {
                status: StatusCode::from_u16(other).unwrap_or(StatusCode::BAD_GATEWAY),
                message,
            },
        }
    }

    /// HTTP status for this error.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Relayed { status, .. } => *status,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::Relayed { message, .. } => message,
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: message,
            status: status.as_u16(),
        };

        let mut response = (status, axum::Json(body)).into_response();
        for (name, value) in CORS_HEADERS {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}
