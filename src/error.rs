use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the gateway
#[derive(Error, Debug)]
pub enum GateError {
    // Forwarder errors
    #[error("Forwarder connection failed: {0}")]
    ForwarderConnectionFailed(String),

    #[error("Invalid forwarder: {0}")]
    InvalidForwarder(String),

    #[error("Unsupported forwarder protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Authentication errors
    #[error("Authentication failed")]
    AuthenticationFailed,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not allowed, use {0}")]
    MethodNotAllowed(&'static str),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GateError>;

impl GateError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            GateError::InvalidRequest(_)
            | GateError::InvalidForwarder(_)
            | GateError::UnsupportedProtocol(_)
            | GateError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 407 Proxy Authentication Required
            GateError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 404 Not Found
            GateError::NotFound(_) => StatusCode::NOT_FOUND,

            // 405 Method Not Allowed
            GateError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,

            // 502 Bad Gateway
            GateError::ForwarderConnectionFailed(_) | GateError::ConnectFailed(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 504 Gateway Timeout
            GateError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            GateError::Io(_) | GateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Control API errors share the `{success, message}` envelope with successful replies
impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "success": false,
            "message": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for GateError {
    fn from(err: url::ParseError) -> Self {
        GateError::InvalidForwarder(err.to_string())
    }
}
