//! Error types for the credential proxy

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the credential proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Credential proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identity token or credential refresh failed (cache already cleared)
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Policy gateway explicitly rejected the request
    #[error("Request not approved by policy gateway (status: {status})")]
    AuthorizationDenied {
        /// Verdict status reported by the gateway
        status: String,
        /// Raw verdict payload, kept for audit logging
        verdict: serde_json::Value,
    },

    /// Policy gateway unreachable, timed out, or answered non-2xx
    #[error("Policy gateway request failed: {0}")]
    Gateway(String),

    /// Requested backend operation does not exist on the resolved service
    #[error("Invalid Bedrock operation: {0}")]
    InvalidOperation(String),

    /// Backend call failed
    #[error("Error calling Bedrock service: {0}")]
    Backend(String),

    /// Inbound request could not be parsed
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap any upstream failure as an authentication error
    pub fn auth(context: &str, source: impl std::fmt::Display) -> Self {
        Self::Auth(format!("{context}: {source}"))
    }

    /// HTTP status this error maps to at the request boundary
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidOperation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthorizationDenied { .. } => StatusCode::FORBIDDEN,
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
