//! Error types for the HTTP cache

use std::io;

use http::StatusCode;
use thiserror::Error;

/// Result type alias for the HTTP cache
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP cache errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request rejected by the access policy
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Request could not be understood (missing destination, bad method or URI)
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Cache store unreachable or holding a corrupt entry
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// Forwarding to the origin failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Message broker error
    #[error("Queue error: {0}")]
    Queue(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map the error to the status the HTTP ingress answers with
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::AccessDenied(_) => StatusCode::FORBIDDEN,
            Self::Upstream(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Backend(_) | Self::Redis(_) | Self::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure is caused by the request itself rather than by
    /// a collaborator. Such failures never succeed on redelivery.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedRequest(_))
    }
}
