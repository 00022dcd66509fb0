use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in the rate limiting proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Forwarding error: {0}")]
    Forward(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Client-caused failures to derive a rate limit identifier
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("Missing API Key")]
    MissingApiKey,

    #[error("Invalid remote address")]
    InvalidRemoteAddress,
}

impl ProxyError {
    /// HTTP status reported to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Classification(ClassificationError::MissingApiKey) => StatusCode::UNAUTHORIZED,
            ProxyError::Classification(ClassificationError::InvalidRemoteAddress) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) | ProxyError::Forward(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Infrastructure details stay in the logs
        let body = match &self {
            ProxyError::Classification(e) => e.to_string(),
            ProxyError::Upstream(_) | ProxyError::Forward(_) => "Bad Gateway".to_string(),
            _ => "Internal Server Error".to_string(),
        };
        (status, body).into_response()
    }
}
