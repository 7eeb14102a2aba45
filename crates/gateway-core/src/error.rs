//! Top-level error types for the gateway core.

use thiserror::Error;

/// Errors surfaced by the key-value client (§6 KV store required operations).
#[derive(Debug, Error)]
pub enum KvError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation timed out")]
    Timeout,
}

/// Result alias for KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors from the request queue (§4.2).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' is at capacity")]
    Full(String),

    #[error("key-value store error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("item not found: {0}")]
    NotFound(String),
}

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Provider error taxonomy (§4.3).
///
/// Every variant carries a human-readable message; `status_code` and
/// `retry_after` are populated when recovered from an upstream HTTP
/// response.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{message}")]
    Generic {
        message: String,
        status_code: Option<u16>,
    },

    #[error("request to upstream provider timed out: {message}")]
    Timeout { message: String },

    #[error("upstream rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after: u64,
    },

    #[error("upstream authentication failed: {message}")]
    Auth { message: String },

    #[error("model or resource not found: {message}")]
    NotFound { message: String },

    #[error("upstream provider unavailable: {message}")]
    Unavailable {
        message: String,
        retry_after: u64,
    },
}

impl ProviderError {
    pub fn message(&self) -> &str {
        match self {
            ProviderError::Generic { message, .. }
            | ProviderError::Timeout { message }
            | ProviderError::RateLimit { message, .. }
            | ProviderError::Auth { message }
            | ProviderError::NotFound { message }
            | ProviderError::Unavailable { message, .. } => message,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimit { retry_after, .. }
            | ProviderError::Unavailable { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::Generic { status_code, .. } => *status_code,
            ProviderError::Timeout { .. } => Some(408),
            ProviderError::RateLimit { .. } => Some(429),
            ProviderError::Auth { .. } => Some(401),
            ProviderError::NotFound { .. } => Some(404),
            ProviderError::Unavailable { .. } => Some(503),
        }
    }

    /// Classify an upstream HTTP status into the provider error taxonomy,
    /// per spec.md §4.3's mapping table.
    pub fn from_status(status: u16, body: impl Into<String>, retry_after_header: Option<u64>) -> Self {
        let message = body.into();
        match status {
            401 | 403 => ProviderError::Auth { message },
            404 => ProviderError::NotFound { message },
            408 => ProviderError::Timeout { message },
            429 => ProviderError::RateLimit {
                message,
                retry_after: retry_after_header.unwrap_or(60),
            },
            500..=599 => ProviderError::Unavailable {
                message,
                retry_after: retry_after_header.unwrap_or(60),
            },
            _ => ProviderError::Generic {
                message,
                status_code: Some(status),
            },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout {
                message: err.to_string(),
            }
        } else if err.is_connect() {
            ProviderError::Unavailable {
                message: err.to_string(),
                retry_after: 30,
            }
        } else {
            ProviderError::Generic {
                message: err.to_string(),
                status_code: err.status().map(|s| s.as_u16()),
            }
        }
    }
}

/// Result alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Top-level error uniting the three subsystems, used by the admission glue.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
