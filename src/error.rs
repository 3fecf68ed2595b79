//! Mimir error types

use std::time::Duration;

/// Mimir error types
#[derive(Debug, thiserror::Error)]
pub enum MimirError {
    // Request admission errors
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("missing or unknown credential")]
    Unauthenticated,

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("server is shutting down")]
    ShuttingDown,

    // Dependency errors
    #[error("key-value store error: {0}")]
    Kv(String),

    #[error("embedding producer error: {0}")]
    Embedding(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The completion endpoint rejected our credentials (401/403).
    /// Never retried.
    #[error("completion endpoint rejected the configured credentials")]
    AuthConfig,

    /// Breaker open or retries exhausted against the completion endpoint.
    #[error("completion service unavailable")]
    LlmUnavailable,

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A 2xx response whose body did not parse. Not transient: the
    /// endpoint answered, it just answered garbage.
    #[error("malformed response body: {0}")]
    MalformedResponse(String),

    #[error("empty response from completion endpoint")]
    EmptyResponse,

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MimirError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Connection-level failures, 5xx responses, and 429s are transient.
    /// Everything else (validation, credentials, parse errors) is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            MimirError::Http(_) | MimirError::Kv(_) => true,
            MimirError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Short machine code carried in wire error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            MimirError::Validation(_) => "validation_error",
            MimirError::Unauthenticated => "unauthenticated",
            MimirError::RateLimited { .. } => "rate_limited",
            MimirError::ShuttingDown
            | MimirError::Kv(_)
            | MimirError::Embedding(_)
            | MimirError::Http(_)
            | MimirError::Api { .. }
            | MimirError::LlmUnavailable => "service_unavailable",
            MimirError::AuthConfig
            | MimirError::Json(_)
            | MimirError::MalformedResponse(_)
            | MimirError::EmptyResponse
            | MimirError::Configuration(_)
            | MimirError::Internal(_) => "internal_error",
        }
    }

    /// HTTP-equivalent status for the transport layer.
    pub fn http_status(&self) -> u16 {
        match self {
            MimirError::Validation(_) => 400,
            MimirError::Unauthenticated => 401,
            MimirError::RateLimited { .. } => 429,
            MimirError::ShuttingDown
            | MimirError::Kv(_)
            | MimirError::Embedding(_)
            | MimirError::Http(_)
            | MimirError::Api { .. }
            | MimirError::LlmUnavailable => 503,
            MimirError::AuthConfig
            | MimirError::Json(_)
            | MimirError::MalformedResponse(_)
            | MimirError::EmptyResponse
            | MimirError::Configuration(_)
            | MimirError::Internal(_) => 500,
        }
    }
}

/// Result type alias for Mimir operations
pub type Result<T> = std::result::Result<T, MimirError>;
