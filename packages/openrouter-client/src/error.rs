//! Error types for the OpenRouter client.

use thiserror::Error;

/// Result type for OpenRouter client operations.
pub type Result<T> = std::result::Result<T, OpenRouterError>;

#[derive(Debug, Error)]
pub enum OpenRouterError {
    /// Configuration error (missing API key, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// API error (non-2xx response, rate limit, invalid request)
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Parse error (invalid JSON, unexpected response format)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl OpenRouterError {
    /// Rate limits and upstream 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            OpenRouterError::Network(_) => true,
            OpenRouterError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
