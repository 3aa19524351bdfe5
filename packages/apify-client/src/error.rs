//! Error types for the Apify client.

use thiserror::Error;

/// Result type for Apify client operations.
pub type Result<T> = std::result::Result<T, ApifyError>;

/// Apify client errors.
#[derive(Debug, Error)]
pub enum ApifyError {
    /// Configuration error (missing token)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport or decoding failure from reqwest
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response from the Apify API
    #[error("Apify API error ({status}): {message}")]
    Api { status: u16, message: String },
}
