//! Error types for gset

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// gset wire and encoding errors
#[derive(Debug, Error)]
pub enum Error {
    /// Canonical (postcard) encoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Inbound JSON did not match any known envelope shape
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Envelope was well formed but a required field was absent
    #[error("missing required field: {0}")]
    MissingField(String),
}
