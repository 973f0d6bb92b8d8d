//! Error types for Lambdadelta

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Lambdadelta core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Malformed hex identifier
    #[error("invalid hex identifier: {0}")]
    InvalidHex(String),
}
