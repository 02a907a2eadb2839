//! Error types for Tokenwarden.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Tokenwarden operations.
#[derive(Error, Debug)]
pub enum TokenwardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bucket store errors
    #[error("Bucket store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tokenwarden operations.
pub type Result<T> = std::result::Result<T, TokenwardenError>;
