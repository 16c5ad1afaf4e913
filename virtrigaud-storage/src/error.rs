//! Storage driver errors.

use thiserror::Error;

/// Errors surfaced by staging storage drivers.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid staging URL {0:?}")]
    InvalidUrl(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Transient transport failure; retried by the driver up to its retry
    /// budget before being propagated.
    #[error("network error: {0}")]
    Network(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
