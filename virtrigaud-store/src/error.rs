//! Store error types.

use thiserror::Error;

use virtrigaud_api::ObjectKey;

/// Errors surfaced by store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    /// Optimistic concurrency failure: the caller wrote with a stale
    /// resource version. Re-read and retry.
    #[error("conflict writing {kind} {key}: resource version is stale")]
    Conflict { kind: &'static str, key: ObjectKey },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
