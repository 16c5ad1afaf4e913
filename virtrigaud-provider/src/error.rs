//! Provider RPC errors.
//!
//! Each variant corresponds to one error kind the reconcilers distinguish;
//! the kind string travels on the wire so HTTP clients can reconstruct the
//! variant.

use thiserror::Error;

/// Errors surfaced by provider worker calls.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// The request was invalid; retrying without a spec change is useless.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// The referenced entity does not exist on the hypervisor.
    #[error("not found: {0}")]
    NotFound(String),

    /// The worker is unreachable or reports itself not ready.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// A provider task ended with a terminal error.
    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The worker is shedding load; back off before retrying.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The operation needs a capability the worker does not report.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Wire tag for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::InvalidSpec(_) => "InvalidSpec",
            ProviderError::NotFound(_) => "NotFound",
            ProviderError::Unavailable(_) => "Unavailable",
            ProviderError::TaskFailed(_) => "TaskFailed",
            ProviderError::ChecksumMismatch { .. } => "ChecksumMismatch",
            ProviderError::RateLimited(_) => "RateLimited",
            ProviderError::Unsupported(_) => "Unsupported",
            ProviderError::Network(_) => "Network",
            ProviderError::Internal(_) => "Internal",
        }
    }

    /// Rebuild a variant from its wire tag.
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "InvalidSpec" => ProviderError::InvalidSpec(message),
            "NotFound" => ProviderError::NotFound(message),
            "Unavailable" => ProviderError::Unavailable(message),
            "TaskFailed" => ProviderError::TaskFailed(message),
            "RateLimited" => ProviderError::RateLimited(message),
            "Unsupported" => ProviderError::Unsupported(message),
            "Network" => ProviderError::Network(message),
            _ => ProviderError::Internal(message),
        }
    }

    /// Whether the failure is expected to self-heal with time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_)
                | ProviderError::RateLimited(_)
                | ProviderError::Network(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        let errors = [
            ProviderError::InvalidSpec("x".into()),
            ProviderError::NotFound("x".into()),
            ProviderError::Unavailable("x".into()),
            ProviderError::TaskFailed("x".into()),
            ProviderError::RateLimited("x".into()),
            ProviderError::Unsupported("x".into()),
            ProviderError::Network("x".into()),
            ProviderError::Internal("x".into()),
        ];
        for err in errors {
            let back = ProviderError::from_kind(err.kind(), "x".into());
            assert_eq!(back.kind(), err.kind());
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Network("x".into()).is_retryable());
        assert!(ProviderError::Unavailable("x".into()).is_retryable());
        assert!(!ProviderError::InvalidSpec("x".into()).is_retryable());
        assert!(!ProviderError::TaskFailed("x".into()).is_retryable());
    }
}
