//! Error types for the operators

use crate::provider::ProviderError;
use std::time::Duration;
use strata_common::KeyError;
use strata_common::format::format_duration;
use strata_meta_store::{KvError, LockError};
use strata_placement::DistributionError;
use strata_storage::StorageError;
use thiserror::Error;

/// Result type for operator operations
pub type OperatorResult<T> = std::result::Result<T, OperatorError>;

/// Operator error type
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Distribution(#[from] DistributionError),

    #[error("{0}")]
    Lock(#[from] LockError),

    #[error("metadata store error: {0}")]
    Store(#[from] KvError),

    #[error("invalid key: {0}")]
    Key(#[from] KeyError),

    #[error("slice upload failed: {0}")]
    Upload(ProviderError),

    #[error("file import failed: {0}")]
    Import(ProviderError),

    #[error("{operation} timed out after {}", format_duration(*.timeout))]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{operation} interrupted, the mirror was closed")]
    MirrorClosed { operation: &'static str },

    #[error("{operation} interrupted, the operators are stopping")]
    Shutdown { operation: &'static str },
}

impl OperatorError {
    /// The entity was changed concurrently and is no longer in the expected state
    #[must_use]
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_invalid_transition())
    }

    /// The operation was interrupted by the node shutdown, it is not a failure of the entity
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        match self {
            Self::Shutdown { .. } | Self::MirrorClosed { .. } => true,
            Self::Storage(e) => e.is_mirror_stopped(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::Timeout {
            operation: "slice upload",
            timeout: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "slice upload timed out after 5m0s");

        let err = OperatorError::Upload(ProviderError::new("connection refused"));
        assert_eq!(err.to_string(), "slice upload failed: connection refused");
        assert!(!err.is_invalid_transition());
        assert!(!err.is_shutdown());
    }

    #[test]
    fn test_shutdown_errors() {
        let err = OperatorError::Shutdown {
            operation: "waiting for file slices upload",
        };
        assert_eq!(
            err.to_string(),
            "waiting for file slices upload interrupted, the operators are stopping"
        );
        assert!(err.is_shutdown());

        let err = OperatorError::from(StorageError::MirrorStopped {
            name: "statistics".to_string(),
        });
        assert!(err.is_shutdown());
        assert!(!OperatorError::Timeout {
            operation: "file import",
            timeout: Duration::from_secs(1),
        }
        .is_shutdown());
    }
}
