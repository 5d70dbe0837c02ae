//! Error types for the storage layer

use crate::model::{FileState, SliceState};
use strata_common::KeyError;
use strata_meta_store::{KvError, LockError};
use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage error type
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{kind} \"{key}\" not found in the {parent}")]
    NotFound {
        kind: &'static str,
        key: String,
        parent: &'static str,
    },

    #[error("{kind} \"{key}\" already exists in the {parent}")]
    AlreadyExists {
        kind: &'static str,
        key: String,
        parent: &'static str,
    },

    #[error("invalid state transition of the {kind} \"{key}\": \"{from}\" -> \"{to}\"")]
    InvalidTransition {
        kind: &'static str,
        key: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("{kind} \"{key}\" is in \"{state}\" state, expected \"{expected}\"")]
    UnexpectedState {
        kind: &'static str,
        key: String,
        state: &'static str,
        expected: &'static str,
    },

    #[error("slice cannot be created: unexpected file \"{key}\" state \"{state}\", expected \"writing\"")]
    FileNotWriting { key: String, state: FileState },

    #[error("unexpected slice \"{slice}\" state \"{slice_state}\" for the file state \"{file_state}\"")]
    IncompatibleStates {
        slice: String,
        slice_state: SliceState,
        file_state: FileState,
    },

    #[error("no volume is available for the file")]
    NoVolume,

    #[error("{0}")]
    BadRequest(String),

    #[error("mirror \"{name}\" stopped")]
    MirrorStopped { name: String },

    #[error("transaction conflict, gave up after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("invalid configuration: {0}")]
    Config(#[from] strata_common::Error),

    #[error("invalid key: {0}")]
    Key(#[from] KeyError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("metadata store error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StorageError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// The entity is not in the state the operation expects
    #[must_use]
    pub const fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::UnexpectedState { .. } | Self::IncompatibleStates { .. }
        )
    }

    /// The node is shutting down, the operation was not finished
    #[must_use]
    pub const fn is_mirror_stopped(&self) -> bool {
        matches!(self, Self::MirrorStopped { .. })
    }

    /// The lock was lost or could not be acquired
    #[must_use]
    pub const fn is_lock_error(&self) -> bool {
        matches!(self, Self::Lock(_))
    }
}
