//! File entity and its state machine.
//!
//! ```text
//! Writing -> Closing -> Importing -> Imported
//! ```

use super::level::Level;
use super::retry::Retryable;
use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use strata_common::config::{Compression, ImportConfig, StorageConfig};
use strata_common::{FileKey, UtcTime, VolumeId};

/// State of a file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Writing,
    Closing,
    Importing,
    Imported,
}

impl FileState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Writing => "writing",
            Self::Closing => "closing",
            Self::Importing => "importing",
            Self::Imported => "imported",
        }
    }

    /// Storage level of the file data in this state
    #[must_use]
    pub const fn level(self) -> Level {
        match self {
            Self::Writing | Self::Closing => Level::Local,
            Self::Importing => Level::Staging,
            Self::Imported => Level::Target,
        }
    }

    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Writing, Self::Closing) | (Self::Closing, Self::Importing) | (Self::Importing, Self::Imported)
        )
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLocalStorage {
    pub compression: Compression,
    /// Number of volumes the file is written to
    pub volumes_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStagingStorage {
    pub compression: Compression,
    /// The file must be imported before this time
    pub expiration: UtcTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTargetStorage {
    pub import: ImportConfig,
}

/// A file, the unit of import into the target storage
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(flatten)]
    pub key: FileKey,
    pub state: FileState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
    pub last_state_change: UtcTime,
    /// Set when the file is closed, an empty file is not imported
    #[serde(default)]
    pub is_empty: bool,
    /// Writer volumes of the file
    pub assignment: Vec<VolumeId>,
    pub local_storage: FileLocalStorage,
    pub staging_storage: FileStagingStorage,
    pub target_storage: FileTargetStorage,
    #[serde(flatten)]
    pub retry: Retryable,
}

impl File {
    /// New file in the `Writing` state, opened at the key timestamp
    #[must_use]
    pub fn new(key: FileKey, config: &StorageConfig, assignment: Vec<VolumeId>) -> Self {
        let opened_at = key.opened_at;
        Self {
            state: FileState::Writing,
            closing_at: None,
            importing_at: None,
            imported_at: None,
            last_state_change: opened_at,
            is_empty: false,
            local_storage: FileLocalStorage {
                compression: config.local.compression,
                volumes_count: assignment.len(),
            },
            staging_storage: FileStagingStorage {
                compression: config.local.compression,
                expiration: opened_at.add(config.staging.file_expiration()),
            },
            target_storage: FileTargetStorage {
                import: config.target.import,
            },
            assignment,
            retry: Retryable::default(),
            key,
        }
    }

    #[must_use]
    pub const fn level(&self) -> Level {
        self.state.level()
    }

    /// Switch the state, the retry record is reset
    pub fn transition(&mut self, now: UtcTime, to: FileState) -> StorageResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                kind: "file",
                key: self.key.to_string(),
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }

        match to {
            FileState::Closing => self.closing_at = Some(now),
            FileState::Importing => self.importing_at = Some(now),
            FileState::Imported => self.imported_at = Some(now),
            FileState::Writing => {}
        }
        self.state = to;
        self.last_state_change = now;
        self.retry.reset_retry();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use strata_common::SinkKey;

    pub fn test_file() -> File {
        let key = FileKey::new(
            SinkKey::new(123, 456, "my-source", "my-sink"),
            UtcTime::parse("2000-01-01T01:00:00.000Z").unwrap(),
        );
        File::new(key, &StorageConfig::default(), vec![VolumeId::new("my-volume").unwrap()])
    }

    #[test]
    fn test_file_state_machine() {
        let mut file = test_file();
        let now = UtcTime::parse("2000-01-01T02:00:00.000Z").unwrap();
        assert_eq!(file.level(), Level::Local);

        let err = file.transition(now, FileState::Importing).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid state transition of the file \"123/456/my-source/my-sink/2000-01-01T01:00:00.000Z\": \"writing\" -> \"importing\""
        );

        file.retry.increment_retry(now, "error");
        file.transition(now, FileState::Closing).unwrap();
        assert_eq!(file.closing_at, Some(now));
        assert_eq!(file.last_state_change, now);
        assert_eq!(file.retry, Retryable::default());

        file.transition(now, FileState::Importing).unwrap();
        assert_eq!(file.level(), Level::Staging);
        file.transition(now, FileState::Imported).unwrap();
        assert_eq!(file.level(), Level::Target);
        assert!(file.transition(now, FileState::Writing).is_err());
    }

    #[test]
    fn test_file_expiration() {
        let file = test_file();
        assert_eq!(file.staging_storage.expiration.to_string(), "2000-01-02T01:00:00.000Z");
    }

    #[test]
    fn test_file_json() {
        let mut file = test_file();
        file.retry
            .increment_retry(UtcTime::parse("2000-01-01T03:00:00.000Z").unwrap(), "some error");
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["state"], "writing");
        assert_eq!(json["sinkId"], "my-sink");
        assert_eq!(json["retryAttempt"], 1);
        assert_eq!(json["targetStorage"]["import"]["trigger"]["slicesCount"], 100);

        let back: File = serde_json::from_value(json).unwrap();
        assert_eq!(back, file);
    }
}
