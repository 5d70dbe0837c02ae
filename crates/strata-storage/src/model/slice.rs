//! Slice entity and its state machine.
//!
//! ```text
//! Writing -> Closing -> Uploading -> Uploaded -> Imported
//! ```
//!
//! `Imported` is only set together with the parent file.

use super::file::FileState;
use super::level::Level;
use super::retry::Retryable;
use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use strata_common::config::{Compression, StorageConfig, UploadConfig};
use strata_common::{SliceKey, UtcTime};

/// State of a slice
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceState {
    Writing,
    Closing,
    Uploading,
    Uploaded,
    Imported,
}

impl SliceState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Writing => "writing",
            Self::Closing => "closing",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Imported => "imported",
        }
    }

    #[must_use]
    pub const fn level(self) -> Level {
        match self {
            Self::Writing | Self::Closing | Self::Uploading => Level::Local,
            Self::Uploaded => Level::Staging,
            Self::Imported => Level::Target,
        }
    }

    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Writing, Self::Closing)
                | (Self::Closing, Self::Uploading)
                | (Self::Uploading, Self::Uploaded)
                | (Self::Uploaded, Self::Imported)
        )
    }
}

impl fmt::Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that the slice state is allowed while the file is in the file state
pub fn validate_file_and_slice_states(
    slice: &SliceKey,
    file_state: FileState,
    slice_state: SliceState,
) -> StorageResult<()> {
    use SliceState::{Closing, Imported, Uploaded, Uploading, Writing};
    let ok = match file_state {
        FileState::Writing => matches!(slice_state, Writing | Closing | Uploading | Uploaded),
        FileState::Closing => matches!(slice_state, Closing | Uploading | Uploaded),
        FileState::Importing => slice_state == Uploaded,
        FileState::Imported => slice_state == Imported,
    };
    if ok {
        Ok(())
    } else {
        Err(StorageError::IncompatibleStates {
            slice: slice.to_string(),
            slice_state,
            file_state,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceLocalStorage {
    pub compression: Compression,
    /// Directory of the slice on the volume
    pub dir: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceStagingStorage {
    pub compression: Compression,
    /// Object name in the staging storage
    pub object_name: String,
    pub upload: UploadConfig,
}

/// A slice, the unit of upload written by one volume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    #[serde(flatten)]
    pub key: SliceKey,
    pub state: SliceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploading_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
    pub last_state_change: UtcTime,
    /// Set when the slice is closed, an empty slice is not uploaded
    #[serde(default)]
    pub is_empty: bool,
    pub local_storage: SliceLocalStorage,
    pub staging_storage: SliceStagingStorage,
    #[serde(flatten)]
    pub retry: Retryable,
}

impl Slice {
    /// New slice in the `Writing` state, opened at the key timestamp
    #[must_use]
    pub fn new(key: SliceKey, config: &StorageConfig) -> Self {
        let compression = config.local.compression;
        let opened_at = key.opened_at;
        let file_dir = key.file_key().opened_at.to_string().replace(':', "-");
        let slice_name = opened_at.to_string().replace(':', "-");
        Self {
            state: SliceState::Writing,
            closing_at: None,
            uploading_at: None,
            uploaded_at: None,
            imported_at: None,
            last_state_change: opened_at,
            is_empty: false,
            local_storage: SliceLocalStorage {
                compression,
                dir: format!("{}/{file_dir}/{slice_name}", key.sink_key()),
            },
            staging_storage: SliceStagingStorage {
                compression,
                object_name: format!("{slice_name}_{}.csv", key.file_volume.volume_id),
                upload: config.staging.upload,
            },
            retry: Retryable::default(),
            key,
        }
    }

    #[must_use]
    pub const fn level(&self) -> Level {
        self.state.level()
    }

    /// Switch the state, the retry record is reset
    pub fn transition(&mut self, now: UtcTime, to: SliceState) -> StorageResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                kind: "slice",
                key: self.key.to_string(),
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }

        match to {
            SliceState::Closing => self.closing_at = Some(now),
            SliceState::Uploading => self.uploading_at = Some(now),
            SliceState::Uploaded => self.uploaded_at = Some(now),
            SliceState::Imported => self.imported_at = Some(now),
            SliceState::Writing => {}
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
    use strata_common::{FileKey, FileVolumeKey, SinkKey, VolumeId};

    pub fn test_slice() -> Slice {
        let file = FileKey::new(
            SinkKey::new(123, 456, "my-source", "my-sink"),
            UtcTime::parse("2000-01-01T01:00:00.000Z").unwrap(),
        );
        let key = SliceKey::new(
            FileVolumeKey {
                file,
                volume_id: VolumeId::new("my-volume").unwrap(),
            },
            UtcTime::parse("2000-01-01T01:00:00.000Z").unwrap(),
        );
        Slice::new(key, &StorageConfig::default())
    }

    #[test]
    fn test_slice_state_machine() {
        let mut slice = test_slice();
        let now = UtcTime::parse("2000-01-01T02:00:00.000Z").unwrap();
        assert!(slice.transition(now, SliceState::Uploaded).is_err());
        slice.transition(now, SliceState::Closing).unwrap();
        slice.transition(now, SliceState::Uploading).unwrap();
        assert_eq!(slice.level(), Level::Local);
        slice.transition(now, SliceState::Uploaded).unwrap();
        assert_eq!(slice.level(), Level::Staging);
        assert_eq!(slice.uploaded_at, Some(now));
        slice.transition(now, SliceState::Imported).unwrap();
        assert_eq!(slice.level(), Level::Target);
    }

    #[test]
    fn test_slice_storage_names() {
        let slice = test_slice();
        assert_eq!(
            slice.local_storage.dir,
            "123/456/my-source/my-sink/2000-01-01T01-00-00.000Z/2000-01-01T01-00-00.000Z"
        );
        assert_eq!(
            slice.staging_storage.object_name,
            "2000-01-01T01-00-00.000Z_my-volume.csv"
        );
    }

    #[test]
    fn test_file_and_slice_states() {
        let key = test_slice().key;
        assert!(validate_file_and_slice_states(&key, FileState::Writing, SliceState::Uploaded).is_ok());
        assert!(validate_file_and_slice_states(&key, FileState::Closing, SliceState::Writing).is_err());
        assert!(validate_file_and_slice_states(&key, FileState::Importing, SliceState::Uploading).is_err());
        assert!(validate_file_and_slice_states(&key, FileState::Importing, SliceState::Uploaded).is_ok());

        let err = validate_file_and_slice_states(&key, FileState::Imported, SliceState::Uploaded).unwrap_err();
        assert!(err.is_invalid_transition());
        assert!(err.to_string().ends_with("state \"uploaded\" for the file state \"imported\""));
    }
}
