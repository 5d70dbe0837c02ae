//! Core type definitions for Strata
//!
//! This module defines the hierarchical keys shared by every entity:
//! project → branch → source → sink → file → volume → slice.
//! Each key renders to a canonical, `/` separated string which is also
//! used as the suffix of the metadata store keys. Timestamps sort
//! lexicographically, so keys under one parent sort by opening time.

use chrono::{DateTime, TimeDelta, Utc};
use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Millisecond precision UTC timestamp.
///
/// Renders as `2006-01-02T15:04:05.000Z`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcTime(DateTime<Utc>);

impl UtcTime {
    /// Canonical text format
    pub const FORMAT: &'static str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    /// Create from a chrono value, truncated to milliseconds
    #[must_use]
    pub fn from_datetime(value: DateTime<Utc>) -> Self {
        Self(DateTime::from_timestamp_millis(value.timestamp_millis()).unwrap_or(value))
    }

    /// Create from milliseconds since the Unix epoch
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        Self(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    /// Parse an RFC 3339 timestamp
    pub fn parse(value: &str) -> Result<Self, KeyError> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| Self::from_datetime(dt.with_timezone(&Utc)))
            .map_err(|e| KeyError::InvalidTime {
                value: value.to_string(),
                reason: e.to_string(),
            })
    }

    /// Underlying chrono value
    #[must_use]
    pub const fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds since the Unix epoch
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Timestamp shifted forward, saturating on overflow
    #[must_use]
    pub fn add(self, duration: Duration) -> Self {
        TimeDelta::from_std(duration)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map_or(self, Self)
    }

    /// Timestamp shifted backward, saturating on overflow
    #[must_use]
    pub fn sub(self, duration: Duration) -> Self {
        TimeDelta::from_std(duration)
            .ok()
            .and_then(|delta| self.0.checked_sub_signed(delta))
            .map_or(self, Self)
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    #[must_use]
    pub fn duration_since(self, earlier: Self) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(Self::FORMAT))
    }
}

impl fmt::Debug for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UtcTime({self})")
    }
}

impl Serialize for UtcTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UtcTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// Key validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("\"{field}\" is a required field")]
    Required { field: &'static str },

    #[error("\"{field}\" must not contain '/': {value:?}")]
    InvalidCharacter { field: &'static str, value: String },

    #[error("invalid time {value:?}: {reason}")]
    InvalidTime { value: String, reason: String },
}

fn validate_id(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Required { field });
    }
    if value.contains('/') {
        return Err(KeyError::InvalidCharacter {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Identifier of a branch in a project
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchKey {
    pub project_id: u64,
    pub branch_id: u64,
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.branch_id)
    }
}

/// Identifier of a data source
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKey {
    #[serde(flatten)]
    pub branch: BranchKey,
    pub source_id: String,
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.source_id)
    }
}

/// Identifier of a sink, the owner of files
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkKey {
    #[serde(flatten)]
    pub source: SourceKey,
    pub sink_id: String,
}

impl SinkKey {
    /// Build a sink key from its parts
    #[must_use]
    pub fn new(
        project_id: u64,
        branch_id: u64,
        source_id: impl Into<String>,
        sink_id: impl Into<String>,
    ) -> Self {
        Self {
            source: SourceKey {
                branch: BranchKey {
                    project_id,
                    branch_id,
                },
                source_id: source_id.into(),
            },
            sink_id: sink_id.into(),
        }
    }

    /// Check that all parts are present and valid
    pub fn validate(&self) -> Result<(), KeyError> {
        if self.source.branch.project_id == 0 {
            return Err(KeyError::Required { field: "projectId" });
        }
        if self.source.branch.branch_id == 0 {
            return Err(KeyError::Required { field: "branchId" });
        }
        validate_id("sourceId", &self.source.source_id)?;
        validate_id("sinkId", &self.sink_id)
    }

    #[must_use]
    pub const fn project_id(&self) -> u64 {
        self.source.branch.project_id
    }
}

impl fmt::Display for SinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.sink_id)
    }
}

/// Identifier of a file: the sink plus the file opening time
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    #[serde(flatten)]
    pub sink: SinkKey,
    #[serde(rename = "fileOpenedAt")]
    pub opened_at: UtcTime,
}

impl FileKey {
    #[must_use]
    pub const fn new(sink: SinkKey, opened_at: UtcTime) -> Self {
        Self { sink, opened_at }
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sink, self.opened_at)
    }
}

/// Identifier of a local disk volume
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct VolumeId(String);

impl VolumeId {
    /// Create a volume id, rejecting empty or `/` containing values
    pub fn new(id: impl Into<String>) -> Result<Self, KeyError> {
        let id = id.into();
        validate_id("volumeId", &id)?;
        Ok(Self(id))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A file on one volume, the parent of slices written by one writer
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVolumeKey {
    #[serde(flatten)]
    pub file: FileKey,
    pub volume_id: VolumeId,
}

impl fmt::Display for FileVolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file, self.volume_id)
    }
}

/// Identifier of a slice: the file volume plus the slice opening time
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceKey {
    #[serde(flatten)]
    pub file_volume: FileVolumeKey,
    #[serde(rename = "sliceOpenedAt")]
    pub opened_at: UtcTime,
}

impl SliceKey {
    #[must_use]
    pub const fn new(file_volume: FileVolumeKey, opened_at: UtcTime) -> Self {
        Self {
            file_volume,
            opened_at,
        }
    }

    #[must_use]
    pub const fn file_key(&self) -> &FileKey {
        &self.file_volume.file
    }

    #[must_use]
    pub const fn sink_key(&self) -> &SinkKey {
        &self.file_volume.file.sink
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_volume, self.opened_at)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn test_sink_key() -> SinkKey {
        SinkKey::new(123, 456, "my-source", "my-sink")
    }

    pub fn test_slice_key() -> SliceKey {
        let file = FileKey::new(
            test_sink_key(),
            UtcTime::parse("2006-01-02T15:04:05.000Z").unwrap(),
        );
        SliceKey::new(
            FileVolumeKey {
                file,
                volume_id: VolumeId::new("abcdef").unwrap(),
            },
            UtcTime::parse("2006-01-02T20:00:00.000Z").unwrap(),
        )
    }

    #[test]
    fn test_utc_time_format() {
        let t = UtcTime::parse("2006-01-02T15:04:05.123456Z").unwrap();
        assert_eq!(t.to_string(), "2006-01-02T15:04:05.123Z");
        assert_eq!(
            t.add(Duration::from_secs(90)).to_string(),
            "2006-01-02T15:05:35.123Z"
        );
    }

    #[test]
    fn test_utc_time_duration_since() {
        let a = UtcTime::parse("2000-01-01T00:00:00.000Z").unwrap();
        let b = a.add(Duration::from_secs(60));
        assert_eq!(b.duration_since(a), Duration::from_secs(60));
        assert_eq!(a.duration_since(b), Duration::ZERO);
    }

    #[test]
    fn test_slice_key_string() {
        assert_eq!(
            test_slice_key().to_string(),
            "123/456/my-source/my-sink/2006-01-02T15:04:05.000Z/abcdef/2006-01-02T20:00:00.000Z"
        );
    }

    #[test]
    fn test_key_validation() {
        assert!(test_sink_key().validate().is_ok());
        assert_eq!(
            SinkKey::new(123, 456, "", "sink").validate(),
            Err(KeyError::Required { field: "sourceId" })
        );
        assert!(VolumeId::new("a/b").is_err());
        assert!(VolumeId::new("").is_err());
    }

    #[test]
    fn test_slice_key_json_is_flat() {
        let json = serde_json::to_value(test_slice_key()).unwrap();
        assert_eq!(json["projectId"], 123);
        assert_eq!(json["sinkId"], "my-sink");
        assert_eq!(json["fileOpenedAt"], "2006-01-02T15:04:05.000Z");
        assert_eq!(json["volumeId"], "abcdef");
        assert_eq!(json["sliceOpenedAt"], "2006-01-02T20:00:00.000Z");

        let back: SliceKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, test_slice_key());
    }
}
