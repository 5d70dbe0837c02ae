//! Key layout of the storage entities in the metadata store.
//!
//! Files and slices are stored twice, under `all` and under their current
//! level. Every prefix ends with `/`, so a sink never matches a sibling
//! whose id only starts with the same characters.

use crate::model::{JobKey, Level};
use strata_common::{FileKey, FileVolumeKey, SinkKey, SliceKey, VolumeId};

pub const FILE_ALL_PREFIX: &str = "storage/file/all/";
pub const SLICE_ALL_PREFIX: &str = "storage/slice/all/";
pub const STATS_PREFIX: &str = "storage/stats/";
pub const VOLUME_WRITER_PREFIX: &str = "storage/volume/writer/";
pub const JOB_PREFIX: &str = "storage/job/";
pub const CLOSESYNC_SOURCE_PREFIX: &str = "storage/closesync/source/";
pub const SINK_PREFIX: &str = "definition/sink/";

/// Node id under which the folded statistics of a slice are stored
pub const STATS_SUM: &str = "_sum";

// ---- Files ----

pub fn file_all(key: &FileKey) -> String {
    format!("{FILE_ALL_PREFIX}{key}")
}

pub fn file_level_prefix(level: Level) -> String {
    format!("storage/file/level/{level}/")
}

pub fn file_level(level: Level, key: &FileKey) -> String {
    format!("{}{key}", file_level_prefix(level))
}

pub fn files_all_in_sink(sink: &SinkKey) -> String {
    format!("{FILE_ALL_PREFIX}{sink}/")
}

pub fn files_level_in_sink(level: Level, sink: &SinkKey) -> String {
    format!("{}{sink}/", file_level_prefix(level))
}

// ---- Slices ----

pub fn slice_all(key: &SliceKey) -> String {
    format!("{SLICE_ALL_PREFIX}{key}")
}

pub fn slice_level_prefix(level: Level) -> String {
    format!("storage/slice/level/{level}/")
}

pub fn slice_level(level: Level, key: &SliceKey) -> String {
    format!("{}{key}", slice_level_prefix(level))
}

pub fn slices_all_in_file(file: &FileKey) -> String {
    format!("{SLICE_ALL_PREFIX}{file}/")
}

pub fn slices_level_in_file(level: Level, file: &FileKey) -> String {
    format!("{}{file}/", slice_level_prefix(level))
}

pub fn slices_all_in_file_volume(file_volume: &FileVolumeKey) -> String {
    format!("{SLICE_ALL_PREFIX}{file_volume}/")
}

// ---- Statistics ----

pub fn stats_level_prefix(level: Level) -> String {
    format!("{STATS_PREFIX}{level}/")
}

pub fn stats_in_slice(level: Level, slice: &SliceKey) -> String {
    format!("{}{slice}/", stats_level_prefix(level))
}

pub fn stats_in_file(level: Level, file: &FileKey) -> String {
    format!("{}{file}/", stats_level_prefix(level))
}

pub fn stats_in_sink(level: Level, sink: &SinkKey) -> String {
    format!("{}{sink}/", stats_level_prefix(level))
}

pub fn stats_node(level: Level, slice: &SliceKey, node_id: &str) -> String {
    format!("{}{node_id}", stats_in_slice(level, slice))
}

pub fn stats_sum(level: Level, slice: &SliceKey) -> String {
    stats_node(level, slice, STATS_SUM)
}

// ---- Other entities ----

pub fn volume_writer(id: &VolumeId) -> String {
    format!("{VOLUME_WRITER_PREFIX}{id}")
}

pub fn sink(key: &SinkKey) -> String {
    format!("{SINK_PREFIX}{key}")
}

pub fn job(key: &JobKey) -> String {
    format!("{JOB_PREFIX}{key}")
}

pub fn jobs_in_sink(sink: &SinkKey) -> String {
    format!("{JOB_PREFIX}{sink}/")
}

pub fn closesync_source(node_id: &str) -> String {
    format!("{CLOSESYNC_SOURCE_PREFIX}{node_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::UtcTime;

    fn slice_key() -> SliceKey {
        let file = FileKey::new(
            SinkKey::new(123, 456, "my-source", "my-sink"),
            UtcTime::parse("2000-01-01T01:00:00.000Z").unwrap(),
        );
        SliceKey::new(
            FileVolumeKey {
                file,
                volume_id: VolumeId::new("my-volume").unwrap(),
            },
            UtcTime::parse("2000-01-01T02:00:00.000Z").unwrap(),
        )
    }

    #[test]
    fn test_slice_keys() {
        let key = slice_key();
        assert_eq!(
            slice_level(Level::Local, &key),
            "storage/slice/level/local/123/456/my-source/my-sink/2000-01-01T01:00:00.000Z/my-volume/2000-01-01T02:00:00.000Z"
        );
        assert!(slice_all(&key).starts_with(&slices_all_in_file(key.file_key())));
        assert!(slice_all(&key).starts_with(&slices_all_in_file_volume(&key.file_volume)));
    }

    #[test]
    fn test_stats_keys() {
        let key = slice_key();
        assert_eq!(
            stats_sum(Level::Staging, &key),
            "storage/stats/staging/123/456/my-source/my-sink/2000-01-01T01:00:00.000Z/my-volume/2000-01-01T02:00:00.000Z/_sum"
        );
        assert!(stats_node(Level::Local, &key, "node-1").starts_with(&stats_in_file(Level::Local, key.file_key())));
    }

    #[test]
    fn test_sink_prefix_is_closed() {
        let sink = SinkKey::new(1, 2, "source", "sink");
        let other = FileKey::new(
            SinkKey::new(1, 2, "source", "sink2"),
            UtcTime::parse("2000-01-01T00:00:00.000Z").unwrap(),
        );
        assert!(!file_all(&other).starts_with(&files_all_in_sink(&sink)));
    }
}
