//! Aggregated statistics read from a local mirror of `storage/stats/`.

use crate::error::StorageResult;
use crate::mirror::Mirror;
use crate::model::{AggregatedStatistics, Level, Statistics};
use crate::schema;
use std::sync::Arc;
use strata_common::{FileKey, SinkKey, SliceKey};
use strata_meta_store::{Revision, SharedStore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Cache of all statistics records, keyed by the store key
pub struct StatisticsCache {
    mirror: Arc<Mirror<Statistics, Statistics>>,
}

impl StatisticsCache {
    /// Create the cache and wait for the initial sync
    pub async fn start(store: SharedStore, cancel: CancellationToken, tracker: &TaskTracker) -> StorageResult<Self> {
        let mirror = Arc::new(Mirror::new(
            "statistics",
            store,
            schema::STATS_PREFIX,
            |kv, _: &Statistics| kv.key.clone(),
            |_, stats, _| stats,
        ));
        mirror.start_mirroring(cancel, tracker).await?;
        Ok(Self { mirror })
    }

    pub fn slice_stats(&self, slice: &SliceKey) -> AggregatedStatistics {
        self.aggregate(|level| schema::stats_in_slice(level, slice))
    }

    pub fn file_stats(&self, file: &FileKey) -> AggregatedStatistics {
        self.aggregate(|level| schema::stats_in_file(level, file))
    }

    pub fn sink_stats(&self, sink: &SinkKey) -> AggregatedStatistics {
        self.aggregate(|level| schema::stats_in_sink(level, sink))
    }

    pub fn revision(&self) -> Revision {
        self.mirror.revision()
    }

    /// Wait until the cache reflects at least the revision
    pub async fn wait_for_revision(&self, revision: Revision) -> StorageResult<()> {
        self.mirror.wait_for_revision(revision).await
    }

    fn aggregate(&self, prefix: impl Fn(Level) -> String) -> AggregatedStatistics {
        let mut result = AggregatedStatistics::default();
        for level in Level::ALL {
            // Records are sorted, records of one slice are adjacent
            let mut last_slice: Option<String> = None;
            for (key, mut stats) in self.mirror.values_with_prefix(&prefix(level)) {
                let slice = key.rsplit_once('/').map_or(key.as_str(), |(slice, _)| slice);
                stats.slices_count = 0;
                if last_slice.as_deref() != Some(slice) {
                    stats.slices_count = 1;
                    last_slice = Some(slice.to_string());
                }
                result.add(level, stats);
            }
        }
        result
    }
}
