use crate::atomic::{Reader, encode};
use crate::error::StorageResult;
use crate::model::{Level, Statistics};
use crate::schema;
use strata_common::SliceKey;
use strata_meta_store::{Op, SharedStore, Txn};

/// Raw statistics written by writer nodes
pub struct StatisticsRepository {
    store: SharedStore,
}

impl StatisticsRepository {
    pub(super) const fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Store statistics of the slice collected by the node
    pub async fn put(&self, slice: &SliceKey, node_id: &str, stats: &Statistics) -> StorageResult<()> {
        self.store
            .put(&schema::stats_node(Level::Local, slice, node_id), encode(stats)?)
            .await?;
        Ok(())
    }
}

/// Fold statistics of the slice into one record in the next level
pub(super) async fn move_slice_stats(
    r: &Reader,
    txn: &mut Txn,
    slice: &SliceKey,
    from: Level,
    to: Level,
) -> StorageResult<()> {
    let prefix = schema::stats_in_slice(from, slice);
    let entries: Vec<(String, Statistics)> = r.list_kv(&prefix).await?;
    if entries.is_empty() {
        return Ok(());
    }

    let mut sum = entries
        .into_iter()
        .fold(Statistics::default(), |acc, (_, stats)| acc + stats);
    if to == Level::Staging {
        sum.staging_size = sum.compressed_size;
    }

    txn.push(Op::delete_prefix(prefix));
    txn.push(Op::put(schema::stats_sum(to, slice), encode(&sum)?));
    Ok(())
}

/// Delete statistics of the slice in all levels
pub(super) fn delete_slice_stats(txn: &mut Txn, slice: &SliceKey) {
    for level in Level::ALL {
        txn.push(Op::delete_prefix(schema::stats_in_slice(level, slice)));
    }
}
