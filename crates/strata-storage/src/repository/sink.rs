use crate::atomic::{self, Reader, encode};
use crate::error::{StorageError, StorageResult};
use crate::model::Sink;
use crate::schema;
use strata_common::SinkKey;
use strata_meta_store::{Op, SharedStore, Txn};

fn not_found(key: &SinkKey) -> StorageError {
    StorageError::NotFound {
        kind: "sink",
        key: key.to_string(),
        parent: "source",
    }
}

pub(super) async fn read_sink(r: &Reader, key: &SinkKey) -> StorageResult<Sink> {
    r.get(&schema::sink(key)).await?.ok_or_else(|| not_found(key))
}

/// Sink definitions
pub struct SinkRepository {
    store: SharedStore,
}

impl SinkRepository {
    pub(super) const fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Create or replace the sink definition
    pub async fn put(&self, sink: &Sink) -> StorageResult<()> {
        sink.key.validate()?;
        self.store.put(&schema::sink(&sink.key), encode(sink)?).await?;
        Ok(())
    }

    pub async fn get(&self, key: &SinkKey) -> StorageResult<Sink> {
        atomic::get(&self.store, &schema::sink(key)).await?.ok_or_else(|| not_found(key))
    }

    pub async fn list(&self) -> StorageResult<Vec<Sink>> {
        atomic::list(&self.store, schema::SINK_PREFIX).await
    }

    pub async fn delete(&self, key: &SinkKey) -> StorageResult<()> {
        let txn = Txn::new().and_then(Op::delete(schema::sink(key)));
        if self.store.txn(txn).await?.deleted == 0 {
            return Err(not_found(key));
        }
        Ok(())
    }
}
