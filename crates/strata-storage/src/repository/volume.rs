use crate::atomic::{self, encode};
use crate::error::StorageResult;
use crate::model::Volume;
use crate::schema;
use strata_meta_store::{LeaseId, Op, SharedStore, Txn};

/// Writer volumes, used to assign new files
pub struct VolumeRepository {
    store: SharedStore,
}

impl VolumeRepository {
    pub(super) const fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Register the volume while the lease of the writer node is alive
    pub async fn register_writer_volume(&self, volume: &Volume, lease: LeaseId) -> StorageResult<()> {
        let key = schema::volume_writer(&volume.volume_id);
        self.store
            .txn(Txn::new().and_then(Op::put_with_lease(key, encode(volume)?, lease)))
            .await?;
        Ok(())
    }

    pub async fn list_writer_volumes(&self) -> StorageResult<Vec<Volume>> {
        atomic::list(&self.store, schema::VOLUME_WRITER_PREFIX).await
    }
}
