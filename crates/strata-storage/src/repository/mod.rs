//! Entity repositories.
//!
//! All mutations are [atomic](crate::atomic) operations. Mutations of
//! files and slices accept the distributed lock held by the caller; the
//! write is rejected if the lock was lost in the meantime.

mod file;
mod job;
mod sink;
mod slice;
mod stats;
mod volume;

pub use file::FileRepository;
pub use job::JobRepository;
pub use sink::SinkRepository;
pub use slice::SliceRepository;
pub use stats::StatisticsRepository;
pub use volume::VolumeRepository;

use std::sync::Arc;
use strata_common::config::StorageConfig;
use strata_meta_store::SharedStore;

/// Access to all storage entities
pub struct Repository {
    store: SharedStore,
    file: FileRepository,
    slice: SliceRepository,
    volume: VolumeRepository,
    sink: SinkRepository,
    job: JobRepository,
    stats: StatisticsRepository,
}

impl Repository {
    /// Create a repository; `config` holds the defaults of new files and slices
    pub fn new(store: SharedStore, config: StorageConfig) -> Arc<Self> {
        Arc::new(Self {
            file: FileRepository::new(Arc::clone(&store), config.clone()),
            slice: SliceRepository::new(Arc::clone(&store), config),
            volume: VolumeRepository::new(Arc::clone(&store)),
            sink: SinkRepository::new(Arc::clone(&store)),
            job: JobRepository::new(Arc::clone(&store)),
            stats: StatisticsRepository::new(Arc::clone(&store)),
            store,
        })
    }

    #[must_use]
    pub const fn store(&self) -> &SharedStore {
        &self.store
    }

    #[must_use]
    pub const fn file(&self) -> &FileRepository {
        &self.file
    }

    #[must_use]
    pub const fn slice(&self) -> &SliceRepository {
        &self.slice
    }

    #[must_use]
    pub const fn volume(&self) -> &VolumeRepository {
        &self.volume
    }

    #[must_use]
    pub const fn sink(&self) -> &SinkRepository {
        &self.sink
    }

    #[must_use]
    pub const fn job(&self) -> &JobRepository {
        &self.job
    }

    #[must_use]
    pub const fn stats(&self) -> &StatisticsRepository {
        &self.stats
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::Repository;
    use crate::model::{Sink, Volume};
    use std::sync::Arc;
    use std::time::Duration;
    use strata_common::config::StorageConfig;
    use strata_common::{SinkKey, UtcTime, VolumeId};
    use strata_meta_store::KvStore;

    pub fn utc(value: &str) -> UtcTime {
        UtcTime::parse(value).unwrap()
    }

    pub fn sink_key() -> SinkKey {
        SinkKey::new(123, 456, "my-source", "my-sink")
    }

    /// Repository with one sink and the given writer volumes
    pub async fn repository(volumes: &[&str]) -> Arc<Repository> {
        repository_with(StorageConfig::default(), Sink::new(sink_key()), volumes).await
    }

    pub async fn repository_with(config: StorageConfig, sink: Sink, volumes: &[&str]) -> Arc<Repository> {
        let store = Arc::new(KvStore::new());
        let repo = Repository::new(store.clone(), config);
        repo.sink().put(&sink).await.unwrap();
        for id in volumes {
            let lease = store.grant_lease(Duration::from_secs(3600));
            let volume = Volume {
                volume_id: VolumeId::new(*id).unwrap(),
                node_id: "writer-node".to_string(),
                path: format!("/data/{id}"),
            };
            repo.volume().register_writer_volume(&volume, lease).await.unwrap();
        }
        repo
    }
}
