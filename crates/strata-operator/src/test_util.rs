use crate::common::Dependencies;
use crate::provider::{FileImporter, ProviderError, SliceUploader};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use strata_common::config::{DistributionConfig, LockConfig, StorageConfig};
use strata_common::{Clock, FileKey, MockClock, SinkKey, SliceKey, UtcTime, VolumeId};
use strata_meta_store::{KvStore, LockProvider, SharedStore};
use strata_placement::DistributionNode;
use strata_storage::{
    CloseSyncCoordinator, File, FileState, Repository, Sink, Slice, SliceState, StatisticsCache, Statistics,
    Volume,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const HOUR: Duration = Duration::from_secs(3600);

pub fn utc(value: &str) -> UtcTime {
    UtcTime::parse(value).unwrap()
}

pub fn sink_key() -> SinkKey {
    SinkKey::new(123, 456, "my-source", "my-sink")
}

type ImportHook = Box<dyn Fn(File) -> BoxFuture<'static, ()> + Send + Sync>;

/// Provider recording the calls, it can be switched to fail
#[derive(Default)]
pub struct TestProvider {
    pub fail: AtomicBool,
    pub throttled: AtomicBool,
    pub uploaded: Mutex<Vec<SliceKey>>,
    pub imported: Mutex<Vec<FileKey>>,
    pub attempts: Mutex<usize>,
    pub job_id: Mutex<Option<String>>,
    pub on_import: Mutex<Option<ImportHook>>,
}

#[async_trait]
impl SliceUploader for TestProvider {
    async fn upload_slice(&self, slice: &Slice, _stats: &Statistics) -> Result<(), ProviderError> {
        *self.attempts.lock() += 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::new("connection refused"));
        }
        self.uploaded.lock().push(slice.key.clone());
        Ok(())
    }
}

#[async_trait]
impl FileImporter for TestProvider {
    fn can_accept_new_file(&self, _sink: &SinkKey) -> bool {
        !self.throttled.load(Ordering::SeqCst)
    }

    async fn import_file(&self, file: &File, _stats: &Statistics) -> Result<Option<String>, ProviderError> {
        *self.attempts.lock() += 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::new("destination unavailable"));
        }
        let hook = self.on_import.lock().as_ref().map(|hook| hook(file.clone()));
        if let Some(hook) = hook {
            hook.await;
        }
        self.imported.lock().push(file.key.clone());
        Ok(self.job_id.lock().clone())
    }
}

/// One node with an in-memory store, one enabled sink and writer volumes
pub struct TestEnv {
    pub clock: Arc<MockClock>,
    pub store: Arc<KvStore>,
    pub repository: Arc<Repository>,
    pub provider: Arc<TestProvider>,
    pub deps: Dependencies,
}

impl TestEnv {
    pub async fn new(volumes: &[&str]) -> Self {
        Self::with_sink(Sink::new(sink_key()), volumes).await
    }

    pub async fn with_sink(sink: Sink, volumes: &[&str]) -> Self {
        let clock = Arc::new(MockClock::new(utc("2000-01-01T00:00:00.000Z")));
        let store = Arc::new(KvStore::new());
        let shared: SharedStore = store.clone();
        let repository = Repository::new(Arc::clone(&shared), StorageConfig::default());
        repository.sink().put(&sink).await.unwrap();
        for id in volumes {
            let lease = store.grant_lease(HOUR);
            let volume = Volume {
                volume_id: VolumeId::new(*id).unwrap(),
                node_id: "writer-node".to_string(),
                path: format!("/data/{id}"),
            };
            repository.volume().register_writer_volume(&volume, lease).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let statistics = StatisticsCache::start(Arc::clone(&shared), cancel.clone(), &tracker)
            .await
            .unwrap();
        let sinks = Dependencies::sinks_mirror(&shared, cancel.clone(), &tracker).await.unwrap();
        let provider = Arc::new(TestProvider::default());
        let deps = Dependencies {
            clock: Arc::clone(&clock) as _,
            store: Arc::clone(&shared),
            repository: Arc::clone(&repository),
            statistics: Arc::new(statistics),
            sinks,
            close_sync: Arc::new(CloseSyncCoordinator::new(Arc::clone(&shared))),
            locks: LockProvider::new(Arc::clone(&shared), "test-node", LockConfig::default()),
            distribution: DistributionNode::new(
                Arc::clone(&shared),
                "test-node",
                &DistributionConfig::default(),
                cancel.clone(),
            ),
            uploader: Arc::clone(&provider) as _,
            importer: Arc::clone(&provider) as _,
            cancel,
            tracker,
            stop: CancellationToken::new(),
            workers: TaskTracker::new(),
        };

        Self {
            clock,
            store,
            repository,
            provider,
            deps,
        }
    }

    pub fn now(&self) -> UtcTime {
        self.clock.now()
    }

    /// Wait until the shared caches reflect all writes
    pub async fn sync(&self) {
        let revision = self.store.revision();
        self.deps.statistics.wait_for_revision(revision).await.unwrap();
        self.deps.sinks.wait_for_revision(revision).await.unwrap();
    }

    /// Open a file in the sink at the current time
    pub async fn rotate_file(&self) -> File {
        self.repository.file().rotate(&sink_key(), self.now(), None).await.unwrap()
    }

    pub async fn file(&self, key: &FileKey) -> File {
        self.repository.file().get(key).await.unwrap()
    }

    pub async fn slices(&self, file: &FileKey) -> Vec<Slice> {
        self.repository.slice().list_in_file(file).await.unwrap()
    }

    /// Move all closing slices of the file to the uploaded state
    pub async fn upload_slices(&self, file: &FileKey) {
        for slice in self.slices(file).await {
            if slice.state == SliceState::Closing {
                self.repository
                    .slice()
                    .switch_to_uploading(&slice.key, self.now(), false, None)
                    .await
                    .unwrap();
            }
            if matches!(slice.state, SliceState::Closing | SliceState::Uploading) {
                self.repository
                    .slice()
                    .switch_to_uploaded(&slice.key, self.now(), None)
                    .await
                    .unwrap();
            }
        }
    }

    /// Close the only opened file of the sink and bring it to the importing state
    pub async fn importing_file(&self) -> File {
        let file = self.rotate_file().await;
        self.repository
            .file()
            .close_all_in(&sink_key(), self.now(), None)
            .await
            .unwrap();
        self.upload_slices(&file.key).await;
        let file = self
            .repository
            .file()
            .switch_to_importing(&file.key, self.now(), false, None)
            .await
            .unwrap();
        assert_eq!(file.state, FileState::Importing);
        file
    }

    /// Stop the workers first, then the mirrors and groups they use
    pub async fn shutdown(self) {
        self.deps.stop_workers().await;
        self.deps.cancel.cancel();
        self.deps.tracker.close();
        self.deps.tracker.wait().await;
        self.deps.locks.close().await;
    }
}

/// Bound a wait in tests
pub async fn timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future).await.unwrap()
}
