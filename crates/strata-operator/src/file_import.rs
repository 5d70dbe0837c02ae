//! File import operator.
//!
//! Imports `Importing` files from the staging to the target storage and
//! switches them to `Imported`. An asynchronous import is recorded as a
//! [`Job`].

use crate::common::{Dependencies, owned_mirror, restart_on_distribution_change, spawn_ticker, unlock};
use crate::error::{OperatorError, OperatorResult};
use crate::metrics;
use crate::tracked::Tracked;
use std::sync::Arc;
use std::time::Instant;
use strata_common::config::FileImportConfig;
use strata_meta_store::DistMutex;
use strata_placement::GroupNode;
use strata_storage::{File, FileState, Job, JobKey, Level, Mirror, schema};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const GROUP: &str = "operator.file.import";

pub struct FileImport {
    deps: Dependencies,
    config: FileImportConfig,
    group: Arc<GroupNode>,
    files: Arc<Mirror<File, Tracked<File>>>,
    semaphore: Arc<Semaphore>,
}

impl FileImport {
    pub async fn start(
        deps: &Dependencies,
        config: FileImportConfig,
        max_concurrency: usize,
    ) -> OperatorResult<Arc<Self>> {
        let group = deps.distribution.group(GROUP).await?;
        let files = owned_mirror(
            "file.import",
            deps,
            schema::file_level_prefix(Level::Staging),
            &group,
            |file: &File| file.key.sink.source.to_string(),
        )
        .await?;
        restart_on_distribution_change(deps, &group, Arc::clone(&files));

        let operator = Arc::new(Self {
            deps: deps.clone(),
            config,
            group,
            files,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
        });

        let ticker = Arc::clone(&operator);
        spawn_ticker(deps, GROUP, config.check_interval(), move || {
            let operator = Arc::clone(&ticker);
            async move { operator.check_all().await }
        });
        info!("File import operator started");
        Ok(operator)
    }

    #[must_use]
    pub fn group(&self) -> &GroupNode {
        &self.group
    }

    pub async fn sync(&self) -> OperatorResult<()> {
        let revision = self.deps.store.revision().await?;
        self.files.wait_for_revision(revision).await?;
        Ok(())
    }

    /// Import all owned `Importing` files, returns when all imports are done
    pub async fn check_all(self: Arc<Self>) {
        debug!("Checking files in the importing state");
        let mut checks = JoinSet::new();
        for file in self.files.values() {
            let operator = Arc::clone(&self);
            checks.spawn(async move { operator.check_file(file).await });
        }
        while checks.join_next().await.is_some() {}
    }

    async fn check_file(&self, file: Tracked<File>) {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return;
        };
        let Some(_guard) = file.try_begin() else {
            return;
        };
        if !file.entity.retry.allowed(self.deps.clock.now()) {
            return;
        }
        if file.entity.state == FileState::Importing {
            self.import_file(&file).await;
        }
    }

    async fn import_file(&self, file: &Tracked<File>) {
        let key = &file.entity.key;
        info!("Importing file \"{key}\"");

        let Some(lock) = self.deps.lock_sink_files(&key.sink).await else {
            return;
        };

        let started = Instant::now();
        let result = match self.do_import(&file.entity, &lock).await {
            Err(e) if e.is_shutdown() => {
                info!("Import of file \"{key}\" stopped: {e}");
                unlock(&lock).await;
                return;
            }
            result => result,
        };
        metrics::record_operation("file_import", started.elapsed(), result.is_ok());

        match result {
            Ok(()) => info!("Imported file \"{key}\""),
            Err(e) if e.is_invalid_transition() => {
                // The file was already switched, the mirror was probably rebuilt from scratch
                warn!("Skipped import of file \"{key}\": {e}");
            }
            Err(e) => {
                error!("Cannot import file \"{key}\": {e}");
                let now = self.deps.clock.now();
                if let Err(e) = self
                    .deps
                    .repository
                    .file()
                    .increment_retry(key, now, &e.to_string(), Some(&lock))
                    .await
                {
                    error!("Cannot increment file import retry: {e}");
                    unlock(&lock).await;
                    return;
                }
            }
        }

        file.mark_processed();
        unlock(&lock).await;
    }

    async fn do_import(&self, file: &File, lock: &DistMutex) -> OperatorResult<()> {
        if !file.is_empty {
            let stats = self.deps.statistics.file_stats(&file.key).staging;
            let timeout = self.config.import_timeout();
            let import = async {
                self.deps
                    .importer
                    .import_file(file, &stats)
                    .await
                    .map_err(OperatorError::Import)
            };
            let job_id = self.deps.bounded_wait("file import", timeout, import).await?;

            if let Some(job_id) = job_id {
                let job = Job::new(
                    JobKey::new(file.key.sink.clone(), job_id)?,
                    &file.key,
                    self.deps.clock.now(),
                );
                self.deps.repository.job().create(&job).await?;
                debug!("Created import job \"{}\"", job.key);
            }
        }

        self.deps
            .repository
            .file()
            .switch_to_imported(&file.key, self.deps.clock.now(), Some(lock))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestEnv, sink_key, timeout};
    use std::sync::atomic::Ordering;
    use strata_storage::SliceState;

    fn config() -> FileImportConfig {
        FileImportConfig {
            check_interval_ms: 3_600_000,
            ..FileImportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_import_creates_job() {
        let env = TestEnv::new(&["vol-1", "vol-2"]).await;
        let file = env.importing_file().await;
        *env.provider.job_id.lock() = Some("job-1".to_string());

        let operator = FileImport::start(&env.deps, config(), 10).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        timeout(Arc::clone(&operator).check_all()).await;

        assert_eq!(*env.provider.imported.lock(), vec![file.key.clone()]);
        assert_eq!(env.file(&file.key).await.state, FileState::Imported);
        assert!(env.slices(&file.key).await.iter().all(|s| s.state == SliceState::Imported));

        let jobs = env.repository.job().list_in(&sink_key()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key.job_id, "job-1");
        assert_eq!(jobs[0].file_opened_at, file.key.opened_at);

        env.shutdown().await;
    }

    #[tokio::test]
    async fn test_import_failure_increments_retry() {
        let env = TestEnv::new(&["vol-1"]).await;
        let file = env.importing_file().await;
        env.provider.fail.store(true, Ordering::SeqCst);

        let operator = FileImport::start(&env.deps, config(), 10).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        timeout(Arc::clone(&operator).check_all()).await;

        let file = env.file(&file.key).await;
        assert_eq!(file.state, FileState::Importing);
        assert_eq!(file.retry.retry_attempt, 1);
        assert_eq!(file.retry.retry_reason, "file import failed: destination unavailable");
        assert!(!file.retry.allowed(env.now()));

        env.shutdown().await;
    }

    #[tokio::test]
    async fn test_already_imported_file_is_not_retried() {
        let env = TestEnv::new(&["vol-1"]).await;
        let file = env.importing_file().await;

        // Another node switched the file while the import was running
        let repository = Arc::clone(&env.repository);
        let now = env.now();
        *env.provider.on_import.lock() = Some(Box::new(move |file: File| {
            let repository = Arc::clone(&repository);
            Box::pin(async move {
                repository.file().switch_to_imported(&file.key, now, None).await.unwrap();
            })
        }));

        let operator = FileImport::start(&env.deps, config(), 10).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        let tracked = operator.files.values().remove(0);
        operator.import_file(&tracked).await;

        assert!(tracked.is_processed());
        let file = env.file(&file.key).await;
        assert_eq!(file.state, FileState::Imported);
        assert_eq!(file.retry.retry_attempt, 0);

        env.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_file_is_not_imported() {
        let env = TestEnv::new(&["vol-1"]).await;
        let file = env.rotate_file().await;
        env.repository.file().close_all_in(&sink_key(), env.now(), None).await.unwrap();
        env.upload_slices(&file.key).await;
        env.repository
            .file()
            .switch_to_importing(&file.key, env.now(), true, None)
            .await
            .unwrap();

        let operator = FileImport::start(&env.deps, config(), 10).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        timeout(Arc::clone(&operator).check_all()).await;

        assert_eq!(*env.provider.attempts.lock(), 0);
        assert_eq!(env.file(&file.key).await.state, FileState::Imported);

        env.shutdown().await;
    }
}
