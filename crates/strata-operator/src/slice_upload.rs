//! Slice upload operator.
//!
//! Uploads `Uploading` slices from the local to the staging storage and
//! switches them to `Uploaded`. Empty slices are only switched.

use crate::common::{Dependencies, lock, owned_mirror, restart_on_distribution_change, spawn_ticker, unlock};
use crate::error::{OperatorError, OperatorResult};
use crate::metrics;
use crate::tracked::Tracked;
use std::sync::Arc;
use std::time::Instant;
use strata_common::config::SliceUploadConfig;
use strata_meta_store::DistMutex;
use strata_placement::GroupNode;
use strata_storage::{Level, Mirror, Slice, SliceState, schema};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

pub const GROUP: &str = "operator.slice.upload";

pub struct SliceUpload {
    deps: Dependencies,
    config: SliceUploadConfig,
    group: Arc<GroupNode>,
    slices: Arc<Mirror<Slice, Tracked<Slice>>>,
    semaphore: Arc<Semaphore>,
}

impl SliceUpload {
    pub async fn start(
        deps: &Dependencies,
        config: SliceUploadConfig,
        max_concurrency: usize,
    ) -> OperatorResult<Arc<Self>> {
        let group = deps.distribution.group(GROUP).await?;
        let slices = owned_mirror(
            "slice.upload",
            deps,
            schema::slice_level_prefix(Level::Local),
            &group,
            |slice: &Slice| slice.key.sink_key().source.to_string(),
        )
        .await?;
        restart_on_distribution_change(deps, &group, Arc::clone(&slices));

        let operator = Arc::new(Self {
            deps: deps.clone(),
            config,
            group,
            slices,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
        });

        let ticker = Arc::clone(&operator);
        spawn_ticker(deps, GROUP, config.check_interval(), move || {
            let operator = Arc::clone(&ticker);
            async move { operator.check_all().await }
        });
        info!("Slice upload operator started");
        Ok(operator)
    }

    #[must_use]
    pub fn group(&self) -> &GroupNode {
        &self.group
    }

    pub async fn sync(&self) -> OperatorResult<()> {
        let revision = self.deps.store.revision().await?;
        self.slices.wait_for_revision(revision).await?;
        Ok(())
    }

    /// Upload all owned `Uploading` slices, returns when all uploads are done
    pub async fn check_all(self: Arc<Self>) {
        let mut checks = JoinSet::new();
        for slice in self.slices.values() {
            if slice.entity.state != SliceState::Uploading {
                continue;
            }
            let operator = Arc::clone(&self);
            checks.spawn(async move { operator.check_slice(slice).await });
        }
        while checks.join_next().await.is_some() {}
    }

    async fn check_slice(&self, slice: Tracked<Slice>) {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return;
        };
        let Some(_guard) = slice.try_begin() else {
            return;
        };
        if !slice.entity.retry.allowed(self.deps.clock.now()) {
            return;
        }
        if !self.deps.sink_enabled(slice.entity.key.sink_key()) {
            debug!("Skipping upload of slice \"{}\", the sink is disabled", slice.entity.key);
            return;
        }

        let Some(mutex) = lock(&self.deps.locks, format!("operator.slice.upload.{}", slice.entity.key)).await else {
            return;
        };
        self.upload_slice(&slice, &mutex).await;
        unlock(&mutex).await;
    }

    async fn upload_slice(&self, slice: &Tracked<Slice>, mutex: &DistMutex) {
        let key = &slice.entity.key;
        let started = Instant::now();
        let result = match self.do_upload(&slice.entity, mutex).await {
            Err(e) if e.is_shutdown() => {
                info!("Upload of slice \"{key}\" stopped: {e}");
                return;
            }
            result => result,
        };
        metrics::record_operation("slice_upload", started.elapsed(), result.is_ok());

        match result {
            Ok(()) => info!("Uploaded slice \"{key}\""),
            Err(e) => {
                error!("Cannot upload slice \"{key}\": {e}");
                let now = self.deps.clock.now();
                if let Err(e) = self
                    .deps
                    .repository
                    .slice()
                    .increment_retry(key, now, &e.to_string(), Some(mutex))
                    .await
                {
                    error!("Cannot increment slice upload retry: {e}");
                    return;
                }
            }
        }
        slice.mark_processed();
    }

    async fn do_upload(&self, slice: &Slice, mutex: &DistMutex) -> OperatorResult<()> {
        if !slice.is_empty {
            let stats = self.deps.statistics.slice_stats(&slice.key).local;
            let timeout = self.config.upload_timeout();
            let upload = async {
                self.deps
                    .uploader
                    .upload_slice(slice, &stats)
                    .await
                    .map_err(OperatorError::Upload)
            };
            self.deps.bounded_wait("slice upload", timeout, upload).await?;
            metrics::record_upload(stats.compressed_size, stats.uncompressed_size);
        }

        self.deps
            .repository
            .slice()
            .switch_to_uploaded(&slice.key, self.deps.clock.now(), Some(mutex))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestEnv, timeout};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn config() -> SliceUploadConfig {
        SliceUploadConfig {
            check_interval_ms: 3_600_000,
            ..SliceUploadConfig::default()
        }
    }

    /// Env with one slice in the uploading state
    async fn uploading_env() -> (TestEnv, Slice) {
        let env = TestEnv::new(&["vol-1"]).await;
        let file = env.rotate_file().await;
        env.repository.file().close_all_in(&file.key.sink, env.now(), None).await.unwrap();
        let slice = env.slices(&file.key).await.remove(0);
        let slice = env
            .repository
            .slice()
            .switch_to_uploading(&slice.key, env.now(), false, None)
            .await
            .unwrap();
        (env, slice)
    }

    #[tokio::test]
    async fn test_upload_retry() {
        let (env, slice) = uploading_env().await;
        env.provider.fail.store(true, Ordering::SeqCst);

        let operator = SliceUpload::start(&env.deps, config(), 10).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        timeout(Arc::clone(&operator).check_all()).await;

        let failed = env.repository.slice().get(&slice.key).await.unwrap();
        assert_eq!(failed.state, SliceState::Uploading);
        assert_eq!(failed.retry.retry_attempt, 1);
        assert_eq!(failed.retry.retry_reason, "slice upload failed: connection refused");
        assert_eq!(*env.provider.attempts.lock(), 1);

        // No attempt before the backoff passes
        env.provider.fail.store(false, Ordering::SeqCst);
        operator.sync().await.unwrap();
        timeout(Arc::clone(&operator).check_all()).await;
        assert_eq!(*env.provider.attempts.lock(), 1);

        env.clock.advance(Duration::from_secs(120));
        timeout(Arc::clone(&operator).check_all()).await;
        assert_eq!(*env.provider.attempts.lock(), 2);
        assert_eq!(*env.provider.uploaded.lock(), vec![slice.key.clone()]);
        let uploaded = env.repository.slice().get(&slice.key).await.unwrap();
        assert_eq!(uploaded.state, SliceState::Uploaded);
        assert_eq!(uploaded.retry.retry_attempt, 0);

        env.shutdown().await;
    }

    #[tokio::test]
    async fn test_processed_version_is_skipped() {
        let (env, slice) = uploading_env().await;
        env.provider.fail.store(true, Ordering::SeqCst);

        let operator = SliceUpload::start(&env.deps, config(), 10).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        let old = operator.slices.get(&schema::slice_level(Level::Local, &slice.key)).unwrap();
        assert!(old.entity.retry.retry_after.is_none());

        operator.check_slice(old.clone()).await;
        assert!(old.is_processed());
        assert_eq!(*env.provider.attempts.lock(), 1);

        // The stale version would be allowed by its own retry record
        env.clock.advance(Duration::from_secs(120));
        operator.check_slice(old.clone()).await;
        assert_eq!(*env.provider.attempts.lock(), 1);

        // The version written by the failure is checked
        operator.sync().await.unwrap();
        let current = operator.slices.get(&schema::slice_level(Level::Local, &slice.key)).unwrap();
        assert!(current.mod_revision > old.mod_revision);
        assert!(!current.is_processed());
        timeout(Arc::clone(&operator).check_all()).await;
        assert_eq!(*env.provider.attempts.lock(), 2);
        let failed = env.repository.slice().get(&slice.key).await.unwrap();
        assert_eq!(failed.retry.retry_attempt, 2);

        env.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_slice_is_not_uploaded() {
        let env = TestEnv::new(&["vol-1"]).await;
        let file = env.rotate_file().await;
        env.repository.file().close_all_in(&file.key.sink, env.now(), None).await.unwrap();
        let slice = env.slices(&file.key).await.remove(0);
        env.repository
            .slice()
            .switch_to_uploading(&slice.key, env.now(), true, None)
            .await
            .unwrap();

        let operator = SliceUpload::start(&env.deps, config(), 10).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        timeout(Arc::clone(&operator).check_all()).await;

        assert_eq!(*env.provider.attempts.lock(), 0);
        let slice = env.repository.slice().get(&slice.key).await.unwrap();
        assert_eq!(slice.state, SliceState::Uploaded);

        env.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_sink_is_skipped() {
        let (env, slice) = uploading_env().await;
        let mut sink = env.repository.sink().get(slice.key.sink_key()).await.unwrap();
        sink.enabled = false;
        env.repository.sink().put(&sink).await.unwrap();

        let operator = SliceUpload::start(&env.deps, config(), 10).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        timeout(Arc::clone(&operator).check_all()).await;

        assert_eq!(*env.provider.attempts.lock(), 0);
        let slice = env.repository.slice().get(&slice.key).await.unwrap();
        assert_eq!(slice.state, SliceState::Uploading);

        env.shutdown().await;
    }
}
