//! Slice rotation operator.
//!
//! Watches slices in the local level owned by this node. A `Writing` slice
//! is rotated once an upload condition is met. A `Closing` slice is switched
//! to `Uploading` when no writer uses it anymore and its statistics are
//! complete.

use crate::common::{Dependencies, owned_mirror, restart_on_distribution_change, spawn_ticker, unlock};
use crate::condition::should_upload;
use crate::error::{OperatorError, OperatorResult};
use crate::metrics;
use crate::tracked::Tracked;
use std::sync::Arc;
use std::time::Instant;
use strata_common::config::SliceRotationConfig;
use strata_common::format::format_duration;
use strata_placement::GroupNode;
use strata_storage::{Level, Mirror, Slice, SliceState, StorageError, schema};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

pub const GROUP: &str = "operator.slice.rotation";

pub struct SliceRotation {
    deps: Dependencies,
    config: SliceRotationConfig,
    group: Arc<GroupNode>,
    slices: Arc<Mirror<Slice, Tracked<Slice>>>,
    semaphore: Arc<Semaphore>,
}

impl SliceRotation {
    pub async fn start(
        deps: &Dependencies,
        config: SliceRotationConfig,
        max_concurrency: usize,
    ) -> OperatorResult<Arc<Self>> {
        let group = deps.distribution.group(GROUP).await?;
        let slices = owned_mirror(
            "slice.rotation",
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
        info!("Slice rotation operator started");
        Ok(operator)
    }

    #[must_use]
    pub fn group(&self) -> &GroupNode {
        &self.group
    }

    /// Wait until the mirror reflects the current store revision
    pub async fn sync(&self) -> OperatorResult<()> {
        let revision = self.deps.store.revision().await?;
        self.slices.wait_for_revision(revision).await?;
        Ok(())
    }

    /// Check all owned slices, returns when all checks are done
    pub async fn check_all(self: Arc<Self>) {
        debug!("Checking slices upload conditions");
        let mut checks = JoinSet::new();
        for slice in self.slices.values() {
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

        // Closing continues also for disabled sinks, the sink deactivation closes the slice
        match slice.entity.state {
            SliceState::Writing => {
                let timeout = self.config.rotation_timeout();
                if tokio::time::timeout(timeout, self.rotate_slice(&slice)).await.is_err() {
                    error!(
                        "Slice \"{}\" rotation timed out after {}",
                        slice.entity.key,
                        format_duration(timeout)
                    );
                }
            }
            SliceState::Closing => self.close_slice(&slice).await,
            _ => {}
        }
    }

    async fn rotate_slice(&self, slice: &Tracked<Slice>) {
        let key = &slice.entity.key;
        let stats = self.deps.statistics.slice_stats(key);
        let decision = should_upload(
            &slice.entity.staging_storage.upload,
            self.deps.clock.now(),
            key.opened_at,
            &stats.local,
        );
        if !decision.is_met() {
            debug!("skipping slice rotation: {decision}");
            return;
        }
        info!("rotating slice for upload: {decision}");

        let Some(lock) = self.deps.lock_sink_files(key.sink_key()).await else {
            return;
        };

        let started = Instant::now();
        let now = self.deps.clock.now();
        let result = self.deps.repository.slice().rotate(&key.file_volume, now, Some(&lock)).await;
        metrics::record_operation("slice_rotation", started.elapsed(), result.is_ok());
        match result {
            Ok(new) => info!("Rotated slice \"{key}\", opened slice \"{}\"", new.key),
            Err(StorageError::FileNotWriting { .. }) => {
                info!("skipped slice rotation, file is already closed");
            }
            Err(e) => {
                error!("Cannot rotate slice \"{key}\": {e}");
                if let Err(e) = self
                    .deps
                    .repository
                    .slice()
                    .increment_retry(key, now, &e.to_string(), Some(&lock))
                    .await
                {
                    error!("Cannot increment slice rotation retry: {e}");
                    unlock(&lock).await;
                    return;
                }
            }
        }

        slice.mark_processed();
        unlock(&lock).await;
    }

    async fn close_slice(&self, slice: &Tracked<Slice>) {
        let key = &slice.entity.key;
        info!("Closing slice \"{key}\"");
        let started = Instant::now();

        let result = match self.do_close_slice(slice).await {
            Err(e) if e.is_shutdown() => {
                // Checked again after the restart
                info!("Closing of slice \"{key}\" stopped: {e}");
                return;
            }
            result => result,
        };
        metrics::record_operation("slice_close", started.elapsed(), result.is_ok());
        match result {
            Ok(()) => info!("Closed slice \"{key}\""),
            Err(e) => {
                error!("Cannot close slice \"{key}\": {e}");
                let now = self.deps.clock.now();
                let msg = e.to_string();
                let retry = self.deps.repository.slice().increment_retry(key, now, &msg, None);
                if let Err(e) = retry.await {
                    error!("Cannot increment slice close retry: {e}");
                    return;
                }
            }
        }
        slice.mark_processed();
    }

    async fn do_close_slice(&self, slice: &Tracked<Slice>) -> OperatorResult<()> {
        let timeout = self.config.close_timeout();
        let revision = slice.mod_revision;

        // Wait until no writer uses the slice; on failure continue, the wait was long enough
        let close_sync = async {
            self.deps
                .close_sync
                .wait_for_revision(revision)
                .await
                .map_err(OperatorError::from)
        };
        match self.deps.bounded_wait("waiting for slice closing", timeout, close_sync).await {
            Ok(()) => {}
            Err(e) if e.is_shutdown() => return Err(e),
            Err(e) => error!("Error when waiting for slice closing: {e}"),
        }

        // The statistics must include all records written to the slice
        let statistics = async {
            self.deps
                .statistics
                .wait_for_revision(revision)
                .await
                .map_err(OperatorError::from)
        };
        self.deps
            .bounded_wait("waiting for statistics cache revision", timeout, statistics)
            .await?;

        let stats = self.deps.statistics.slice_stats(&slice.entity.key);
        let is_empty = stats.total.records_count == 0;
        self.deps
            .repository
            .slice()
            .switch_to_uploading(&slice.entity.key, self.deps.clock.now(), is_empty, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{HOUR, TestEnv, timeout};
    use std::time::Duration;
    use strata_storage::Statistics;

    fn config() -> SliceRotationConfig {
        SliceRotationConfig {
            check_interval_ms: 3_600_000,
            ..SliceRotationConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rotate_and_close_slice() {
        let env = TestEnv::new(&["vol-1"]).await;
        let file = env.rotate_file().await;
        let slice = env.slices(&file.key).await.remove(0);
        let stats = Statistics {
            records_count: 50_002,
            compressed_size: 1024,
            uncompressed_size: 4096,
            ..Statistics::default()
        };
        env.repository.stats().put(&slice.key, "writer-node", &stats).await.unwrap();

        // Too early, the minimal interval is not met
        let operator = SliceRotation::start(&env.deps, config(), 10).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        timeout(Arc::clone(&operator).check_all()).await;
        assert_eq!(env.slices(&file.key).await.len(), 1);

        // Count threshold met
        env.clock.advance(Duration::from_secs(10));
        timeout(Arc::clone(&operator).check_all()).await;
        let slices = env.slices(&file.key).await;
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].key, slice.key);
        assert_eq!(slices[0].state, SliceState::Closing);
        assert_eq!(slices[1].state, SliceState::Writing);
        assert_eq!(slices[1].key.opened_at, env.now());

        // The closed slice is switched to uploading
        operator.sync().await.unwrap();
        timeout(Arc::clone(&operator).check_all()).await;
        let closed = env.repository.slice().get(&slice.key).await.unwrap();
        assert_eq!(closed.state, SliceState::Uploading);
        assert!(!closed.is_empty);

        env.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_file_is_not_retried() {
        let env = TestEnv::new(&["vol-1"]).await;
        let file = env.rotate_file().await;
        let slice = env.slices(&file.key).await.remove(0);
        env.clock.advance(HOUR);

        // The time threshold is met, but the file was closed in the meantime
        let operator = SliceRotation::start(&env.deps, config(), 10).await.unwrap();
        let stats = Statistics {
            records_count: 1,
            ..Statistics::default()
        };
        env.repository.stats().put(&slice.key, "writer-node", &stats).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        let tracked = operator.slices.values().remove(0);
        env.repository.file().close_all_in(&file.key.sink, env.now(), None).await.unwrap();

        operator.rotate_slice(&tracked).await;
        assert!(tracked.is_processed());
        let slice = env.repository.slice().get(&slice.key).await.unwrap();
        assert_eq!(slice.state, SliceState::Closing);
        assert_eq!(slice.retry.retry_attempt, 0);

        env.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_slice_is_closed_as_empty() {
        let env = TestEnv::new(&["vol-1"]).await;
        let file = env.rotate_file().await;
        env.repository.file().close_all_in(&file.key.sink, env.now(), None).await.unwrap();

        let operator = SliceRotation::start(&env.deps, config(), 10).await.unwrap();
        env.sync().await;
        operator.sync().await.unwrap();
        timeout(Arc::clone(&operator).check_all()).await;

        let slice = env.slices(&file.key).await.remove(0);
        assert_eq!(slice.state, SliceState::Uploading);
        assert!(slice.is_empty);

        env.shutdown().await;
    }
}
