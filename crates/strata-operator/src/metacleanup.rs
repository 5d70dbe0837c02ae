//! Metadata cleanup.
//!
//! Periodically deletes metadata of expired files and import jobs. Files
//! are deleted with their slices and statistics. Age is measured from the
//! last state change:
//!
//! - an `Imported` file expires after `archived_file_expiration`, except the
//!   newest `archived_file_retention_per_sink` imported files of each sink
//! - any other file expires after `active_file_expiration`
//!
//! Only `Imported` files count toward the per-sink retention. A newer file
//! in any other state does not push an older imported file out of it.
//!
//! Sinks are sharded by project over the group members. A pass stops early
//! once the number of errors exceeds `error_tolerance`.

use crate::common::{Dependencies, unlock};
use crate::error::OperatorResult;
use crate::metrics;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use strata_common::UtcTime;
use strata_common::config::MetadataCleanupConfig;
use strata_placement::GroupNode;
use strata_storage::{File, FileState, Sink, StorageResult};
use tracing::{debug, error, info, warn};

pub const GROUP: &str = "storage.metadata.cleanup";

/// Outcome of one cleanup pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted_files: u64,
    pub retained_files: u64,
    pub deleted_jobs: u64,
    pub errors: usize,
}

#[derive(Default)]
struct Counters {
    deleted_files: AtomicU64,
    retained_files: AtomicU64,
    deleted_jobs: AtomicU64,
    errors: AtomicUsize,
}

impl Counters {
    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> CleanupReport {
        CleanupReport {
            deleted_files: self.deleted_files.load(Ordering::Relaxed),
            retained_files: self.retained_files.load(Ordering::Relaxed),
            deleted_jobs: self.deleted_jobs.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub struct MetadataCleanup {
    deps: Dependencies,
    config: MetadataCleanupConfig,
    group: Arc<GroupNode>,
}

impl MetadataCleanup {
    /// Join the group and, if enabled, start the periodic cleanup
    pub async fn start(deps: &Dependencies, config: MetadataCleanupConfig) -> OperatorResult<Arc<Self>> {
        let group = deps.distribution.group(GROUP).await?;
        let cleanup = Arc::new(Self {
            deps: deps.clone(),
            config,
            group,
        });

        if !config.enabled {
            info!("Metadata cleanup is disabled");
            return Ok(cleanup);
        }

        let node = Arc::clone(&cleanup);
        let stop = deps.stop.clone();
        deps.workers.spawn(async move {
            let mut ticker = tokio::time::interval(node.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        node.clean().await;
                    }
                }
            }
        });
        info!("Metadata cleanup started");
        Ok(cleanup)
    }

    #[must_use]
    pub fn group(&self) -> &GroupNode {
        &self.group
    }

    /// Run one cleanup pass over all enabled sinks
    pub async fn clean(&self) -> CleanupReport {
        info!("Deleting metadata of expired files");
        let counters = Counters::default();
        let sinks: Vec<Sink> = self.deps.sinks.values().into_iter().filter(|sink| sink.enabled).collect();

        futures::stream::iter(sinks)
            .for_each_concurrent(self.config.concurrency, |sink| {
                let counters = &counters;
                async move { self.clean_sink(&sink, counters).await }
            })
            .await;

        let report = counters.report();
        info!(
            "cleanup deleted {} files, retained {} files, {} errors",
            report.deleted_files, report.retained_files, report.errors
        );
        if report.deleted_jobs > 0 {
            info!("cleanup deleted {} jobs", report.deleted_jobs);
        }
        metrics::record_cleanup(report.deleted_files, report.errors as u64);
        report
    }

    fn tolerance_exceeded(&self, counters: &Counters) -> bool {
        counters.errors.load(Ordering::Relaxed) > self.config.error_tolerance
    }

    async fn clean_sink(&self, sink: &Sink, counters: &Counters) {
        if self.tolerance_exceeded(counters) {
            return;
        }

        match self.group.is_owner(&sink.key.project_id().to_string()) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("Cannot check if the node is owner of the sink \"{}\": {e}", sink.key);
                counters.error();
                return;
            }
        }

        if let Err(e) = self.clean_files(sink, counters).await {
            error!("Cannot list files of the sink \"{}\": {e}", sink.key);
            counters.error();
        }
        if let Err(e) = self.clean_jobs(sink, counters).await {
            error!("Cannot list jobs of the sink \"{}\": {e}", sink.key);
            counters.error();
        }
    }

    async fn clean_files(&self, sink: &Sink, counters: &Counters) -> StorageResult<()> {
        let mut files = self.deps.repository.file().list_in(&sink.key).await?;
        files.sort_by(|a, b| b.key.opened_at.cmp(&a.key.opened_at));

        let now = self.deps.clock.now();
        let mut imported_index = 0;
        for file in files {
            if self.tolerance_exceeded(counters) {
                break;
            }

            let newer_imported = imported_index;
            if file.state == FileState::Imported {
                imported_index += 1;
            }
            if !self.is_expired(&file, now, newer_imported) {
                counters.retained_files.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if self.delete_file(&file).await {
                counters.deleted_files.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.retained_files.fetch_add(1, Ordering::Relaxed);
                counters.error();
            }
        }
        Ok(())
    }

    /// `newer_imported` is the number of newer imported files in the sink,
    /// newer files in other states are not counted
    fn is_expired(&self, file: &File, now: UtcTime, newer_imported: usize) -> bool {
        let age = now.duration_since(file.last_state_change);
        if file.state == FileState::Imported {
            return age >= self.config.archived_file_expiration()
                && newer_imported >= self.config.archived_file_retention_per_sink;
        }
        age >= self.config.active_file_expiration()
    }

    async fn delete_file(&self, file: &File) -> bool {
        // Skip the file if someone else works with it
        let mutex = self.deps.locks.new_mutex(file.key.to_string());
        if let Err(e) = mutex.try_lock().await {
            error!("Cannot lock expired file \"{}\": {e}", file.key);
            return false;
        }

        let result = self.deps.repository.file().delete(&file.key, Some(&mutex)).await;
        unlock(&mutex).await;
        match result {
            Ok(()) => {
                info!("Deleted expired file \"{}\"", file.key);
                true
            }
            Err(e) => {
                error!("Cannot delete expired file \"{}\": {e}", file.key);
                false
            }
        }
    }

    async fn clean_jobs(&self, sink: &Sink, counters: &Counters) -> StorageResult<()> {
        let now = self.deps.clock.now();
        for job in self.deps.repository.job().list_in(&sink.key).await? {
            if now.duration_since(job.created_at) < self.config.job_expiration() {
                continue;
            }
            match self.deps.repository.job().delete(&job.key).await {
                Ok(()) => {
                    debug!("Deleted expired job \"{}\"", job.key);
                    counters.deleted_jobs.fetch_add(1, Ordering::Relaxed);
                }
                // Deleted concurrently
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!("Cannot delete expired job \"{}\": {e}", job.key);
                    counters.error();
                }
            }
        }
        Ok(())
    }
}
