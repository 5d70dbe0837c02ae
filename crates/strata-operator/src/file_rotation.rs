//! File rotation operator.
//!
//! A `Writing` file is rotated once an import condition is met: the file
//! moves to `Closing` and a new `Writing` file replaces it. A `Closing` file
//! is switched to `Importing` after all its slices left the local level.

use crate::common::{Dependencies, owned_mirror, restart_on_distribution_change, spawn_ticker, unlock};
use crate::condition::{DecisionKind, should_import};
use crate::error::{OperatorError, OperatorResult};
use crate::metrics;
use crate::tracked::Tracked;
use std::sync::Arc;
use std::time::Instant;
use strata_common::FileKey;
use strata_common::config::FileRotationConfig;
use strata_common::format::format_duration;
use strata_meta_store::DistMutex;
use strata_placement::GroupNode;
use strata_storage::{File, FileState, Level, Mirror, Slice, schema};
use tokio::sync::Semaphore;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

pub const GROUP: &str = "operator.file.rotation";

pub struct FileRotation {
    deps: Dependencies,
    config: FileRotationConfig,
    group: Arc<GroupNode>,
    files: Arc<Mirror<File, Tracked<File>>>,
    /// All local slices, used to detect that slices of a closing file were uploaded
    local_slices: Arc<Mirror<Slice, ()>>,
    semaphore: Arc<Semaphore>,
}

impl FileRotation {
    pub async fn start(
        deps: &Dependencies,
        config: FileRotationConfig,
        max_concurrency: usize,
    ) -> OperatorResult<Arc<Self>> {
        let group = deps.distribution.group(GROUP).await?;
        let files = owned_mirror(
            "file.rotation",
            deps,
            schema::file_level_prefix(Level::Local),
            &group,
            |file: &File| file.key.sink.source.to_string(),
        )
        .await?;
        restart_on_distribution_change(deps, &group, Arc::clone(&files));

        let local_slices = Arc::new(Mirror::new(
            "file.rotation.slices",
            Arc::clone(&deps.store),
            schema::slice_level_prefix(Level::Local),
            |kv, _: &Slice| kv.key.clone(),
            |_, _, _| (),
        ));
        local_slices.start_mirroring(deps.cancel.clone(), &deps.tracker).await?;

        let operator = Arc::new(Self {
            deps: deps.clone(),
            config,
            group,
            files,
            local_slices,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
        });

        let ticker = Arc::clone(&operator);
        spawn_ticker(deps, GROUP, config.check_interval(), move || {
            let operator = Arc::clone(&ticker);
            async move { operator.check_all().await }
        });
        info!("File rotation operator started");
        Ok(operator)
    }

    #[must_use]
    pub fn group(&self) -> &GroupNode {
        &self.group
    }

    pub async fn sync(&self) -> OperatorResult<()> {
        let revision = self.deps.store.revision().await?;
        self.files.wait_for_revision(revision).await?;
        self.local_slices.wait_for_revision(revision).await?;
        Ok(())
    }

    /// Check all owned files, returns when all checks are done
    pub async fn check_all(self: Arc<Self>) {
        debug!("Checking files import conditions");
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

        match file.entity.state {
            FileState::Writing => {
                if !self.deps.sink_enabled(&file.entity.key.sink) {
                    return;
                }
                let timeout = self.config.rotation_timeout();
                if tokio::time::timeout(timeout, self.rotate_file(&file)).await.is_err() {
                    error!(
                        "File \"{}\" rotation timed out after {}",
                        file.entity.key,
                        format_duration(timeout)
                    );
                }
            }
            FileState::Closing => self.close_file(&file).await,
            _ => {}
        }
    }

    async fn rotate_file(&self, file: &Tracked<File>) {
        let key = &file.entity.key;
        let now = self.deps.clock.now();
        let stats = self.deps.statistics.file_stats(key);
        let throttled = !self.deps.importer.can_accept_new_file(&key.sink);
        let decision = should_import(
            &file.entity.target_storage.import,
            now,
            key.opened_at,
            file.entity.staging_storage.expiration,
            &stats.local,
            throttled,
        );
        match decision.kind {
            DecisionKind::Met => info!("rotating file for import: {decision}"),
            DecisionKind::Throttled => {
                info!("skipping file import: {decision}");
                return;
            }
            _ => {
                debug!("skipping file rotation: {decision}");
                return;
            }
        }

        let Some(lock) = self.deps.lock_sink_files(&key.sink).await else {
            return;
        };

        let started = Instant::now();
        let now = self.deps.clock.now();
        let result = self.deps.repository.file().rotate(&key.sink, now, Some(&lock)).await;
        metrics::record_operation("file_rotation", started.elapsed(), result.is_ok());
        match result {
            Ok(new) => info!("Rotated file \"{key}\", opened file \"{}\"", new.key),
            Err(e) => {
                error!("Cannot rotate file \"{key}\": {e}");
                if let Err(e) = self
                    .deps
                    .repository
                    .file()
                    .increment_retry(key, now, &e.to_string(), Some(&lock))
                    .await
                {
                    error!("Cannot increment file rotation retry: {e}");
                    unlock(&lock).await;
                    return;
                }
            }
        }

        file.mark_processed();
        unlock(&lock).await;
    }

    async fn close_file(&self, file: &Tracked<File>) {
        let key = &file.entity.key;
        info!("Closing file \"{key}\"");
        let started = Instant::now();

        let timeout = self.config.close_timeout();
        let waited = self
            .deps
            .bounded_wait("waiting for file slices upload", timeout, self.wait_for_slices_upload(file))
            .await;
        if let Err(e) = &waited
            && e.is_shutdown()
        {
            info!("Closing of file \"{key}\" stopped: {e}");
            return;
        }

        let Some(lock) = self.deps.lock_sink_files(&key.sink).await else {
            return;
        };

        let result = match waited {
            Ok(()) => self.switch_to_importing(key, &lock).await,
            Err(e) => Err(e),
        };
        metrics::record_operation("file_close", started.elapsed(), result.is_ok());

        match result {
            Ok(()) => info!("Closed file \"{key}\""),
            Err(e) => {
                error!("Cannot close file \"{key}\": {e}");
                let now = self.deps.clock.now();
                if let Err(e) = self
                    .deps
                    .repository
                    .file()
                    .increment_retry(key, now, &e.to_string(), Some(&lock))
                    .await
                {
                    error!("Cannot increment file close retry: {e}");
                    unlock(&lock).await;
                    return;
                }
            }
        }

        file.mark_processed();
        unlock(&lock).await;
    }

    async fn switch_to_importing(&self, key: &FileKey, lock: &DistMutex) -> OperatorResult<()> {
        let slices = self.deps.repository.slice().list_in_file(key).await?;
        let is_empty = slices.iter().all(|slice| slice.is_empty);
        self.deps
            .repository
            .file()
            .switch_to_importing(key, self.deps.clock.now(), is_empty, Some(lock))
            .await?;
        Ok(())
    }

    /// Wait until no slice of the file remains in the local level
    async fn wait_for_slices_upload(&self, file: &Tracked<File>) -> OperatorResult<()> {
        let prefix = schema::slices_level_in_file(Level::Local, &file.entity.key);
        let mut changes = self.local_slices.on_changes();

        // Slices closed together with the file must be visible
        self.local_slices.wait_for_revision(file.mod_revision).await?;

        loop {
            let opened = self.local_slices.values_with_prefix(&prefix).len();
            if opened == 0 {
                return Ok(());
            }
            debug!("File \"{}\" waits for {opened} slices upload", file.entity.key);
            match changes.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    return Err(OperatorError::MirrorClosed {
                        operation: "waiting for file slices upload",
                    });
                }
            }
        }
    }
}
