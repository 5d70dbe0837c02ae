//! Building blocks shared by the operators.
//!
//! Tasks of a node are split in two layers. Mirrors, distribution groups
//! and locks are the infrastructure, they run on `cancel` and `tracker`.
//! Tickers and entity checks are workers, they run on `stop` and `workers`
//! and are drained first, while the infrastructure they wait on still runs.

use crate::error::{OperatorError, OperatorResult};
use crate::provider::{FileImporter, SliceUploader};
use crate::tracked::Tracked;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use strata_common::{SharedClock, SinkKey};
use strata_meta_store::{DistMutex, LockProvider, SharedStore};
use strata_placement::{DistributionNode, GroupNode};
use strata_storage::{CloseSyncCoordinator, Mirror, Repository, Sink, StatisticsCache, StorageResult, schema};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Everything the operators need, shared by all of them
#[derive(Clone)]
pub struct Dependencies {
    pub clock: SharedClock,
    pub store: SharedStore,
    pub repository: Arc<Repository>,
    pub statistics: Arc<StatisticsCache>,
    pub sinks: Arc<Mirror<Sink, Sink>>,
    pub close_sync: Arc<CloseSyncCoordinator>,
    pub locks: Arc<LockProvider>,
    pub distribution: Arc<DistributionNode>,
    pub uploader: Arc<dyn SliceUploader>,
    pub importer: Arc<dyn FileImporter>,
    /// Stops mirrors and other infrastructure tasks
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    /// Stops tickers and interrupts running checks
    pub stop: CancellationToken,
    pub workers: TaskTracker,
}

impl Dependencies {
    /// Start the mirror of sink definitions, used to skip disabled sinks
    pub async fn sinks_mirror(
        store: &SharedStore,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> StorageResult<Arc<Mirror<Sink, Sink>>> {
        let sinks = Arc::new(Mirror::new(
            "sinks",
            Arc::clone(store),
            schema::SINK_PREFIX,
            |_, sink: &Sink| sink.key.to_string(),
            |_, sink, _| sink,
        ));
        sinks.start_mirroring(cancel, tracker).await?;
        Ok(sinks)
    }

    /// False if the sink was deleted or disabled
    pub fn sink_enabled(&self, key: &SinkKey) -> bool {
        self.sinks.get(&key.to_string()).is_some_and(|sink| sink.enabled)
    }

    /// Acquire the lock serializing file and slice rotations of the sink
    pub async fn lock_sink_files(&self, sink: &SinkKey) -> Option<DistMutex> {
        lock(&self.locks, format!("operator.sink.file.{sink}")).await
    }

    /// Stop the tickers and interrupt running checks, returns when all of them finished
    pub async fn stop_workers(&self) {
        self.stop.cancel();
        self.workers.close();
        self.workers.wait().await;
    }

    /// Run a wait step bounded by the timeout; it ends early when the operators stop
    pub async fn bounded_wait<T>(
        &self,
        operation: &'static str,
        timeout: Duration,
        wait: impl Future<Output = OperatorResult<T>>,
    ) -> OperatorResult<T> {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(OperatorError::Shutdown { operation }),
            result = tokio::time::timeout(timeout, wait) => {
                result.unwrap_or(Err(OperatorError::Timeout { operation, timeout }))
            }
        }
    }
}

/// Acquire the named lock, errors are logged
pub async fn lock(locks: &Arc<LockProvider>, name: String) -> Option<DistMutex> {
    let mutex = locks.new_mutex(name);
    match mutex.lock().await {
        Ok(()) => Some(mutex),
        Err(e) => {
            error!("Cannot lock \"{}\": {e}", mutex.key());
            None
        }
    }
}

/// Release the lock, errors are logged
pub async fn unlock(mutex: &DistMutex) {
    if let Err(e) = mutex.unlock().await {
        warn!("Cannot unlock lock \"{}\": {e}", mutex.key());
    }
}

/// Mirror of the entities under the prefix owned by this node
pub async fn owned_mirror<T>(
    name: &str,
    deps: &Dependencies,
    prefix: String,
    group: &Arc<GroupNode>,
    owner_key: fn(&T) -> String,
) -> OperatorResult<Arc<Mirror<T, Tracked<T>>>>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let group = Arc::clone(group);
    let mirror = Arc::new(
        Mirror::new(
            name,
            Arc::clone(&deps.store),
            prefix,
            |kv, _: &T| kv.key.clone(),
            |kv, entity, old: Option<&Tracked<T>>| Tracked::new(entity, kv.mod_revision, old),
        )
        .with_filter(move |entity| group.must_check_is_owner(&owner_key(entity))),
    );
    mirror.start_mirroring(deps.cancel.clone(), &deps.tracker).await?;
    Ok(mirror)
}

/// Rebuild the mirror whenever the members of the group change
pub fn restart_on_distribution_change<T, V>(deps: &Dependencies, group: &GroupNode, mirror: Arc<Mirror<T, V>>)
where
    T: DeserializeOwned + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut changes = group.on_change_listener();
    let cancel = deps.cancel.clone();
    deps.tracker.spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = changes.recv() => match event {
                    Ok(event) => mirror.restart(&format!("distribution changed: {:?}", event.nodes)),
                    Err(RecvError::Lagged(_)) => mirror.restart("distribution changed"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Run `check` every period until the operators stop; each check runs as its own task
pub fn spawn_ticker<F, Fut>(deps: &Dependencies, name: &'static str, period: Duration, check: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let stop = deps.stop.clone();
    let workers = deps.workers.clone();
    deps.workers.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("Operator \"{name}\" tick");
                    workers.spawn(check());
                }
            }
        }
    });
}
