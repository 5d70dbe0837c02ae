//! Watch-driven local copies of store prefixes.
//!
//! A [`Mirror`] loads a prefix, keeps it in a sorted in-memory map and then
//! applies the watch stream. Each stored entity is decoded, filtered and
//! mapped to the cached value `V`. The value mapper receives the previously
//! cached value, so per-entity state (locks, flags) survives updates.
//!
//! On a lagging watch or an explicit [`Mirror::restart`] the map is rebuilt
//! from a fresh snapshot. A restart is also the way to re-evaluate a filter
//! which depends on outside state, for example key ownership.
//!
//! When the mirror stops, pending [`Mirror::wait_for_revision`] calls fail
//! with [`StorageError::MirrorStopped`] and change subscriptions are closed.

use crate::atomic::decode;
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strata_meta_store::{EventKind, KeyValue, Revision, SharedStore, WatchResponse, Watcher};
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const CHANGES_BUFFER: usize = 64;
const RESYNC_BACKOFF: Duration = Duration::from_secs(1);

type KeyFn<T> = Box<dyn Fn(&KeyValue, &T) -> String + Send + Sync>;
type ValueFn<T, V> = Box<dyn Fn(&KeyValue, T, Option<&V>) -> V + Send + Sync>;
type FilterFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Notification about applied changes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MirrorChanges {
    pub revision: Revision,
    /// The whole map was rebuilt
    pub reset: bool,
}

/// In-memory copy of entities `T` under a prefix, cached as `V`
pub struct Mirror<T, V> {
    name: String,
    store: SharedStore,
    prefix: String,
    key_fn: KeyFn<T>,
    value_fn: ValueFn<T, V>,
    filter: Option<FilterFn<T>>,
    state: RwLock<BTreeMap<String, V>>,
    revision: watch::Sender<Revision>,
    restart: Notify,
    changes: Mutex<Option<broadcast::Sender<MirrorChanges>>>,
    stopped: CancellationToken,
}

impl<T, V> Mirror<T, V>
where
    T: DeserializeOwned + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        store: SharedStore,
        prefix: impl Into<String>,
        key_fn: impl Fn(&KeyValue, &T) -> String + Send + Sync + 'static,
        value_fn: impl Fn(&KeyValue, T, Option<&V>) -> V + Send + Sync + 'static,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        let (changes, _) = broadcast::channel(CHANGES_BUFFER);
        Self {
            name: name.into(),
            store,
            prefix: prefix.into(),
            key_fn: Box::new(key_fn),
            value_fn: Box::new(value_fn),
            filter: None,
            state: RwLock::new(BTreeMap::new()),
            revision,
            restart: Notify::new(),
            changes: Mutex::new(Some(changes)),
            stopped: CancellationToken::new(),
        }
    }

    /// Keep only entities matching the filter
    #[must_use]
    pub fn with_filter(mut self, filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Load the initial snapshot and keep the mirror updated in background.
    ///
    /// Returns when the initial synchronization is done.
    pub async fn start_mirroring(
        self: &Arc<Self>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> StorageResult<()> {
        let watcher = self.sync().await?;
        info!(
            "Mirror \"{}\" synced {} entries at revision {}",
            self.name,
            self.len(),
            self.revision()
        );
        tracker.spawn(Arc::clone(self).run(watcher, cancel));
        Ok(())
    }

    /// Rebuild the map from a fresh snapshot
    pub fn restart(&self, reason: &str) {
        info!("Restarting mirror \"{}\": {reason}", self.name);
        self.restart.notify_one();
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.state.read().get(key).cloned()
    }

    /// Call `f` for each entry of a snapshot, the map is not locked meanwhile
    pub fn for_each(&self, mut f: impl FnMut(&str, &V)) {
        let snapshot: Vec<(String, V)> = self
            .state
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &snapshot {
            f(key, value);
        }
    }

    pub fn values(&self) -> Vec<V> {
        self.state.read().values().cloned().collect()
    }

    /// Values of entries whose key starts with the prefix
    pub fn values_with_prefix(&self, prefix: &str) -> Vec<(String, V)> {
        self.state
            .read()
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Store revision the mirror reflects
    pub fn revision(&self) -> Revision {
        *self.revision.borrow()
    }

    /// Wait until the mirror reflects at least the revision, or until it stops
    pub async fn wait_for_revision(&self, revision: Revision) -> StorageResult<()> {
        let mut rx = self.revision.subscribe();
        tokio::select! {
            biased;
            // The sender lives as long as the mirror
            _ = rx.wait_for(|r| *r >= revision) => Ok(()),
            () = self.stopped.cancelled() => Err(StorageError::MirrorStopped {
                name: self.name.clone(),
            }),
        }
    }

    /// Subscribe to applied changes; the subscription is closed when the mirror stops
    pub fn on_changes(&self) -> broadcast::Receiver<MirrorChanges> {
        if let Some(changes) = self.changes.lock().as_ref() {
            return changes.subscribe();
        }
        let (closed, rx) = broadcast::channel(1);
        drop(closed);
        rx
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    fn notify(&self, changes: MirrorChanges) {
        if let Some(tx) = self.changes.lock().as_ref() {
            // No subscribers is fine
            let _ = tx.send(changes);
        }
    }

    fn accept(&self, entity: &T) -> bool {
        self.filter.as_ref().is_none_or(|f| f(entity))
    }

    fn decode(&self, kv: &KeyValue) -> Option<T> {
        match decode(&kv.value) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!("Mirror \"{}\" cannot decode \"{}\": {e}", self.name, kv.key);
                None
            }
        }
    }

    async fn sync(&self) -> StorageResult<Watcher> {
        let (kvs, revision, watcher) = self.store.get_all_and_watch(&self.prefix).await?;
        {
            let mut state = self.state.write();
            let mut fresh = BTreeMap::new();
            for kv in &kvs {
                let Some(entity) = self.decode(kv) else { continue };
                if !self.accept(&entity) {
                    continue;
                }
                let key = (self.key_fn)(kv, &entity);
                let value = (self.value_fn)(kv, entity, state.get(&key));
                fresh.insert(key, value);
            }
            *state = fresh;
        }
        self.revision.send_replace(revision);
        self.notify(MirrorChanges { revision, reset: true });
        Ok(watcher)
    }

    /// Sync again until it succeeds, `None` if cancelled meanwhile
    async fn resync(&self, cancel: &CancellationToken) -> Option<Watcher> {
        loop {
            match self.sync().await {
                Ok(watcher) => return Some(watcher),
                Err(e) => error!("Mirror \"{}\" cannot resync: {e}", self.name),
            }
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(RESYNC_BACKOFF) => {}
            }
        }
    }

    async fn run(self: Arc<Self>, mut watcher: Watcher, cancel: CancellationToken) {
        loop {
            let resync = tokio::select! {
                () = cancel.cancelled() => break,
                () = self.restart.notified() => true,
                resp = watcher.next() => match resp {
                    Ok(resp) => {
                        self.apply(resp);
                        false
                    }
                    Err(e) => {
                        warn!("Mirror \"{}\" watch failed, resyncing: {e}", self.name);
                        true
                    }
                },
            };
            if resync {
                match self.resync(&cancel).await {
                    Some(fresh) => watcher = fresh,
                    None => break,
                }
            }
        }
        self.changes.lock().take();
        self.stopped.cancel();
        debug!("Mirror \"{}\" stopped", self.name);
    }

    fn apply(&self, resp: WatchResponse) {
        if !resp.is_progress_notify() {
            let mut state = self.state.write();
            for event in resp.events {
                match event.kind {
                    EventKind::Create | EventKind::Update => {
                        let Some(entity) = self.decode(&event.kv) else { continue };
                        let key = (self.key_fn)(&event.kv, &entity);
                        if self.accept(&entity) {
                            let value = (self.value_fn)(&event.kv, entity, state.get(&key));
                            state.insert(key, value);
                        } else {
                            state.remove(&key);
                        }
                    }
                    EventKind::Delete => {
                        let Some(prev) = event.prev_kv else { continue };
                        let Some(entity) = self.decode(&prev) else { continue };
                        state.remove(&(self.key_fn)(&prev, &entity));
                    }
                }
            }
            drop(state);
            self.notify(MirrorChanges {
                revision: resp.revision,
                reset: false,
            });
        }
        self.revision.send_replace(resp.revision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::encode;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering};
    use strata_meta_store::KvStore;

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Item {
        id: String,
        owner: String,
    }

    fn put(store: &KvStore, id: &str, owner: &str) -> Revision {
        let item = Item {
            id: id.to_string(),
            owner: owner.to_string(),
        };
        store.put(format!("item/{id}"), encode(&item).unwrap()).unwrap()
    }

    fn item_mirror(store: &Arc<KvStore>) -> Mirror<Item, Item> {
        Mirror::new(
            "items",
            store.clone(),
            "item/",
            |_, item: &Item| item.id.clone(),
            |_, item, _| item,
        )
    }

    async fn wait(mirror: &Mirror<Item, Item>, revision: Revision) {
        tokio::time::timeout(Duration::from_secs(1), mirror.wait_for_revision(revision))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_initial_sync_and_updates() {
        let store = Arc::new(KvStore::new());
        put(&store, "a", "node-1");
        put(&store, "b", "node-1");
        store.put("other/x", "not an item").unwrap();

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mirror = Arc::new(item_mirror(&store));
        mirror.start_mirroring(cancel.clone(), &tracker).await.unwrap();
        assert_eq!(mirror.len(), 2);
        assert_eq!(mirror.revision(), store.revision());

        put(&store, "c", "node-2");
        let rev = put(&store, "a", "node-2");
        wait(&mirror, rev).await;
        assert_eq!(mirror.len(), 3);
        assert_eq!(mirror.get("a").unwrap().owner, "node-2");

        store.delete("item/b").unwrap();
        wait(&mirror, store.revision()).await;
        assert!(mirror.get("b").is_none());

        let mut keys = Vec::new();
        mirror.for_each(|k, _| keys.push(k.to_string()));
        assert_eq!(keys, vec!["a", "c"]);

        // Unrelated writes still advance the revision
        let rev = store.put("other/y", "value").unwrap();
        wait(&mirror, rev).await;

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_value_fn_keeps_previous_state() {
        let store = Arc::new(KvStore::new());
        put(&store, "a", "node-1");
        let mirror = Arc::new(Mirror::new(
            "items",
            store.clone(),
            "item/",
            |_, item: &Item| item.id.clone(),
            |_, _, old: Option<&(u32,)>| (old.map_or(0, |o| o.0 + 1),),
        ));
        let cancel = CancellationToken::new();
        mirror.start_mirroring(cancel.clone(), &TaskTracker::new()).await.unwrap();
        assert_eq!(mirror.get("a"), Some((0,)));

        let rev = put(&store, "a", "node-2");
        tokio::time::timeout(Duration::from_secs(1), mirror.wait_for_revision(rev))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mirror.get("a"), Some((1,)));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_filter_and_restart() {
        let store = Arc::new(KvStore::new());
        put(&store, "a", "node-1");
        put(&store, "b", "node-2");

        let only_node1 = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&only_node1);
        let mirror = Arc::new(
            item_mirror(&store).with_filter(move |item| !flag.load(Ordering::SeqCst) || item.owner == "node-1"),
        );
        let cancel = CancellationToken::new();
        let mut changes = mirror.on_changes();
        mirror.start_mirroring(cancel.clone(), &TaskTracker::new()).await.unwrap();
        assert!(changes.recv().await.unwrap().reset);
        assert_eq!(mirror.values().len(), 1);

        // The entity no longer matches the filter
        let rev = put(&store, "a", "node-2");
        wait(&mirror, rev).await;
        assert!(mirror.is_empty());

        only_node1.store(false, Ordering::SeqCst);
        mirror.restart("filter changed");
        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = changes.recv().await.unwrap();
                if event.reset {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.revision, rev);
        assert_eq!(mirror.len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stopped_mirror_ends_waits_and_subscriptions() {
        let store = Arc::new(KvStore::new());
        put(&store, "a", "node-1");
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mirror = Arc::new(item_mirror(&store));
        mirror.start_mirroring(cancel.clone(), &tracker).await.unwrap();
        let mut changes = mirror.on_changes();

        let waiter = {
            let mirror = Arc::clone(&mirror);
            tokio::spawn(async move { mirror.wait_for_revision(1000).await })
        };
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(mirror.is_stopped());

        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.to_string(), "mirror \"items\" stopped");
        assert!(matches!(
            changes.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(mirror.on_changes().recv().await.is_err());

        // A reached revision is still reported
        mirror.wait_for_revision(1).await.unwrap();
    }
}
