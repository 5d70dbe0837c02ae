//! Embedded transactional key-value store.
//!
//! Keys live in an ordered map behind a single mutex. Every mutating
//! transaction bumps the store revision exactly once, and the changes are
//! broadcast to watchers as one [`WatchResponse`]. With a persistence
//! backend the changes are written through before they become visible; if
//! the write fails the transaction is rolled back and fails too. Leases bind keys to a
//! TTL: when a lease expires or is revoked its keys are deleted, and the
//! deletions are published like any other write.
//!
//! Expired leases are collected lazily on every access and periodically by
//! the reaper task, see [`KvStore::spawn_lease_reaper`].

use crate::persist::{KvPersistence, PersistError, Persistence};
use crate::store::MetaStore;
use crate::txn::{Compare, Op, Txn, TxnResponse};
use crate::watch::{Event, EventKind, WatchResponse, Watcher};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Store revision, incremented by each mutating transaction
pub type Revision = i64;

/// Lease identifier
pub type LeaseId = i64;

const WATCH_BUFFER: usize = 8192;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
    #[error("watch stream lagged behind by {0} responses")]
    WatchLagged(u64),
    #[error("watch stream closed")]
    WatchClosed,
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistError),
    #[error("remote store error: {0}")]
    Remote(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// A stored key with its revisions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub version: i64,
    pub lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    data: BTreeMap<String, KeyValue>,
    revision: Revision,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

impl State {
    fn scan<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a KeyValue> + 'a {
        self.data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v)
    }

    fn evaluate(&self, compare: &Compare) -> bool {
        match compare {
            Compare::ModRevision { key, revision } => {
                self.data.get(key).map_or(0, |kv| kv.mod_revision) == *revision
            }
            Compare::Exists(key) => self.data.contains_key(key),
            Compare::Missing(key) => !self.data.contains_key(key),
            Compare::Value { key, value } => self.data.get(key).is_some_and(|kv| &kv.value == value),
            Compare::Lease { key, lease } => {
                self.leases.contains_key(lease) && self.data.get(key).is_some_and(|kv| kv.lease == Some(*lease))
            }
            Compare::PrefixUnchanged { prefix, revision, keys } => {
                let mut found = 0;
                for kv in self.scan(prefix) {
                    if kv.mod_revision > *revision || keys.binary_search(&kv.key).is_err() {
                        return false;
                    }
                    found += 1;
                }
                found == keys.len()
            }
        }
    }

    fn put(&mut self, key: String, value: Vec<u8>, lease: Option<LeaseId>, revision: Revision) -> Event {
        let prev = self.data.get(&key).cloned();

        // Move the key between leases, if needed
        if let Some(prev_lease) = prev.as_ref().and_then(|kv| kv.lease) {
            if Some(prev_lease) != lease {
                if let Some(l) = self.leases.get_mut(&prev_lease) {
                    l.keys.remove(&key);
                }
            }
        }
        if let Some(lease) = lease {
            if let Some(l) = self.leases.get_mut(&lease) {
                l.keys.insert(key.clone());
            }
        }

        let kv = KeyValue {
            key: key.clone(),
            value,
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            lease,
        };
        self.data.insert(key, kv.clone());

        Event {
            kind: if prev.is_some() {
                EventKind::Update
            } else {
                EventKind::Create
            },
            kv,
            prev_kv: prev,
        }
    }

    fn delete(&mut self, key: &str, revision: Revision) -> Option<Event> {
        let prev = self.data.remove(key)?;
        if let Some(lease) = prev.lease {
            if let Some(l) = self.leases.get_mut(&lease) {
                l.keys.remove(key);
            }
        }
        Some(Event {
            kind: EventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Vec::new(),
                create_revision: 0,
                mod_revision: revision,
                version: 0,
                lease: None,
            },
            prev_kv: Some(prev),
        })
    }

    /// Revert applied events, newest first
    fn undo(&mut self, events: Vec<Event>) {
        for event in events.into_iter().rev() {
            let key = event.kv.key;
            if let Some(lease) = event.kv.lease {
                if let Some(l) = self.leases.get_mut(&lease) {
                    l.keys.remove(&key);
                }
            }
            match event.prev_kv {
                Some(prev) => {
                    if let Some(lease) = prev.lease {
                        if let Some(l) = self.leases.get_mut(&lease) {
                            l.keys.insert(key.clone());
                        }
                    }
                    self.data.insert(key, prev);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
    }
}

/// Transactional, watchable key-value store with leases
pub struct KvStore {
    state: Mutex<State>,
    events: broadcast::Sender<Arc<WatchResponse>>,
    revision: watch::Sender<Revision>,
    persistence: Option<Box<dyn Persistence>>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    /// Create an in-memory store
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(State::default(), None)
    }

    /// Open a store persisted in the redb database at the given path
    pub fn open(path: impl AsRef<Path>) -> KvResult<Self> {
        Self::with_persistence(Box::new(KvPersistence::open(path)?))
    }

    /// Create a store on top of the persistence backend, loading its content
    pub fn with_persistence(persistence: Box<dyn Persistence>) -> KvResult<Self> {
        let (entries, revision) = persistence.load()?;

        let mut state = State {
            revision,
            ..State::default()
        };
        for kv in entries {
            state.data.insert(kv.key.clone(), kv);
        }
        info!("Loaded {} keys at revision {}", state.data.len(), revision);

        Ok(Self::from_parts(state, Some(persistence)))
    }

    fn from_parts(state: State, persistence: Option<Box<dyn Persistence>>) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        let (revision, _) = watch::channel(state.revision);
        Self {
            state: Mutex::new(state),
            events,
            revision,
            persistence,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock();
        self.expire_locked(&mut state);
        state
    }

    fn expire_locked(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            debug!("Lease {lease} expired");
            self.revoke_locked(state, lease);
        }
    }

    fn revoke_locked(&self, state: &mut State, lease: LeaseId) -> bool {
        let Some(removed) = state.leases.remove(&lease) else {
            return false;
        };
        let revision = state.revision + 1;
        let events: Vec<Event> = removed
            .keys
            .iter()
            .filter_map(|key| state.delete(key, revision))
            .collect();
        // The lease is gone, its keys cannot be restored
        if let Err(e) = self.persist(&events, revision) {
            error!("Failed to persist revocation of lease {lease} at revision {revision}: {e}");
        }
        self.publish(state, revision, events);
        true
    }

    fn persist(&self, events: &[Event], revision: Revision) -> Result<(), PersistError> {
        match &self.persistence {
            Some(persistence) if !events.is_empty() => persistence.apply(events, revision),
            _ => Ok(()),
        }
    }

    fn publish(&self, state: &mut State, revision: Revision, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        state.revision = revision;
        // No receivers is not an error
        let _ = self.events.send(Arc::new(WatchResponse { revision, events }));
        self.revision.send_replace(revision);
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    /// Get one key
    pub fn get(&self, key: &str) -> Option<KeyValue> {
        self.lock().data.get(key).cloned()
    }

    /// Get all keys under the prefix, sorted, with the revision of the read
    pub fn range(&self, prefix: &str) -> (Vec<KeyValue>, Revision) {
        let state = self.lock();
        (state.scan(prefix).cloned().collect(), state.revision)
    }

    /// Number of keys under the prefix
    pub fn count(&self, prefix: &str) -> usize {
        self.lock().scan(prefix).count()
    }

    /// Unconditional put
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> KvResult<Revision> {
        self.txn(Txn::new().and_then(Op::put(key, value)))
            .map(|resp| resp.revision)
    }

    /// Unconditional delete, returns false if the key did not exist
    pub fn delete(&self, key: impl Into<String>) -> KvResult<bool> {
        self.txn(Txn::new().and_then(Op::delete(key)))
            .map(|resp| resp.deleted > 0)
    }

    /// Evaluate compares and apply the matching branch atomically
    pub fn txn(&self, txn: Txn) -> KvResult<TxnResponse> {
        let mut state = self.lock();

        let succeeded = txn.compares.iter().all(|c| state.evaluate(c));
        let ops = if succeeded { txn.then } else { txn.otherwise };

        for op in &ops {
            if let Op::Put {
                lease: Some(lease), ..
            } = op
            {
                if !state.leases.contains_key(lease) {
                    return Err(KvError::LeaseNotFound(*lease));
                }
            }
        }

        let revision = state.revision + 1;
        let mut events = Vec::new();
        let mut deleted = 0;
        for op in ops {
            match op {
                Op::Put { key, value, lease } => events.push(state.put(key, value, lease, revision)),
                Op::Delete(key) => {
                    if let Some(event) = state.delete(&key, revision) {
                        deleted += 1;
                        events.push(event);
                    }
                }
                Op::DeletePrefix(prefix) => {
                    let keys: Vec<String> = state.scan(&prefix).map(|kv| kv.key.clone()).collect();
                    for key in keys {
                        if let Some(event) = state.delete(&key, revision) {
                            deleted += 1;
                            events.push(event);
                        }
                    }
                }
            }
        }

        if let Err(e) = self.persist(&events, revision) {
            error!("Failed to persist revision {revision}, rolling back: {e}");
            state.undo(events);
            return Err(e.into());
        }
        self.publish(&mut state, revision, events);
        Ok(TxnResponse {
            succeeded,
            revision: state.revision,
            deleted,
        })
    }

    // ---- Leases ----

    /// Grant a new lease with the TTL
    pub fn grant_lease(&self, ttl: Duration) -> LeaseId {
        let mut state = self.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        id
    }

    /// Extend the lease by its TTL
    pub fn keep_alive(&self, lease: LeaseId) -> KvResult<()> {
        let mut state = self.lock();
        let l = state
            .leases
            .get_mut(&lease)
            .ok_or(KvError::LeaseNotFound(lease))?;
        l.deadline = Instant::now() + l.ttl;
        Ok(())
    }

    /// Revoke the lease and delete its keys
    pub fn revoke_lease(&self, lease: LeaseId) -> KvResult<()> {
        let mut state = self.lock();
        if self.revoke_locked(&mut state, lease) {
            Ok(())
        } else {
            Err(KvError::LeaseNotFound(lease))
        }
    }

    pub fn lease_alive(&self, lease: LeaseId) -> bool {
        self.lock().leases.contains_key(&lease)
    }

    /// Delete keys of expired leases now
    pub fn expire_leases(&self) {
        drop(self.lock());
    }

    /// Periodically reap expired leases until cancelled
    pub fn spawn_lease_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => store.expire_leases(),
                }
            }
        })
    }

    // ---- Watch ----

    /// Watch changes under the prefix, starting after the current revision
    pub fn watch(&self, prefix: impl Into<String>) -> Watcher {
        let state = self.lock();
        Watcher::from_broadcast(prefix.into(), self.events.subscribe(), state.revision)
    }

    /// Read all keys under the prefix and watch changes after the read, atomically
    pub fn get_all_and_watch(&self, prefix: impl Into<String>) -> (Vec<KeyValue>, Revision, Watcher) {
        let prefix = prefix.into();
        let state = self.lock();
        let kvs = state.scan(&prefix).cloned().collect();
        let watcher = Watcher::from_broadcast(prefix, self.events.subscribe(), state.revision);
        (kvs, state.revision, watcher)
    }

    pub fn subscribe_revision(&self) -> watch::Receiver<Revision> {
        self.revision.subscribe()
    }

    /// Wait until the store reaches the revision
    pub async fn wait_for_revision(&self, revision: Revision) {
        let mut rx = self.subscribe_revision();
        // The sender lives as long as self
        let _ = rx.wait_for(|current| *current >= revision).await;
    }
}

#[async_trait]
impl MetaStore for KvStore {
    async fn get(&self, key: &str) -> KvResult<Option<KeyValue>> {
        Ok(Self::get(self, key))
    }

    async fn range(&self, prefix: &str) -> KvResult<(Vec<KeyValue>, Revision)> {
        Ok(Self::range(self, prefix))
    }

    async fn txn(&self, txn: Txn) -> KvResult<TxnResponse> {
        Self::txn(self, txn)
    }

    async fn revision(&self) -> KvResult<Revision> {
        Ok(Self::revision(self))
    }

    async fn grant_lease(&self, ttl: Duration) -> KvResult<LeaseId> {
        Ok(Self::grant_lease(self, ttl))
    }

    async fn keep_alive(&self, lease: LeaseId) -> KvResult<()> {
        Self::keep_alive(self, lease)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> KvResult<()> {
        Self::revoke_lease(self, lease)
    }

    async fn watch(&self, prefix: &str) -> KvResult<Watcher> {
        Ok(Self::watch(self, prefix))
    }

    async fn get_all_and_watch(&self, prefix: &str) -> KvResult<(Vec<KeyValue>, Revision, Watcher)> {
        Ok(Self::get_all_and_watch(self, prefix))
    }
}
