//! Lease-backed distributed locks.
//!
//! A [`LockProvider`] owns one session lease per node. Each [`DistMutex`]
//! is a key `lock/{name}` bound to that lease and holding the holder id. If
//! the node stops refreshing its session, the lease expires and every lock
//! it held is released by the store.
//!
//! Locks are also serialized inside the process through a local mutex per
//! name, so two tasks of one node never race on the store.

use crate::kv::{KvError, LeaseId};
use crate::store::SharedStore;
use crate::txn::{Compare, Op, Txn};
use crate::watch::EventKind;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use strata_common::config::LockConfig;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of all lock keys
pub const LOCK_PREFIX: &str = "lock/";

const RELEASE_POLL: Duration = Duration::from_millis(100);

/// Error type for lock operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("already locked: {0}")]
    AlreadyLocked(String),
    #[error("not locked")]
    NotLocked,
    #[error("cannot acquire lock \"{key}\" within {timeout:?}")]
    GrantTimeout { key: String, timeout: Duration },
    #[error("lock store error: {0}")]
    Store(#[from] KvError),
}

impl LockError {
    #[must_use]
    pub const fn is_already_locked(&self) -> bool {
        matches!(self, Self::AlreadyLocked(_))
    }
}

/// Issues named distributed mutexes bound to the node session
pub struct LockProvider {
    store: SharedStore,
    node_id: String,
    config: LockConfig,
    session: tokio::sync::Mutex<Option<LeaseId>>,
    local: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl LockProvider {
    pub fn new(store: SharedStore, node_id: impl Into<String>, config: LockConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            node_id: node_id.into(),
            config,
            session: tokio::sync::Mutex::new(None),
            local: DashMap::new(),
        })
    }

    /// Create a mutex for the resource name; creating is cheap, nothing is locked yet
    #[must_use]
    pub fn new_mutex(self: &Arc<Self>, name: impl Into<String>) -> DistMutex {
        let name = name.into();
        DistMutex {
            provider: Arc::clone(self),
            key: format!("{LOCK_PREFIX}{name}"),
            name,
            held: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Current session lease, granted on first use
    async fn session(&self) -> Result<LeaseId, LockError> {
        let mut session = self.session.lock().await;
        if let Some(lease) = *session {
            return Ok(lease);
        }
        let lease = self.store.grant_lease(self.config.ttl()).await?;
        debug!("Lock session lease {lease} granted to node {}", self.node_id);
        *session = Some(lease);
        Ok(lease)
    }

    /// Forget the expired session, the next lock grants a new one
    async fn invalidate_session(&self, expired: LeaseId) {
        let mut session = self.session.lock().await;
        if *session == Some(expired) {
            warn!("Lock session lease {expired} expired, creating a new session");
            *session = None;
        }
    }

    /// Keep the session lease alive every TTL/3 until cancelled
    pub fn spawn_keep_alive(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let provider = Arc::clone(self);
        let period = self.config.ttl() / 3;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => provider.keep_alive().await,
                }
            }
        })
    }

    async fn keep_alive(&self) {
        let mut session = self.session.lock().await;
        if let Some(lease) = *session {
            if let Err(e) = self.store.keep_alive(lease).await {
                warn!("Cannot refresh lock session: {e}");
                *session = None;
            }
        }
    }

    /// Revoke the session; all locks of this node are released
    pub async fn close(&self) {
        let lease = self.session.lock().await.take();
        if let Some(lease) = lease {
            if let Err(e) = self.store.revoke_lease(lease).await {
                debug!("Lock session already closed: {e}");
            }
        }
    }

    fn local_mutex(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.local.entry(name.to_string()).or_default().value())
    }

    fn release_local(&self, name: &str) {
        self.local.remove_if(name, |_, m| Arc::strong_count(m) == 1);
    }
}

struct Held {
    holder: String,
    lease: LeaseId,
    _local: OwnedMutexGuard<()>,
}

/// A named distributed mutex
pub struct DistMutex {
    provider: Arc<LockProvider>,
    name: String,
    key: String,
    held: Mutex<Option<Held>>,
}

impl DistMutex {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.held.lock().is_some()
    }

    /// Acquire the lock, waiting at most the grant timeout
    pub async fn lock(&self) -> Result<(), LockError> {
        let timeout = self.provider.config.grant_timeout();
        tokio::time::timeout(timeout, self.acquire())
            .await
            .unwrap_or_else(|_| {
                Err(LockError::GrantTimeout {
                    key: self.key.clone(),
                    timeout,
                })
            })
    }

    async fn acquire(&self) -> Result<(), LockError> {
        if self.is_locked() {
            return Err(LockError::AlreadyLocked(self.name.clone()));
        }

        let local = self.provider.local_mutex(&self.name).lock_owned().await;
        let holder = self.new_holder();

        loop {
            let mut watcher = self.provider.store.watch(&self.key).await?;
            if let Some(lease) = self.try_put(&holder).await? {
                self.set_held(holder, lease, local);
                return Ok(());
            }

            // Wait until the current holder releases the key
            let key = &self.key;
            let _ = tokio::time::timeout(RELEASE_POLL, async {
                while let Ok(resp) = watcher.next().await {
                    if resp
                        .events
                        .iter()
                        .any(|e| e.kind == EventKind::Delete && &e.kv.key == key)
                    {
                        break;
                    }
                }
            })
            .await;
        }
    }

    /// Acquire the lock without waiting
    pub async fn try_lock(&self) -> Result<(), LockError> {
        if self.is_locked() {
            return Err(LockError::AlreadyLocked(self.name.clone()));
        }

        let Ok(local) = self.provider.local_mutex(&self.name).try_lock_owned() else {
            return Err(LockError::AlreadyLocked(self.name.clone()));
        };

        let holder = self.new_holder();
        match self.try_put(&holder).await {
            Ok(Some(lease)) => {
                self.set_held(holder, lease, local);
                Ok(())
            }
            result => {
                drop(local);
                self.provider.release_local(&self.name);
                result.and(Err(LockError::AlreadyLocked(self.name.clone())))
            }
        }
    }

    /// Release the lock
    pub async fn unlock(&self) -> Result<(), LockError> {
        let held = self.held.lock().take().ok_or(LockError::NotLocked)?;
        let released = release(&self.provider.store, &self.key, &held.holder).await;
        drop(held);
        self.provider.release_local(&self.name);

        if released? {
            Ok(())
        } else {
            // The lease expired in the meantime
            Err(LockError::NotLocked)
        }
    }

    /// Compares which hold only while this lock is held
    pub fn require(&self) -> Result<Vec<Compare>, LockError> {
        let held = self.held.lock();
        let held = held.as_ref().ok_or(LockError::NotLocked)?;
        Ok(vec![
            Compare::Value {
                key: self.key.clone(),
                value: held.holder.clone().into_bytes(),
            },
            Compare::Lease {
                key: self.key.clone(),
                lease: held.lease,
            },
        ])
    }

    fn new_holder(&self) -> String {
        format!("{}/{}", self.provider.node_id, Uuid::new_v4())
    }

    /// Put the key if it is free; a session which expired meanwhile is replaced once
    async fn try_put(&self, holder: &str) -> Result<Option<LeaseId>, LockError> {
        let mut renewed = false;
        loop {
            let lease = self.provider.session().await?;
            let txn = Txn::new()
                .when(Compare::Missing(self.key.clone()))
                .and_then(Op::put_with_lease(self.key.clone(), holder, lease));
            match self.provider.store.txn(txn).await {
                Ok(resp) => return Ok(resp.succeeded.then_some(lease)),
                Err(KvError::LeaseNotFound(_)) if !renewed => {
                    self.provider.invalidate_session(lease).await;
                    renewed = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn set_held(&self, holder: String, lease: LeaseId, local: OwnedMutexGuard<()>) {
        debug!("Lock \"{}\" acquired by {holder}", self.name);
        *self.held.lock() = Some(Held {
            holder,
            lease,
            _local: local,
        });
    }
}

async fn release(store: &SharedStore, key: &str, holder: &str) -> Result<bool, KvError> {
    let txn = Txn::new()
        .when(Compare::Value {
            key: key.to_string(),
            value: holder.as_bytes().to_vec(),
        })
        .and_then(Op::delete(key));
    Ok(store.txn(txn).await?.succeeded)
}

impl Drop for DistMutex {
    fn drop(&mut self) {
        let Some(held) = self.held.get_mut().take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Lock \"{}\" dropped outside of a runtime, it is released with the session", self.name);
            return;
        };
        let provider = Arc::clone(&self.provider);
        let key = self.key.clone();
        let name = self.name.clone();
        runtime.spawn(async move {
            if let Err(e) = release(&provider.store, &key, &held.holder).await {
                warn!("Cannot release lock \"{name}\" on drop: {e}");
            }
            drop(held);
            provider.release_local(&name);
        });
    }
}
