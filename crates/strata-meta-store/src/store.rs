//! Metadata store client interface.
//!
//! Everything above this crate talks to the metadata store through
//! [`MetaStore`]. The embedded [`KvStore`] serves single process
//! deployments and tests. With the `etcd` feature, [`EtcdStore`] connects
//! the node to an etcd cluster shared by all nodes.
//!
//! [`KvStore`]: crate::KvStore
//! [`EtcdStore`]: crate::etcd::EtcdStore

use crate::kv::{KeyValue, KvResult, LeaseId, Revision};
use crate::txn::{Op, Txn, TxnResponse};
use crate::watch::Watcher;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Shared handle to a metadata store client
pub type SharedStore = Arc<dyn MetaStore>;

/// Transactional, watchable key-value store with leases
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Get one key
    async fn get(&self, key: &str) -> KvResult<Option<KeyValue>>;

    /// Get all keys under the prefix, sorted, with the revision of the read
    async fn range(&self, prefix: &str) -> KvResult<(Vec<KeyValue>, Revision)>;

    /// Evaluate compares and apply the matching branch atomically
    async fn txn(&self, txn: Txn) -> KvResult<TxnResponse>;

    /// Current store revision
    async fn revision(&self) -> KvResult<Revision>;

    /// Grant a new lease with the TTL
    async fn grant_lease(&self, ttl: Duration) -> KvResult<LeaseId>;

    /// Extend the lease by its TTL, fails with `LeaseNotFound` if it expired
    async fn keep_alive(&self, lease: LeaseId) -> KvResult<()>;

    /// Revoke the lease and delete its keys
    async fn revoke_lease(&self, lease: LeaseId) -> KvResult<()>;

    /// Watch changes under the prefix, starting after the current revision
    async fn watch(&self, prefix: &str) -> KvResult<Watcher>;

    /// Read all keys under the prefix and watch changes after the read
    async fn get_all_and_watch(&self, prefix: &str) -> KvResult<(Vec<KeyValue>, Revision, Watcher)>;

    /// Unconditional put
    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<Revision> {
        Ok(self.txn(Txn::new().and_then(Op::put(key, value))).await?.revision)
    }

    /// Unconditional delete, returns false if the key did not exist
    async fn delete(&self, key: &str) -> KvResult<bool> {
        Ok(self.txn(Txn::new().and_then(Op::delete(key))).await?.deleted > 0)
    }

    /// Number of keys under the prefix
    async fn count(&self, prefix: &str) -> KvResult<usize> {
        Ok(self.range(prefix).await?.0.len())
    }
}
