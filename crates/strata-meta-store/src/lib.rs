//! Strata Metadata Store - transactional key-value store client
//!
//! This crate defines the metadata store interface used by all Strata
//! components: an ordered key space with global revisions, conditional
//! transactions, TTL leases and prefix watches. The embedded [`KvStore`]
//! implements it in-process with optional redb durability, the `etcd`
//! feature adds a client of a shared etcd cluster. Distributed locks are
//! built on top of leases.

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod kv;
pub mod lock;
pub mod persist;
pub mod store;
pub mod tables;
pub mod txn;
pub mod watch;

// Re-exports
pub use kv::{KeyValue, KvError, KvResult, KvStore, LeaseId, Revision};
pub use lock::{DistMutex, LockError, LockProvider};
pub use persist::{KvPersistence, PersistError, Persistence};
pub use store::{MetaStore, SharedStore};
pub use txn::{Compare, Op, Txn, TxnResponse};
pub use watch::{Event, EventKind, WatchResponse, Watcher};
