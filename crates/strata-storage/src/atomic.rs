//! Optimistic read-modify-write operations.
//!
//! An operation runs in two phases. The read phase loads everything it
//! needs through a [`Reader`], which records the revision of each read key
//! and the keys of each read prefix. The write phase is a single
//! transaction conditioned on those reads, plus the compares of the held
//! lock. If anything read changed in the meantime the whole operation is
//! run again.

use crate::error::{StorageError, StorageResult};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use strata_meta_store::{Compare, DistMutex, LockError, SharedStore, Txn};
use tracing::debug;

const MAX_ATTEMPTS: u32 = 3;

/// Future of the read phase, resolving to the writes and the result
pub type ReadPhase<'a, T> = BoxFuture<'a, StorageResult<(Txn, T)>>;

pub(crate) fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(value: &[u8]) -> StorageResult<T> {
    Ok(serde_json::from_slice(value)?)
}

/// Plain read of one entity
pub(crate) async fn get<T: DeserializeOwned>(store: &SharedStore, key: &str) -> StorageResult<Option<T>> {
    store.get(key).await?.map(|kv| decode(&kv.value)).transpose()
}

/// Plain read of all entities under the prefix, sorted by key
pub(crate) async fn list<T: DeserializeOwned>(store: &SharedStore, prefix: &str) -> StorageResult<Vec<T>> {
    let (kvs, _) = store.range(prefix).await?;
    kvs.iter().map(|kv| decode(&kv.value)).collect()
}

/// Read phase of an atomic operation; clones share the recorded reads
#[derive(Clone)]
pub struct Reader {
    store: SharedStore,
    compares: Arc<Mutex<Vec<Compare>>>,
}

impl Reader {
    fn new(store: SharedStore) -> Self {
        Self {
            store,
            compares: Arc::default(),
        }
    }

    /// Read one entity; its absence is also recorded
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let kv = self.store.get(key).await?;
        self.compares.lock().push(Compare::ModRevision {
            key: key.to_string(),
            revision: kv.as_ref().map_or(0, |kv| kv.mod_revision),
        });
        kv.map(|kv| decode(&kv.value)).transpose()
    }

    /// Read all entities under the prefix
    pub async fn list<T: DeserializeOwned>(&self, prefix: &str) -> StorageResult<Vec<T>> {
        Ok(self.list_kv(prefix).await?.into_iter().map(|(_, v)| v).collect())
    }

    /// Read all entities under the prefix, with their keys
    pub async fn list_kv<T: DeserializeOwned>(&self, prefix: &str) -> StorageResult<Vec<(String, T)>> {
        let (kvs, revision) = self.store.range(prefix).await?;
        self.compares.lock().push(Compare::PrefixUnchanged {
            prefix: prefix.to_string(),
            revision,
            keys: kvs.iter().map(|kv| kv.key.clone()).collect(),
        });
        kvs.into_iter()
            .map(|kv| Ok((kv.key, decode(&kv.value)?)))
            .collect()
    }

    fn take_compares(&self) -> Vec<Compare> {
        std::mem::take(&mut *self.compares.lock())
    }
}

/// Run the operation atomically, optionally under the held lock.
///
/// The read phase may be called several times, it must not have side effects.
pub async fn atomic<'a, T, F>(store: &SharedStore, lock: Option<&DistMutex>, op: F) -> StorageResult<T>
where
    F: Fn(Reader) -> ReadPhase<'a, T>,
{
    let lock_compares = lock.map(DistMutex::require).transpose()?.unwrap_or_default();

    for attempt in 1..=MAX_ATTEMPTS {
        let reader = Reader::new(Arc::clone(store));
        let (writes, value) = op(reader.clone()).await?;

        let mut txn = Txn::new()
            .when_all(lock_compares.iter().cloned())
            .when_all(reader.take_compares());
        txn.merge(writes);

        if store.txn(txn).await?.succeeded {
            return Ok(value);
        }

        if !lock_compares.is_empty()
            && !store
                .txn(Txn::new().when_all(lock_compares.iter().cloned()))
                .await?
                .succeeded
        {
            return Err(LockError::NotLocked.into());
        }
        debug!("Atomic operation conflict, attempt {attempt}/{MAX_ATTEMPTS}");
    }

    Err(StorageError::Conflict {
        attempts: MAX_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use strata_common::config::LockConfig;
    use strata_meta_store::{KvStore, LockProvider, Op};

    #[tokio::test]
    async fn test_atomic_retries_on_conflict() {
        let embedded = Arc::new(KvStore::new());
        let store: SharedStore = embedded.clone();
        embedded.put("counter", "1").unwrap();

        let calls = AtomicU32::new(0);
        let result = atomic(&store, None, |r| {
            let calls = &calls;
            let embedded = &embedded;
            Box::pin(async move {
                let value: u64 = r.get("counter").await?.unwrap_or(0);
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    // Concurrent modification between read and write
                    embedded.put("counter", "10").unwrap();
                }
                Ok((Txn::new().and_then(Op::put("counter", (value + 1).to_string())), value + 1))
            })
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result, 11);
        assert_eq!(embedded.get("counter").unwrap().value, b"11");
    }

    #[tokio::test]
    async fn test_atomic_gives_up() {
        let embedded = Arc::new(KvStore::new());
        let store: SharedStore = embedded.clone();
        let err = atomic(&store, None, |r| {
            let embedded = &embedded;
            Box::pin(async move {
                r.list::<u64>("p/").await?;
                embedded.put(format!("p/{}", embedded.revision()), "1").unwrap();
                Ok((Txn::new().and_then(Op::put("x", "1")), ()))
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { attempts: 3 }));
        assert!(embedded.get("x").is_none());
    }

    #[tokio::test]
    async fn test_atomic_detects_deleted_prefix_key() {
        let embedded = Arc::new(KvStore::new());
        let store: SharedStore = embedded.clone();
        embedded.put("p/a", "1").unwrap();
        embedded.put("p/b", "2").unwrap();

        let calls = AtomicU32::new(0);
        let sum = atomic(&store, None, |r| {
            let calls = &calls;
            let embedded = &embedded;
            Box::pin(async move {
                let values: Vec<u64> = r.list("p/").await?;
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    embedded.delete("p/b").unwrap();
                }
                let sum: u64 = values.iter().sum();
                Ok((Txn::new().and_then(Op::put("sum", sum.to_string())), sum))
            })
        })
        .await
        .unwrap();
        assert_eq!(sum, 1);
        assert_eq!(embedded.get("sum").unwrap().value, b"1");
    }

    #[tokio::test]
    async fn test_atomic_requires_lock() {
        let embedded = Arc::new(KvStore::new());
        let store: SharedStore = embedded.clone();
        let locks = LockProvider::new(Arc::clone(&store), "node", LockConfig::default());
        let lock = locks.new_mutex("resource");
        let write = |key: &'static str| {
            move |_: Reader| -> ReadPhase<'static, ()> {
                Box::pin(async move { Ok((Txn::new().and_then(Op::put(key, "1")), ())) })
            }
        };

        // Not locked at all
        let err = atomic(&store, Some(&lock), write("x")).await.unwrap_err();
        assert!(err.is_lock_error());

        lock.try_lock().await.unwrap();
        atomic(&store, Some(&lock), write("x")).await.unwrap();

        // Lock lost
        embedded.delete("lock/resource").unwrap();
        let err = atomic(&store, Some(&lock), write("y")).await.unwrap_err();
        assert!(err.is_lock_error());
        assert!(embedded.get("y").is_none());
    }
}
