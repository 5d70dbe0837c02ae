//! Close synchronization between writer (source) nodes and operators.
//!
//! Before a slice is closed the operator must be sure that no writer still
//! writes into it based on an older view of the metadata. Each writer node
//! reports the last store revision it fully applied under
//! `storage/closesync/source/{nodeId}`. The key is bound to the writer's
//! lease, so a dead writer stops blocking the operators.

use crate::atomic::{decode, encode};
use crate::error::StorageResult;
use crate::schema;
use std::collections::BTreeMap;
use strata_meta_store::{EventKind, LeaseId, Op, Revision, SharedStore, Txn};
use tracing::{debug, warn};

/// Writer node side
pub struct CloseSyncSource {
    store: SharedStore,
    node_id: String,
    lease: LeaseId,
}

impl CloseSyncSource {
    pub const fn new(store: SharedStore, node_id: String, lease: LeaseId) -> Self {
        Self { store, node_id, lease }
    }

    /// Report that all changes up to the revision are applied
    pub async fn report(&self, revision: Revision) -> StorageResult<()> {
        let key = schema::closesync_source(&self.node_id);
        self.store
            .txn(Txn::new().and_then(Op::put_with_lease(key, encode(&revision)?, self.lease)))
            .await?;
        debug!("Close sync: node {} reported revision {revision}", self.node_id);
        Ok(())
    }
}

/// Operator side
pub struct CloseSyncCoordinator {
    store: SharedStore,
}

impl CloseSyncCoordinator {
    pub const fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Wait until every live source node reports at least the revision
    pub async fn wait_for_revision(&self, revision: Revision) -> StorageResult<()> {
        loop {
            let (kvs, _, mut watcher) = self.store.get_all_and_watch(schema::CLOSESYNC_SOURCE_PREFIX).await?;
            let mut sources = BTreeMap::new();
            for kv in kvs {
                sources.insert(kv.key, decode::<Revision>(&kv.value)?);
            }

            loop {
                if sources.values().all(|r| *r >= revision) {
                    return Ok(());
                }
                match watcher.next().await {
                    Ok(resp) => {
                        for event in resp.events {
                            match event.kind {
                                EventKind::Create | EventKind::Update => {
                                    sources.insert(event.kv.key, decode(&event.kv.value)?);
                                }
                                EventKind::Delete => {
                                    sources.remove(&event.kv.key);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Close sync watch failed, resyncing: {e}");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use strata_meta_store::KvStore;

    #[tokio::test]
    async fn test_no_sources() {
        let store = Arc::new(KvStore::new());
        CloseSyncCoordinator::new(store).wait_for_revision(100).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_all_sources() {
        let store = Arc::new(KvStore::new());
        let lease = store.grant_lease(Duration::from_secs(60));
        let source1 = CloseSyncSource::new(store.clone(), "node-1".to_string(), lease);
        let source2 = CloseSyncSource::new(store.clone(), "node-2".to_string(), lease);
        source1.report(1).await.unwrap();
        source2.report(1).await.unwrap();

        let coordinator = CloseSyncCoordinator::new(store.clone());
        let waiter = tokio::spawn(async move { coordinator.wait_for_revision(10).await });

        source1.report(10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        source2.report(12).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dead_source_is_ignored() {
        let store = Arc::new(KvStore::new());
        let lease = store.grant_lease(Duration::from_secs(60));
        CloseSyncSource::new(store.clone(), "node-1".to_string(), lease)
            .report(1)
            .await
            .unwrap();

        let coordinator = CloseSyncCoordinator::new(store.clone());
        let waiter = tokio::spawn(async move { coordinator.wait_for_revision(10).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.revoke_lease(lease).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
