//! Group membership and key ownership.
//!
//! A member registers `distribution/{group}/{node_id}` bound to its own
//! lease and keeps a local, watch driven copy of the member list. Ownership
//! checks are purely local: the key is hashed over the current members.

use crate::hrw::hrw_select;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use strata_common::config::DistributionConfig;
use strata_meta_store::{Event, EventKind, KeyValue, KvError, LeaseId, Op, Revision, SharedStore, Txn, Watcher};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Prefix of all group membership keys
pub const DISTRIBUTION_PREFIX: &str = "distribution/";

const CHANGES_BUFFER: usize = 64;
const RESYNC_BACKOFF: Duration = Duration::from_secs(1);

/// Error type for distribution operations
#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error("no node is available in the group \"{0}\"")]
    NoNode(String),
    #[error("distribution store error: {0}")]
    Store(#[from] KvError),
}

/// Membership of a group changed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub revision: Revision,
    pub nodes: Vec<String>,
}

/// Entry point to join distribution groups
pub struct DistributionNode {
    store: SharedStore,
    node_id: String,
    ttl: Duration,
    cancel: CancellationToken,
}

impl DistributionNode {
    pub fn new(
        store: SharedStore,
        node_id: impl Into<String>,
        config: &DistributionConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            node_id: node_id.into(),
            ttl: config.ttl(),
            cancel,
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Join the group and start tracking its members
    pub async fn group(&self, name: impl Into<String>) -> Result<Arc<GroupNode>, DistributionError> {
        let name = name.into();
        let prefix = format!("{DISTRIBUTION_PREFIX}{name}/");
        let key = format!("{prefix}{}", self.node_id);

        let lease = register(&self.store, &key, &self.node_id, self.ttl).await?;
        let (kvs, revision, watcher) = self.store.get_all_and_watch(&prefix).await?;
        let (changes, _) = broadcast::channel(CHANGES_BUFFER);

        let group = Arc::new(GroupNode {
            name,
            node_id: self.node_id.clone(),
            prefix,
            key,
            store: Arc::clone(&self.store),
            ttl: self.ttl,
            lease: Mutex::new(lease),
            nodes: RwLock::new(Vec::new()),
            changes,
            cancel: self.cancel.child_token(),
        });
        group.reset(&kvs, revision);
        info!(
            "Node {} joined distribution group \"{}\" with {} nodes",
            group.node_id,
            group.name,
            group.nodes().len()
        );

        tokio::spawn(Arc::clone(&group).run(watcher));
        Ok(group)
    }
}

async fn register(store: &SharedStore, key: &str, node_id: &str, ttl: Duration) -> Result<LeaseId, KvError> {
    let lease = store.grant_lease(ttl).await?;
    store
        .txn(Txn::new().and_then(Op::put_with_lease(key, node_id, lease)))
        .await?;
    Ok(lease)
}

/// Membership of one node in one group
pub struct GroupNode {
    name: String,
    node_id: String,
    prefix: String,
    key: String,
    store: SharedStore,
    ttl: Duration,
    lease: Mutex<LeaseId>,
    nodes: RwLock<Vec<String>>,
    changes: broadcast::Sender<ChangeEvent>,
    cancel: CancellationToken,
}

impl GroupNode {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sorted ids of the live members
    pub fn nodes(&self) -> Vec<String> {
        self.nodes.read().clone()
    }

    /// Check if the key is owned by this node
    pub fn is_owner(&self, key: &str) -> Result<bool, DistributionError> {
        let nodes = self.nodes.read();
        hrw_select(key, nodes.as_slice())
            .map(|owner| owner == &self.node_id)
            .ok_or_else(|| DistributionError::NoNode(self.name.clone()))
    }

    /// Like [`Self::is_owner`], an error is logged and treated as "not owner"
    pub fn must_check_is_owner(&self, key: &str) -> bool {
        match self.is_owner(key) {
            Ok(owner) => owner,
            Err(e) => {
                error!("Cannot check ownership of \"{key}\": {e}");
                false
            }
        }
    }

    /// Subscribe to membership changes
    pub fn on_change_listener(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Leave the group
    pub async fn close(&self) {
        self.cancel.cancel();
        let lease = *self.lease.lock();
        if let Err(e) = self.store.revoke_lease(lease).await {
            debug!("Distribution lease already released: {e}");
        }
        info!("Node {} left distribution group \"{}\"", self.node_id, self.name);
    }

    async fn run(self: Arc<Self>, mut watcher: Watcher) {
        let mut ticker = tokio::time::interval(self.ttl / 3);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.keep_alive().await,
                resp = watcher.next() => match resp {
                    Ok(resp) => {
                        if !resp.is_progress_notify() {
                            self.apply(&resp.events, resp.revision);
                        }
                    }
                    Err(e) => {
                        warn!("Distribution group \"{}\" watch failed, resyncing: {e}", self.name);
                        match self.store.get_all_and_watch(&self.prefix).await {
                            Ok((kvs, revision, fresh)) => {
                                watcher = fresh;
                                self.reset(&kvs, revision);
                            }
                            Err(e) => {
                                error!("Cannot resync distribution group \"{}\": {e}", self.name);
                                tokio::time::sleep(RESYNC_BACKOFF).await;
                            }
                        }
                    }
                },
            }
        }
    }

    async fn keep_alive(&self) {
        let lease = *self.lease.lock();
        if self.store.keep_alive(lease).await.is_ok() {
            return;
        }
        warn!(
            "Distribution lease of node {} expired, registering again",
            self.node_id
        );
        match register(&self.store, &self.key, &self.node_id, self.ttl).await {
            Ok(fresh) => *self.lease.lock() = fresh,
            Err(e) => error!("Cannot register node {} again: {e}", self.node_id),
        }
    }

    fn apply(&self, events: &[Event], revision: Revision) {
        let mut nodes = self.nodes.write();
        let mut changed = false;
        for event in events {
            let Some(node_id) = event.kv.key.strip_prefix(&self.prefix) else {
                continue;
            };
            match event.kind {
                EventKind::Create | EventKind::Update => {
                    if let Err(pos) = nodes.binary_search_by(|n| n.as_str().cmp(node_id)) {
                        nodes.insert(pos, node_id.to_string());
                        changed = true;
                    }
                }
                EventKind::Delete => {
                    if let Ok(pos) = nodes.binary_search_by(|n| n.as_str().cmp(node_id)) {
                        nodes.remove(pos);
                        changed = true;
                    }
                }
            }
        }
        if changed {
            self.notify(&nodes, revision);
        }
    }

    fn reset(&self, kvs: &[KeyValue], revision: Revision) {
        let mut fresh: Vec<String> = kvs
            .iter()
            .filter_map(|kv| kv.key.strip_prefix(&self.prefix).map(str::to_string))
            .collect();
        fresh.sort();

        let mut nodes = self.nodes.write();
        if *nodes != fresh {
            *nodes = fresh;
            self.notify(&nodes, revision);
        }
    }

    fn notify(&self, nodes: &[String], revision: Revision) {
        debug!(
            "Distribution group \"{}\" changed at revision {revision}: {nodes:?}",
            self.name
        );
        // No listeners is fine
        let _ = self.changes.send(ChangeEvent {
            revision,
            nodes: nodes.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_meta_store::KvStore;

    fn config() -> DistributionConfig {
        DistributionConfig::default()
    }

    fn shared(store: &Arc<KvStore>) -> SharedStore {
        store.clone()
    }

    #[tokio::test]
    async fn test_single_node_owns_everything() {
        let store = Arc::new(KvStore::new());
        let node = DistributionNode::new(shared(&store), "node-1", &config(), CancellationToken::new());
        let group = node.group("my-group").await.unwrap();
        assert_eq!(group.nodes(), vec!["node-1".to_string()]);
        assert!(group.is_owner("any/key").unwrap());
        assert!(store.get("distribution/my-group/node-1").is_some());
    }

    #[tokio::test]
    async fn test_two_nodes_split_keys() {
        let store = Arc::new(KvStore::new());
        let cancel = CancellationToken::new();
        let node1 = DistributionNode::new(shared(&store), "node-1", &config(), cancel.clone());
        let node2 = DistributionNode::new(shared(&store), "node-2", &config(), cancel.clone());

        let group1 = node1.group("my-group").await.unwrap();
        let mut changes = group1.on_change_listener();
        let group2 = node2.group("my-group").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.nodes, vec!["node-1".to_string(), "node-2".to_string()]);

        for i in 0..100 {
            let key = format!("key-{i}");
            let owner1 = group1.is_owner(&key).unwrap();
            let owner2 = group2.is_owner(&key).unwrap();
            assert!(owner1 ^ owner2, "key {key} must have exactly one owner");
        }

        // Node 2 leaves, node 1 takes over
        group2.close().await;
        let event = tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.nodes, vec!["node-1".to_string()]);
        assert!((0..100).all(|i| group1.must_check_is_owner(&format!("key-{i}"))));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_expired_member_registers_again() {
        let store = Arc::new(KvStore::new());
        let node = DistributionNode::new(shared(&store), "node-1", &config(), CancellationToken::new());
        let group = node.group("my-group").await.unwrap();

        // The lease expires while the node is stalled, the next tick registers again
        let lease = *group.lease.lock();
        store.revoke_lease(lease).unwrap();
        assert!(store.get("distribution/my-group/node-1").is_none());
        group.keep_alive().await;
        assert!(store.get("distribution/my-group/node-1").is_some());
        assert_ne!(*group.lease.lock(), lease);
        group.close().await;
    }

    #[tokio::test]
    async fn test_no_node() {
        let store = Arc::new(KvStore::new());
        let node = DistributionNode::new(shared(&store), "node-1", &config(), CancellationToken::new());
        let group = node.group("my-group").await.unwrap();
        group.reset(&[], store.revision());

        let err = group.is_owner("key").unwrap_err();
        assert_eq!(err.to_string(), "no node is available in the group \"my-group\"");
        assert!(!group.must_check_is_owner("key"));
        group.close().await;
    }
}
