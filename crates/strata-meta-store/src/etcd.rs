//! etcd backed metadata store.
//!
//! All nodes of a cluster connect to the same etcd cluster, which provides
//! the revisions, conditional transactions, leases and watches the rest of
//! Strata relies on. Compares without a direct etcd counterpart are
//! expanded into several etcd compares.

use crate::kv::{KeyValue, KvError, KvResult, LeaseId, Revision};
use crate::store::MetaStore;
use crate::txn::{Compare, Op, Txn, TxnResponse};
use crate::watch::{Event, EventKind, WatchResponse, Watcher};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare as EtcdCompare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions,
    Txn as EtcdTxn, TxnOp, TxnOpResponse, WatchOptions,
};
use futures::StreamExt;
use std::time::Duration;
use strata_common::config::StoreConfig;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const WATCH_BUFFER: usize = 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

fn remote(e: etcd_client::Error) -> KvError {
    KvError::Remote(e.to_string())
}

fn is_lease_not_found(e: &etcd_client::Error) -> bool {
    e.to_string().contains("lease not found")
}

fn convert(kv: &etcd_client::KeyValue) -> KvResult<KeyValue> {
    Ok(KeyValue {
        key: kv.key_str().map_err(remote)?.to_string(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: (kv.lease() != 0).then(|| kv.lease()),
    })
}

fn compares(compare: Compare, out: &mut Vec<EtcdCompare>) {
    match compare {
        Compare::ModRevision { key, revision } => {
            out.push(EtcdCompare::mod_revision(key, CompareOp::Equal, revision));
        }
        Compare::Exists(key) => out.push(EtcdCompare::version(key, CompareOp::Greater, 0)),
        Compare::Missing(key) => out.push(EtcdCompare::version(key, CompareOp::Equal, 0)),
        Compare::Value { key, value } => out.push(EtcdCompare::value(key, CompareOp::Equal, value)),
        Compare::Lease { key, lease } => out.push(EtcdCompare::lease(key, CompareOp::Equal, lease)),
        Compare::PrefixUnchanged { prefix, revision, keys } => {
            if keys.is_empty() {
                // An empty range compares as a missing key
                out.push(EtcdCompare::mod_revision(prefix, CompareOp::Equal, 0).with_prefix());
                return;
            }
            // Nothing created or modified, then nothing of the read keys deleted
            out.push(EtcdCompare::mod_revision(prefix, CompareOp::Less, revision + 1).with_prefix());
            for key in keys {
                out.push(EtcdCompare::mod_revision(key, CompareOp::Greater, 0));
            }
        }
    }
}

fn ops(ops: Vec<Op>) -> Vec<TxnOp> {
    ops.into_iter()
        .map(|op| match op {
            Op::Put { key, value, lease } => {
                TxnOp::put(key, value, lease.map(|lease| PutOptions::new().with_lease(lease)))
            }
            Op::Delete(key) => TxnOp::delete(key, None),
            Op::DeletePrefix(prefix) => TxnOp::delete(prefix, Some(DeleteOptions::new().with_prefix())),
        })
        .collect()
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

/// Metadata store client connected to an etcd cluster
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the endpoints of the configuration
    pub async fn connect(config: &StoreConfig) -> KvResult<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout())
            .with_timeout(config.request_timeout());
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(remote)?;
        info!("Connected to etcd {:?}", config.endpoints);
        Ok(Self { client })
    }

    async fn watch_from(&self, prefix: &str, start: Revision) -> KvResult<Watcher> {
        let options = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_progress_notify()
            .with_start_revision(start);
        let (mut watcher, mut stream) = self
            .client
            .watch_client()
            .watch(prefix, Some(options))
            .await
            .map_err(remote)?;

        let (tx, rx) = mpsc::channel::<KvResult<WatchResponse>>(WATCH_BUFFER);
        let name = prefix.to_string();
        tokio::spawn(async move {
            let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
            loop {
                let item = tokio::select! {
                    () = tx.closed() => break,
                    _ = progress.tick() => {
                        if let Err(e) = watcher.request_progress().await {
                            debug!("Cannot request watch progress of \"{name}\": {e}");
                        }
                        continue;
                    }
                    msg = stream.message() => match msg {
                        Ok(Some(resp)) if resp.canceled() => Err(KvError::Remote(format!(
                            "watch canceled, compacted at revision {}",
                            resp.compact_revision()
                        ))),
                        Ok(Some(resp)) => convert_watch(&resp),
                        Ok(None) => break,
                        Err(e) => Err(remote(e)),
                    },
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            if let Err(e) = watcher.cancel().await {
                debug!("Cannot cancel watch of \"{name}\": {e}");
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(Watcher::from_stream(prefix.to_string(), stream.boxed()))
    }
}

fn convert_watch(resp: &etcd_client::WatchResponse) -> KvResult<WatchResponse> {
    let revision = resp.header().map_or(0, etcd_client::ResponseHeader::revision);
    let mut events = Vec::with_capacity(resp.events().len());
    for event in resp.events() {
        let Some(kv) = event.kv() else {
            continue;
        };
        let kv = convert(kv)?;
        let kind = match event.event_type() {
            EventType::Put if kv.version == 1 => EventKind::Create,
            EventType::Put => EventKind::Update,
            EventType::Delete => EventKind::Delete,
        };
        let prev_kv = event.prev_kv().map(convert).transpose()?;
        events.push(Event { kind, kv, prev_kv });
    }
    Ok(WatchResponse { revision, events })
}

#[async_trait]
impl MetaStore for EtcdStore {
    async fn get(&self, key: &str) -> KvResult<Option<KeyValue>> {
        let resp = self.client.kv_client().get(key, None).await.map_err(remote)?;
        resp.kvs().first().map(convert).transpose()
    }

    async fn range(&self, prefix: &str) -> KvResult<(Vec<KeyValue>, Revision)> {
        let resp = self
            .client
            .kv_client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(remote)?;
        let revision = resp.header().map_or(0, etcd_client::ResponseHeader::revision);
        let kvs = resp.kvs().iter().map(convert).collect::<KvResult<Vec<_>>>()?;
        Ok((kvs, revision))
    }

    async fn txn(&self, txn: Txn) -> KvResult<TxnResponse> {
        let lease = txn.then.iter().find_map(|op| match op {
            Op::Put { lease, .. } => *lease,
            _ => None,
        });

        let mut cmps = Vec::new();
        for compare in txn.compares {
            compares(compare, &mut cmps);
        }
        let request = EtcdTxn::new()
            .when(cmps)
            .and_then(ops(txn.then))
            .or_else(ops(txn.otherwise));

        let resp = match self.client.kv_client().txn(request).await {
            Ok(resp) => resp,
            Err(e) if is_lease_not_found(&e) => return Err(KvError::LeaseNotFound(lease.unwrap_or_default())),
            Err(e) => return Err(remote(e)),
        };
        let deleted = resp
            .op_responses()
            .iter()
            .map(|op| match op {
                TxnOpResponse::Delete(d) => usize::try_from(d.deleted()).unwrap_or_default(),
                _ => 0,
            })
            .sum();
        Ok(TxnResponse {
            succeeded: resp.succeeded(),
            revision: resp.header().map_or(0, etcd_client::ResponseHeader::revision),
            deleted,
        })
    }

    async fn revision(&self) -> KvResult<Revision> {
        let resp = self
            .client
            .kv_client()
            .get("\0", Some(GetOptions::new().with_keys_only().with_limit(1)))
            .await
            .map_err(remote)?;
        Ok(resp.header().map_or(0, etcd_client::ResponseHeader::revision))
    }

    async fn grant_lease(&self, ttl: Duration) -> KvResult<LeaseId> {
        let resp = self
            .client
            .lease_client()
            .grant(ttl_secs(ttl), None)
            .await
            .map_err(remote)?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> KvResult<()> {
        let (mut keeper, mut stream) = self.client.lease_client().keep_alive(lease).await.map_err(remote)?;
        keeper.keep_alive().await.map_err(remote)?;
        match stream.message().await.map_err(remote)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(KvError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> KvResult<()> {
        match self.client.lease_client().revoke(lease).await {
            Ok(_) => Ok(()),
            Err(e) if is_lease_not_found(&e) => Err(KvError::LeaseNotFound(lease)),
            Err(e) => Err(remote(e)),
        }
    }

    async fn watch(&self, prefix: &str) -> KvResult<Watcher> {
        let revision = MetaStore::revision(self).await?;
        self.watch_from(prefix, revision + 1).await
    }

    async fn get_all_and_watch(&self, prefix: &str) -> KvResult<(Vec<KeyValue>, Revision, Watcher)> {
        let (kvs, revision) = self.range(prefix).await?;
        let watcher = self.watch_from(prefix, revision + 1).await.inspect_err(|e| {
            warn!("Cannot watch \"{prefix}\" after revision {revision}: {e}");
        })?;
        Ok((kvs, revision, watcher))
    }
}
