//! Watch streams.
//!
//! A [`Watcher`] is a stream of [`WatchResponse`]s under a key prefix.
//! The embedded store publishes all committed writes on one broadcast
//! channel and filters them by prefix. Responses without matching events
//! are still delivered (with an empty event list) so consumers can track
//! the store revision, like etcd progress notifications.

use crate::kv::{KeyValue, KvError, KvResult, Revision};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Kind of a change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// One key change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// New value; for deletes the key with an empty value and the delete revision
    pub kv: KeyValue,
    /// Value before the change, if the key existed
    pub prev_kv: Option<KeyValue>,
}

/// Changes committed at one revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchResponse {
    pub revision: Revision,
    pub events: Vec<Event>,
}

impl WatchResponse {
    /// True if the response only advances the revision
    #[must_use]
    pub fn is_progress_notify(&self) -> bool {
        self.events.is_empty()
    }
}

/// Stream of changes under a prefix
pub struct Watcher {
    prefix: String,
    stream: BoxStream<'static, KvResult<WatchResponse>>,
}

impl Watcher {
    /// Wrap a backend specific stream of responses
    pub fn from_stream(prefix: String, stream: BoxStream<'static, KvResult<WatchResponse>>) -> Self {
        Self { prefix, stream }
    }

    /// Filter the broadcast of all committed revisions of the embedded store
    pub(crate) fn from_broadcast(
        prefix: String,
        rx: broadcast::Receiver<Arc<WatchResponse>>,
        after: Revision,
    ) -> Self {
        let filter = prefix.clone();
        let stream = stream::unfold((rx, after), move |(mut rx, mut after)| {
            let prefix = filter.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(resp) => {
                            if resp.revision <= after {
                                continue;
                            }
                            after = resp.revision;
                            let events = resp
                                .events
                                .iter()
                                .filter(|e| e.kv.key.starts_with(&prefix))
                                .cloned()
                                .collect();
                            let resp = WatchResponse {
                                revision: resp.revision,
                                events,
                            };
                            return Some((Ok(resp), (rx, after)));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((Err(KvError::WatchLagged(n)), (rx, after)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Self::from_stream(prefix, stream.boxed())
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next committed revision.
    ///
    /// Fails with [`KvError::WatchLagged`] if the watcher fell too far behind,
    /// the consumer must then resync from a fresh snapshot.
    pub async fn next(&mut self) -> KvResult<WatchResponse> {
        self.stream.next().await.unwrap_or(Err(KvError::WatchClosed))
    }
}
