//! In-process state of mirrored entities.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strata_meta_store::Revision;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Mirrored entity with its in-process processing state.
///
/// The lock is shared by all versions of the entity, so one entity is
/// never checked twice at once. The processed flag belongs to one
/// version: it is set after a mutation and dropped with the version
/// once the watch delivers the change.
pub struct Tracked<T> {
    pub entity: Arc<T>,
    pub mod_revision: Revision,
    lock: Arc<Mutex<()>>,
    processed: Arc<AtomicBool>,
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self {
            entity: Arc::clone(&self.entity),
            mod_revision: self.mod_revision,
            lock: Arc::clone(&self.lock),
            processed: Arc::clone(&self.processed),
        }
    }
}

/// Held while the entity is checked
pub struct TrackedGuard {
    _lock: OwnedMutexGuard<()>,
}

impl<T> Tracked<T> {
    pub fn new(entity: T, mod_revision: Revision, old: Option<&Self>) -> Self {
        Self {
            entity: Arc::new(entity),
            mod_revision,
            lock: old.map_or_else(|| Arc::new(Mutex::new(())), |old| Arc::clone(&old.lock)),
            processed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a check, `None` if another check is running or the version was processed
    pub fn try_begin(&self) -> Option<TrackedGuard> {
        let lock = Arc::clone(&self.lock).try_lock_owned().ok()?;
        if self.processed.load(Ordering::Acquire) {
            return None;
        }
        Some(TrackedGuard { _lock: lock })
    }

    /// The entity was modified, skip it until the watch delivers the new version
    pub fn mark_processed(&self) {
        self.processed.store(true, Ordering::Release);
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }
}
