//! Persistent key-value storage backed by redb.
//!
//! Every revision is written through synchronously (write txn + commit)
//! before it becomes visible. Reads go through the in-memory map of the
//! [`KvStore`], this module only handles durability. Lease-bound keys are
//! ephemeral and never reach the disk.
//!
//! [`KvStore`]: crate::KvStore

use crate::kv::{KeyValue, Revision};
use crate::tables;
use crate::watch::{Event, EventKind};
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::error;

/// Error type for persistence operations
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for PersistError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Durable backend of the embedded store
pub trait Persistence: Send + Sync {
    /// Load all persisted keys and the last committed revision
    fn load(&self) -> PersistResult<(Vec<KeyValue>, Revision)>;

    /// Write the changes of one revision; on error nothing of the revision is stored
    fn apply(&self, events: &[Event], revision: Revision) -> PersistResult<()>;
}

/// Durable copy of the store content in a redb database
pub struct KvPersistence {
    db: Database,
}

impl KvPersistence {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::KEY_VALUES)?;
            let _t = write_txn.open_table(tables::META)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl Persistence for KvPersistence {
    fn load(&self) -> PersistResult<(Vec<KeyValue>, Revision)> {
        let read_txn = self.db.begin_read()?;

        let meta = read_txn.open_table(tables::META)?;
        let revision = match meta.get(tables::META_REVISION)? {
            Some(val) => bincode::deserialize(val.value())?,
            None => 0,
        };

        let table = read_txn.open_table(tables::KEY_VALUES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match bincode::deserialize::<KeyValue>(entry.1.value()) {
                Ok(kv) => result.push(kv),
                Err(e) => error!("Failed to decode key '{}': {}", key, e),
            }
        }
        Ok((result, revision))
    }

    fn apply(&self, events: &[Event], revision: Revision) -> PersistResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::KEY_VALUES)?;
            for event in events {
                let key = event.kv.key.as_str();
                match event.kind {
                    EventKind::Create | EventKind::Update if event.kv.lease.is_none() => {
                        let bytes = bincode::serialize(&event.kv)?;
                        table.insert(key, bytes.as_slice())?;
                    }
                    _ => {
                        table.remove(key)?;
                    }
                }
            }

            let mut meta = write_txn.open_table(tables::META)?;
            let bytes = bincode::serialize(&revision)?;
            meta.insert(tables::META_REVISION, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
