//! Conditional multi-key transactions.
//!
//! A [`Txn`] is a list of compares evaluated atomically, followed by the
//! `then` ops if all compares hold or the `otherwise` ops if any fails.
//! Transactions built by different parts of an operation can be merged:
//! compares and ops are concatenated.

use crate::kv::{LeaseId, Revision};

/// A condition evaluated inside a transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compare {
    /// Key modification revision equals the value; 0 means the key does not exist
    ModRevision { key: String, revision: Revision },
    /// Key exists
    Exists(String),
    /// Key does not exist
    Missing(String),
    /// Key exists and holds exactly this value
    Value { key: String, value: Vec<u8> },
    /// Key exists and is bound to the lease, so the lease is alive
    Lease { key: String, lease: LeaseId },
    /// The prefix holds exactly the keys read at the revision, none of them modified since
    PrefixUnchanged {
        prefix: String,
        revision: Revision,
        keys: Vec<String>,
    },
}

/// A write performed by a transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete(String),
    DeletePrefix(String),
}

impl Op {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: LeaseId) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete(key.into())
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        Self::DeletePrefix(prefix.into())
    }
}

/// Transaction builder
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Txn {
    pub(crate) compares: Vec<Compare>,
    pub(crate) then: Vec<Op>,
    pub(crate) otherwise: Vec<Op>,
}

impl Txn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    #[must_use]
    pub fn when_all(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    #[must_use]
    pub fn and_then(mut self, op: Op) -> Self {
        self.then.push(op);
        self
    }

    #[must_use]
    pub fn or_else(mut self, op: Op) -> Self {
        self.otherwise.push(op);
        self
    }

    pub fn push_compare(&mut self, compare: Compare) {
        self.compares.push(compare);
    }

    pub fn push(&mut self, op: Op) {
        self.then.push(op);
    }

    /// Append compares and ops of another transaction
    pub fn merge(&mut self, other: Self) {
        self.compares.extend(other.compares);
        self.then.extend(other.then);
        self.otherwise.extend(other.otherwise);
    }

    /// True if the transaction writes nothing on success
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.then.is_empty()
    }

    #[must_use]
    pub fn compares(&self) -> &[Compare] {
        &self.compares
    }

    #[must_use]
    pub fn then_ops(&self) -> &[Op] {
        &self.then
    }
}

/// Result of a committed transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnResponse {
    /// All compares held
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: Revision,
    /// Number of keys deleted
    pub deleted: usize,
}
