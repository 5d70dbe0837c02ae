//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Key-value data, value is a bincode encoded `KeyValue`
pub const KEY_VALUES: TableDefinition<&str, &[u8]> = TableDefinition::new("key_values");

// Store metadata, e.g. the current revision
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub const META_REVISION: &str = "revision";
