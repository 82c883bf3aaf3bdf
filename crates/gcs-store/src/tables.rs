//! redb table definitions for the GCS backing store.
//!
//! The store is a single keyspace: `&str` keys, opaque `&[u8]` values.
//! Table kinds are namespaced by the client inside the key itself
//! (`{PREFIX}:{scope}:{key}`), which keeps every scope contiguous for
//! prefix scans.

use redb::TableDefinition;

/// Every record, keyed by its full namespaced key.
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
