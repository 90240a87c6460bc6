//! redb table definitions for the mapping store.

use redb::TableDefinition;

/// JSON-encoded `ClusterState` keyed by cluster id.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");
