//! Mapping store backends.
//!
//! A [`MappingStore`] holds one [`ClusterState`] record per cluster and
//! replaces it only through [`MappingStore::compare_and_swap`]. Any store
//! that can do a conditional write on a single key can back the relay; the
//! crate ships an in-memory map and an embedded redb database.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use redb::{Database, ReadableDatabase, ReadableTable};
use relay_core::{ClusterId, ClusterState};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::CLUSTERS;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Storage seam shared by every relay-server replica.
pub trait MappingStore: Send + Sync {
    /// Current state of a cluster. Unknown clusters read as revision 0 with
    /// no mappings.
    fn load(&self, cluster_id: &str) -> StateResult<ClusterState>;

    /// Replace the cluster record with `next` iff its stored revision is
    /// still `expected_revision`. Returns false on a lost race.
    fn compare_and_swap(
        &self,
        cluster_id: &str,
        expected_revision: u64,
        next: &ClusterState,
    ) -> StateResult<bool>;

    /// Every cluster that has ever been written.
    fn clusters(&self) -> StateResult<Vec<ClusterId>>;
}

// ── In-memory ─────────────────────────────────────────────────────

/// Process-local store, for tests and single-replica deployments.
#[derive(Clone, Default)]
pub struct MemoryMappingStore {
    clusters: Arc<RwLock<HashMap<ClusterId, ClusterState>>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MappingStore for MemoryMappingStore {
    fn load(&self, cluster_id: &str) -> StateResult<ClusterState> {
        let clusters = self.clusters.read().expect("clusters lock");
        Ok(clusters.get(cluster_id).cloned().unwrap_or_default())
    }

    fn compare_and_swap(
        &self,
        cluster_id: &str,
        expected_revision: u64,
        next: &ClusterState,
    ) -> StateResult<bool> {
        let mut clusters = self.clusters.write().expect("clusters lock");
        let current = clusters.get(cluster_id).map(|s| s.revision).unwrap_or(0);
        if current != expected_revision {
            debug!(%cluster_id, expected_revision, current, "cas rejected");
            return Ok(false);
        }
        clusters.insert(cluster_id.to_string(), next.clone());
        Ok(true)
    }

    fn clusters(&self) -> StateResult<Vec<ClusterId>> {
        let clusters = self.clusters.read().expect("clusters lock");
        let mut ids: Vec<ClusterId> = clusters.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ── redb ──────────────────────────────────────────────────────────

/// Durable store backed by an embedded redb database.
///
/// redb serializes write transactions, so the revision check and the write
/// happen inside one transaction.
#[derive(Clone)]
pub struct RedbMappingStore {
    db: Arc<Database>,
}

impl RedbMappingStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "mapping store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory redb store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory mapping store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> StateResult<ClusterState> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

impl MappingStore for RedbMappingStore {
    fn load(&self, cluster_id: &str) -> StateResult<ClusterState> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        match table.get(cluster_id).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value()),
            None => Ok(ClusterState::default()),
        }
    }

    fn compare_and_swap(
        &self,
        cluster_id: &str,
        expected_revision: u64,
        next: &ClusterState,
    ) -> StateResult<bool> {
        let value = serde_json::to_vec(next).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let current = match table.get(cluster_id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?.revision,
                None => 0,
            };
            if current != expected_revision {
                debug!(%cluster_id, expected_revision, current, "cas rejected");
                drop(table);
                txn.abort().map_err(map_err!(Transaction))?;
                return Ok(false);
            }
            table
                .insert(cluster_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    fn clusters(&self) -> StateResult<Vec<ClusterId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Port, PortMapping, Protocol};
    use std::collections::BTreeSet;

    fn state_with(revision: u64, lease: &str) -> ClusterState {
        let mut state = ClusterState {
            revision,
            ..Default::default()
        };
        state.mappings.insert(
            lease.to_string(),
            PortMapping {
                lease_id: lease.to_string(),
                agent_ip: "10.0.0.1".to_string(),
                allowed_source_ips: BTreeSet::new(),
                ports: vec![Port {
                    protocol: Protocol::Tcp,
                    agent_port: 22,
                    relay_port: Some(1000),
                }],
            },
        );
        state
    }

    fn backends() -> Vec<(&'static str, Box<dyn MappingStore>)> {
        vec![
            ("memory", Box::new(MemoryMappingStore::new())),
            ("redb", Box::new(RedbMappingStore::open_in_memory().unwrap())),
        ]
    }

    #[test]
    fn unknown_cluster_reads_empty() {
        for (name, store) in backends() {
            let state = store.load("nope").unwrap();
            assert_eq!(state, ClusterState::default(), "{name}");
            assert!(store.clusters().unwrap().is_empty(), "{name}");
        }
    }

    #[test]
    fn cas_applies_when_revision_matches() {
        for (name, store) in backends() {
            let next = state_with(1, "lease1");
            assert!(store.compare_and_swap("c1", 0, &next).unwrap(), "{name}");
            assert_eq!(store.load("c1").unwrap(), next, "{name}");
            assert_eq!(store.clusters().unwrap(), vec!["c1".to_string()], "{name}");
        }
    }

    #[test]
    fn cas_rejects_stale_revision() {
        for (name, store) in backends() {
            store.compare_and_swap("c1", 0, &state_with(1, "a")).unwrap();

            // A second writer still holding revision 0 loses.
            let lost = store.compare_and_swap("c1", 0, &state_with(1, "b")).unwrap();
            assert!(!lost, "{name}");

            let state = store.load("c1").unwrap();
            assert!(state.mappings.contains_key("a"), "{name}");
            assert!(!state.mappings.contains_key("b"), "{name}");
        }
    }

    #[test]
    fn clusters_are_independent() {
        for (name, store) in backends() {
            store.compare_and_swap("c1", 0, &state_with(1, "a")).unwrap();
            store.compare_and_swap("c2", 0, &state_with(1, "b")).unwrap();

            assert_eq!(store.load("c1").unwrap().mappings.len(), 1, "{name}");
            assert!(store.load("c2").unwrap().mappings.contains_key("b"), "{name}");
            assert_eq!(store.clusters().unwrap().len(), 2, "{name}");
        }
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("relay.redb");

        {
            let store = RedbMappingStore::open(&db_path).unwrap();
            store.compare_and_swap("prod", 0, &state_with(1, "lease1")).unwrap();
        }

        let store = RedbMappingStore::open(&db_path).unwrap();
        let state = store.load("prod").unwrap();
        assert_eq!(state.revision, 1);
        assert!(state.mappings.contains_key("lease1"));
    }
}
