//! Conflict-safe port-mapping table.
//!
//! `MappingTable` turns the single-record CAS of a [`MappingStore`] into the
//! relay's add/remove operations. Each attempt reads a snapshot, computes the
//! next cluster state from it, and commits only if nobody else committed in
//! between. Allocation failures are final; CAS conflicts are retried.

use std::sync::Arc;

use relay_core::config::PortPoolConfig;
use relay_core::{ClusterId, ClusterState, Port, PortMapping};
use tracing::{debug, info, warn};

use crate::allocator::find_range;
use crate::error::{StateError, StateResult};
use crate::store::MappingStore;

/// A committed mapping and the cluster revision it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingUpdate {
    pub cluster_id: ClusterId,
    pub revision: u64,
    pub mapping: PortMapping,
}

/// Result of removing a lease from every cluster.
#[derive(Debug, Default)]
pub struct LeaseRemoval {
    /// Clusters the lease was removed from, with their new revisions.
    pub removed: Vec<(ClusterId, u64)>,
    pub failed: Vec<(ClusterId, StateError)>,
}

/// Port-mapping operations over a shared [`MappingStore`].
#[derive(Clone)]
pub struct MappingTable {
    store: Arc<dyn MappingStore>,
    pool: PortPoolConfig,
}

impl MappingTable {
    pub fn new(store: Arc<dyn MappingStore>, pool: PortPoolConfig) -> Self {
        Self { store, pool }
    }

    pub fn pool(&self) -> PortPoolConfig {
        self.pool
    }

    /// Allocate relay ports for `ports` and store the mapping for `lease_id`.
    ///
    /// Re-adding an existing lease replaces its mapping; its old relay ports
    /// count as free for the new allocation and its allowed sources are kept.
    /// A conflicting concurrent write is retried up to `num_retries` times.
    pub fn add_port_mapping(
        &self,
        cluster_id: &str,
        lease_id: &str,
        client_ip: Option<&str>,
        agent_ip: &str,
        ports: &[Port],
        num_retries: u32,
    ) -> StateResult<MappingUpdate> {
        let mut template = PortMapping {
            lease_id: lease_id.to_string(),
            agent_ip: agent_ip.to_string(),
            allowed_source_ips: Default::default(),
            ports: ports
                .iter()
                .map(|p| Port::new(p.protocol, p.agent_port))
                .collect(),
        };
        if let Some(ip) = client_ip {
            template.allowed_source_ips.insert(ip.to_string());
        }
        template.validate()?;

        let attempts = num_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let snapshot = self.store.load(cluster_id)?;
            let used = snapshot.used_relay_ports(Some(lease_id));

            let range = find_range(&used, ports.len(), self.pool.min_port, self.pool.max_port);
            if range.is_empty() {
                warn!(
                    %cluster_id,
                    %lease_id,
                    requested = ports.len(),
                    in_use = used.len(),
                    "no contiguous relay port range available"
                );
                return Err(StateError::OutOfPorts {
                    cluster_id: cluster_id.to_string(),
                    requested: ports.len(),
                });
            }

            let mut mapping = template.clone();
            for (port, relay_port) in mapping.ports.iter_mut().zip(range) {
                port.relay_port = Some(relay_port);
            }
            if let Some(existing) = snapshot.mappings.get(lease_id) {
                mapping
                    .allowed_source_ips
                    .extend(existing.allowed_source_ips.iter().cloned());
            }

            let mut next = snapshot.clone();
            next.revision = snapshot.revision + 1;
            next.mappings.insert(lease_id.to_string(), mapping.clone());

            if self
                .store
                .compare_and_swap(cluster_id, snapshot.revision, &next)?
            {
                info!(
                    %cluster_id,
                    %lease_id,
                    revision = next.revision,
                    relay_ports = ?mapping.relay_ports().collect::<Vec<_>>(),
                    "port mapping added"
                );
                return Ok(MappingUpdate {
                    cluster_id: cluster_id.to_string(),
                    revision: next.revision,
                    mapping,
                });
            }
            warn!(%cluster_id, %lease_id, attempt, "port mapping add lost a race, retrying");
        }

        Err(StateError::ConcurrentModification {
            cluster_id: cluster_id.to_string(),
            attempts,
        })
    }

    /// Remove the mapping for `lease_id` from one cluster.
    ///
    /// Returns the new revision, or `None` if the lease had no mapping there.
    pub fn remove_port_mapping(
        &self,
        cluster_id: &str,
        lease_id: &str,
        num_retries: u32,
    ) -> StateResult<Option<u64>> {
        let attempts = num_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let snapshot = self.store.load(cluster_id)?;
            if !snapshot.mappings.contains_key(lease_id) {
                debug!(%cluster_id, %lease_id, "no mapping to remove");
                return Ok(None);
            }

            let mut next = snapshot.clone();
            next.revision = snapshot.revision + 1;
            next.mappings.remove(lease_id);

            if self
                .store
                .compare_and_swap(cluster_id, snapshot.revision, &next)?
            {
                info!(%cluster_id, %lease_id, revision = next.revision, "port mapping removed");
                return Ok(Some(next.revision));
            }
            warn!(%cluster_id, %lease_id, attempt, "port mapping remove lost a race, retrying");
        }

        Err(StateError::ConcurrentModification {
            cluster_id: cluster_id.to_string(),
            attempts,
        })
    }

    /// Remove `lease_id` from every known cluster.
    ///
    /// A failure in one cluster does not stop the others; committed removals
    /// and per-cluster failures are both reported.
    pub fn remove_port_mapping_everywhere(
        &self,
        lease_id: &str,
        num_retries: u32,
    ) -> StateResult<LeaseRemoval> {
        let mut outcome = LeaseRemoval::default();
        for cluster_id in self.store.clusters()? {
            match self.remove_port_mapping(&cluster_id, lease_id, num_retries) {
                Ok(Some(revision)) => outcome.removed.push((cluster_id, revision)),
                Ok(None) => {}
                Err(e) => {
                    warn!(%cluster_id, %lease_id, error = %e, "port mapping remove failed");
                    outcome.failed.push((cluster_id, e));
                }
            }
        }
        Ok(outcome)
    }

    /// Snapshot of one cluster.
    pub fn get_port_mappings(&self, cluster_id: &str) -> StateResult<ClusterState> {
        self.store.load(cluster_id)
    }

    /// Every cluster known to the store.
    pub fn get_clusters(&self) -> StateResult<Vec<ClusterId>> {
        self.store.clusters()
    }
}
