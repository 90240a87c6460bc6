//! Relay service — binds the mapping table, notifier, and liveness tracker
//! to the request surface.
//!
//! The service validates requests and dispatches them; allocation, change
//! detection, and heartbeat rules live in the components it wires together.

use std::sync::Arc;
use std::time::Duration;

use relay_cluster::LivenessTracker;
use relay_core::{ClusterId, Clock, Port, Protocol, RelayAgentInfo, RelayConfig, SystemClock};
use relay_state::{MappingStore, MappingTable, MemoryMappingStore, RedbMappingStore};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::*;
use crate::error::{RelayError, RelayResult};
use crate::notifier::{ChangeNotifier, MIN_TICK};

pub struct RelayService {
    config: RelayConfig,
    table: MappingTable,
    notifier: ChangeNotifier,
    liveness: LivenessTracker,
}

impl RelayService {
    pub fn new(config: RelayConfig, store: Arc<dyn MappingStore>, clock: Arc<dyn Clock>) -> Self {
        let table = MappingTable::new(store, config.ports);
        let liveness = LivenessTracker::new(clock)
            .with_timeouts(config.heartbeat_interval_ms, config.stale_timeout_ms);
        info!(
            min_port = config.ports.min_port,
            max_port = config.ports.max_port,
            num_retries = config.num_retries,
            "relay service initialized"
        );
        Self {
            config,
            table,
            notifier: ChangeNotifier::new(),
            liveness,
        }
    }

    /// Build a service on the store named by `config.state_path`, or an
    /// in-memory store when none is configured.
    pub fn open(config: RelayConfig) -> RelayResult<Self> {
        let store: Arc<dyn MappingStore> = match &config.state_path {
            Some(path) => Arc::new(RedbMappingStore::open(path)?),
            None => Arc::new(MemoryMappingStore::new()),
        };
        Ok(Self::new(config, store, Arc::new(SystemClock)))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    /// Long-poll for a cluster's mappings, recording the caller's heartbeat.
    pub async fn get_port_mappings(
        &self,
        request: GetPortMappingsRequest,
    ) -> RelayResult<GetPortMappingsResponse> {
        require("cluster_id", &request.cluster_id)?;
        require("agent_id", &request.agent_id)?;

        self.liveness.record_heartbeat(
            &request.cluster_id,
            &request.agent_id,
            &request.ip_addresses,
        );

        let limit = self.config.long_poll_timeout();
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .map_or(limit, |t| t.min(limit));

        let state = self
            .notifier
            .wait_for_change(&self.table, &request.cluster_id, request.revision, timeout)
            .await?;

        debug!(
            cluster_id = %request.cluster_id,
            agent_id = %request.agent_id,
            requested = request.revision,
            revision = state.revision,
            "port mappings served"
        );
        Ok(GetPortMappingsResponse {
            revision: state.revision,
            port_mappings: state.mapping_list(),
        })
    }

    pub fn add_port_mapping(
        &self,
        request: AddPortMappingRequest,
    ) -> RelayResult<AddPortMappingResponse> {
        require("cluster_id", &request.cluster_id)?;
        require("lease_id", &request.lease_id)?;

        let ports = request
            .ports
            .iter()
            .map(|spec| Ok(Port::new(spec.protocol.parse::<Protocol>()?, spec.port)))
            .collect::<RelayResult<Vec<Port>>>()?;

        let update = self.table.add_port_mapping(
            &request.cluster_id,
            &request.lease_id,
            request.client_ip.as_deref(),
            &request.agent_ip,
            &ports,
            self.config.num_retries,
        )?;
        self.notifier.publish(&update.cluster_id, update.revision);

        Ok(AddPortMappingResponse {
            revision: update.revision,
            port_mapping: update.mapping,
        })
    }

    /// Remove a lease's mapping from one cluster. False if it had none.
    pub fn remove_port_mapping(&self, cluster_id: &str, lease_id: &str) -> RelayResult<bool> {
        require("cluster_id", cluster_id)?;
        require("lease_id", lease_id)?;

        match self
            .table
            .remove_port_mapping(cluster_id, lease_id, self.config.num_retries)?
        {
            Some(revision) => {
                self.notifier.publish(cluster_id, revision);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a lease's mapping from whichever clusters hold one.
    ///
    /// Removals that committed are published even when another cluster
    /// failed; the first failure is then returned.
    pub fn remove_port_mapping_from_all(&self, lease_id: &str) -> RelayResult<bool> {
        require("lease_id", lease_id)?;

        let outcome = self
            .table
            .remove_port_mapping_everywhere(lease_id, self.config.num_retries)?;
        for (cluster_id, revision) in &outcome.removed {
            self.notifier.publish(cluster_id, *revision);
        }
        if let Some((cluster_id, e)) = outcome.failed.into_iter().next() {
            warn!(
                %lease_id,
                %cluster_id,
                removed = outcome.removed.len(),
                "lease removal incomplete"
            );
            return Err(e.into());
        }
        if outcome.removed.is_empty() {
            debug!(%lease_id, "lease had no mappings in any cluster");
        }
        Ok(!outcome.removed.is_empty())
    }

    pub fn get_available_relay_agents(&self, cluster_id: &str) -> RelayResult<Vec<RelayAgentInfo>> {
        require("cluster_id", cluster_id)?;
        Ok(self.liveness.available_agents(cluster_id))
    }

    pub fn get_clusters(&self) -> RelayResult<Vec<ClusterId>> {
        Ok(self.table.get_clusters()?)
    }

    pub fn set_timeouts(&self, heartbeat_interval_ms: u64, stale_timeout_ms: u64) {
        self.liveness
            .set_timeouts(heartbeat_interval_ms, stale_timeout_ms);
    }

    /// The nftables ruleset for a cluster's current mappings.
    pub fn generate_ruleset(&self, cluster_id: &str) -> RelayResult<String> {
        require("cluster_id", cluster_id)?;
        let state = self.table.get_port_mappings(cluster_id)?;
        Ok(relay_nat::generate_file(&state.mapping_list()))
    }

    /// Release every pending long poll.
    pub fn shutdown(&self) {
        self.notifier.shutdown();
    }

    /// Background upkeep: picks up other replicas' changes and drops stale
    /// relay agents until `shutdown` fires.
    pub async fn run_maintenance(&self, shutdown: watch::Receiver<bool>) {
        let refresh = self
            .notifier
            .run(&self.table, self.config.store_refresh_interval(), shutdown.clone());

        let reap = async {
            let mut shutdown = shutdown;
            let mut ticker = tokio::time::interval(self.liveness.heartbeat_interval().max(MIN_TICK));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = self.liveness.reap_stale();
                        if reaped > 0 {
                            warn!(reaped, "dropped stale relay agents");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        };

        tokio::join!(refresh, reap);
    }
}

fn require(field: &str, value: &str) -> RelayResult<()> {
    if value.trim().is_empty() {
        return Err(RelayError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}
