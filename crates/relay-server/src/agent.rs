//! Relay agent — keeps a relay host's NAT rules in step with the service.
//!
//! The agent long-polls for its cluster's mappings, passing the last
//! revision it applied. Each answer is diffed against the local table and
//! compiled into an nftables ruleset, which is written only when its bytes
//! change. Every poll doubles as the host's heartbeat.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_core::{AgentId, ClusterId, LeaseId, PortMapping, RelayConfig};
use relay_nat::RulesetWriter;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{GetPortMappingsRequest, GetPortMappingsResponse};
use crate::error::{CancelReason, RelayError, RelayResult};
use crate::service::RelayService;

/// Where an agent fetches mappings from.
///
/// Implemented by [`RelayService`] for in-process use; a transport client
/// implements it to reach a remote service.
pub trait MappingSource: Send + Sync {
    fn get_port_mappings(
        &self,
        request: GetPortMappingsRequest,
    ) -> impl Future<Output = RelayResult<GetPortMappingsResponse>> + Send;
}

impl MappingSource for RelayService {
    fn get_port_mappings(
        &self,
        request: GetPortMappingsRequest,
    ) -> impl Future<Output = RelayResult<GetPortMappingsResponse>> + Send {
        RelayService::get_port_mappings(self, request)
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub cluster_id: ClusterId,
    pub agent_id: AgentId,
    /// Addresses advertised to clients through the service.
    pub ip_addresses: Vec<String>,
    /// Longest a single poll may wait.
    pub poll_timeout: Duration,
    /// Pause after a failed poll.
    pub error_cooldown: Duration,
}

impl AgentConfig {
    /// Poll timeout and cooldown taken from the shared relay configuration.
    pub fn from_relay_config(
        cluster_id: impl Into<ClusterId>,
        agent_id: impl Into<AgentId>,
        ip_addresses: Vec<String>,
        relay: &RelayConfig,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            agent_id: agent_id.into(),
            ip_addresses,
            poll_timeout: relay.long_poll_timeout(),
            error_cooldown: relay.error_cooldown(),
        }
    }
}

/// Lease ids that differ between two applied tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingDiff {
    pub added: Vec<LeaseId>,
    pub removed: Vec<LeaseId>,
    pub changed: Vec<LeaseId>,
}

impl MappingDiff {
    pub fn between(
        old: &BTreeMap<LeaseId, PortMapping>,
        new: &BTreeMap<LeaseId, PortMapping>,
    ) -> Self {
        let mut diff = Self::default();
        for (lease_id, mapping) in new {
            match old.get(lease_id) {
                None => diff.added.push(lease_id.clone()),
                Some(previous) if previous != mapping => diff.changed.push(lease_id.clone()),
                Some(_) => {}
            }
        }
        diff.removed = old
            .keys()
            .filter(|lease_id| !new.contains_key(*lease_id))
            .cloned()
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub struct RelayAgent<S> {
    config: AgentConfig,
    source: Arc<S>,
    writer: RulesetWriter,
    /// Last revision applied; `None` until the first successful poll.
    revision: Option<u64>,
    mappings: BTreeMap<LeaseId, PortMapping>,
}

impl<S: MappingSource> RelayAgent<S> {
    pub fn new(config: AgentConfig, source: Arc<S>, writer: RulesetWriter) -> Self {
        Self {
            config,
            source,
            writer,
            revision: None,
            mappings: BTreeMap::new(),
        }
    }

    /// Build an agent writing to the configured `ruleset_path`.
    pub fn open(config: AgentConfig, source: Arc<S>, relay: &RelayConfig) -> RelayResult<Self> {
        let path = relay.ruleset_path.clone().ok_or_else(|| {
            RelayError::InvalidRequest("ruleset_path is not configured".to_string())
        })?;
        Ok(Self::new(config, source, RulesetWriter::new(path)))
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    pub fn mappings(&self) -> &BTreeMap<LeaseId, PortMapping> {
        &self.mappings
    }

    /// Poll once and apply the answer.
    ///
    /// Returns `None` when the poll timed out with nothing new.
    pub async fn poll_once(&mut self) -> RelayResult<Option<MappingDiff>> {
        let request = GetPortMappingsRequest {
            cluster_id: self.config.cluster_id.clone(),
            agent_id: self.config.agent_id.clone(),
            ip_addresses: self.config.ip_addresses.clone(),
            // Never a live revision, so the first poll answers at once.
            revision: self.revision.map_or(-1, |r| r as i64),
            timeout_ms: Some(self.config.poll_timeout.as_millis() as u64),
        };

        let response = match self.source.get_port_mappings(request).await {
            Ok(response) => response,
            Err(RelayError::Cancelled(CancelReason::Timeout)) => {
                debug!(revision = ?self.revision, "poll timed out, no change");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let next: BTreeMap<LeaseId, PortMapping> = response
            .port_mappings
            .into_iter()
            .map(|m| (m.lease_id.clone(), m))
            .collect();
        let diff = MappingDiff::between(&self.mappings, &next);

        let ruleset = relay_nat::generate_file(&next.values().cloned().collect::<Vec<_>>());
        let written = self.writer.write_if_changed(&ruleset)?;

        self.mappings = next;
        self.revision = Some(response.revision);

        info!(
            cluster_id = %self.config.cluster_id,
            revision = response.revision,
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            written,
            "mappings applied"
        );
        Ok(Some(diff))
    }

    /// Poll until `shutdown` fires, cooling down after failures.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            cluster_id = %self.config.cluster_id,
            agent_id = %self.config.agent_id,
            path = ?self.writer.path(),
            "relay agent started"
        );
        loop {
            let result = tokio::select! {
                result = self.poll_once() => result,
                _ = shutdown.changed() => break,
            };

            if let Err(e) = result {
                warn!(error = %e, cooldown = ?self.config.error_cooldown, "poll failed");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.error_cooldown) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        info!(agent_id = %self.config.agent_id, "relay agent stopped");
    }
}
