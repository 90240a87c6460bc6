//! Liveness tracker — heartbeat bookkeeping for relay hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_core::{AgentId, ClusterId, Clock, RelayAgentInfo};
use tracing::{debug, info};

/// Tracks the last poll of every relay host, per cluster.
pub struct LivenessTracker {
    clock: Arc<dyn Clock>,
    agents: Mutex<HashMap<ClusterId, HashMap<AgentId, RelayAgentInfo>>>,
    /// Heartbeat interval advertised to hosts.
    heartbeat_interval_ms: AtomicU64,
    /// Hosts silent for longer than this are not available.
    stale_timeout_ms: AtomicU64,
}

impl LivenessTracker {
    /// Create a tracker with a 5s heartbeat interval and a 30s stale timeout.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            agents: Mutex::new(HashMap::new()),
            heartbeat_interval_ms: AtomicU64::new(5_000),
            stale_timeout_ms: AtomicU64::new(30_000),
        }
    }

    pub fn with_timeouts(self, heartbeat_interval_ms: u64, stale_timeout_ms: u64) -> Self {
        self.set_timeouts(heartbeat_interval_ms, stale_timeout_ms);
        self
    }

    pub fn set_timeouts(&self, heartbeat_interval_ms: u64, stale_timeout_ms: u64) {
        self.heartbeat_interval_ms
            .store(heartbeat_interval_ms, Ordering::Relaxed);
        self.stale_timeout_ms.store(stale_timeout_ms, Ordering::Relaxed);
        info!(heartbeat_interval_ms, stale_timeout_ms, "liveness timeouts updated");
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.load(Ordering::Relaxed))
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms.load(Ordering::Relaxed))
    }

    /// Record a poll from `agent_id`, replacing its advertised addresses.
    pub fn record_heartbeat(&self, cluster_id: &str, agent_id: &str, ip_addresses: &[String]) {
        let now = self.clock.now_ms();
        let mut agents = self.agents.lock().expect("agents lock");
        let cluster = agents.entry(cluster_id.to_string()).or_default();
        match cluster.get_mut(agent_id) {
            Some(info) => {
                info.ip_addresses = ip_addresses.to_vec();
                info.last_heartbeat_ms = now;
            }
            None => {
                cluster.insert(
                    agent_id.to_string(),
                    RelayAgentInfo {
                        agent_id: agent_id.to_string(),
                        ip_addresses: ip_addresses.to_vec(),
                        last_heartbeat_ms: now,
                    },
                );
                info!(%cluster_id, %agent_id, ?ip_addresses, "relay agent seen");
            }
        }
        debug!(%cluster_id, %agent_id, "heartbeat recorded");
    }

    /// Hosts in `cluster_id` whose last poll is within the stale timeout,
    /// ordered by agent id.
    pub fn available_agents(&self, cluster_id: &str) -> Vec<RelayAgentInfo> {
        let now = self.clock.now_ms();
        let stale = self.stale_timeout_ms.load(Ordering::Relaxed);
        let agents = self.agents.lock().expect("agents lock");

        let mut available: Vec<RelayAgentInfo> = agents
            .get(cluster_id)
            .map(|cluster| {
                cluster
                    .values()
                    .filter(|a| now.saturating_sub(a.last_heartbeat_ms) <= stale)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        available.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        available
    }

    /// Forget hosts that have gone stale. Returns how many were dropped.
    pub fn reap_stale(&self) -> usize {
        let now = self.clock.now_ms();
        let stale = self.stale_timeout_ms.load(Ordering::Relaxed);
        let mut agents = self.agents.lock().expect("agents lock");

        let mut reaped = 0;
        for (cluster_id, cluster) in agents.iter_mut() {
            cluster.retain(|agent_id, a| {
                let alive = now.saturating_sub(a.last_heartbeat_ms) <= stale;
                if !alive {
                    info!(%cluster_id, %agent_id, "reaped stale relay agent");
                    reaped += 1;
                }
                alive
            });
        }
        agents.retain(|_, cluster| !cluster.is_empty());
        reaped
    }
}
