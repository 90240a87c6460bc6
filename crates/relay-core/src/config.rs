//! relay.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub ports: PortPoolConfig,
    /// CAS retries per add/remove before giving up with a conflict error.
    pub num_retries: u32,
    /// Longest a caught-up poll is held open.
    pub long_poll_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Agents silent for longer than this are no longer reported as available.
    pub stale_timeout_ms: u64,
    /// How often the notifier re-reads the shared store for changes made by
    /// other replicas.
    pub store_refresh_interval_ms: u64,
    /// Delay before a relay host re-polls after a failed request.
    pub error_cooldown_ms: u64,
    /// redb file holding the mapping table. In-memory when absent.
    pub state_path: Option<PathBuf>,
    /// Where the relay host writes the generated ruleset.
    pub ruleset_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPoolConfig {
    pub min_port: u16,
    pub max_port: u16,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            min_port: 10000,
            max_port: 20000,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ports: PortPoolConfig::default(),
            num_retries: 5,
            long_poll_timeout_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            stale_timeout_ms: 30_000,
            store_refresh_interval_ms: 1_000,
            error_cooldown_ms: 5_000,
            state_path: None,
            ruleset_path: None,
        }
    }
}

impl RelayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ports.min_port > self.ports.max_port {
            anyhow::bail!(
                "port pool is empty: min_port {} > max_port {}",
                self.ports.min_port,
                self.ports.max_port
            );
        }
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be greater than zero");
        }
        if self.store_refresh_interval_ms == 0 {
            anyhow::bail!("store_refresh_interval_ms must be greater than zero");
        }
        if self.stale_timeout_ms < self.heartbeat_interval_ms {
            anyhow::bail!(
                "stale_timeout_ms ({}) must not be shorter than heartbeat_interval_ms ({})",
                self.stale_timeout_ms,
                self.heartbeat_interval_ms
            );
        }
        Ok(())
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn store_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.store_refresh_interval_ms)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }
}
