//! Shared domain types for the Agent Relay.
//!
//! A cluster is an isolation domain: relay ports are unique within one
//! cluster only. Each [`PortMapping`] belongs to a lease and lives exactly as
//! long as that lease does.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Isolation domain for port mappings.
pub type ClusterId = String;

/// Identifier of the agent task that owns a mapping.
pub type LeaseId = String;

/// Identifier a relay agent reports when polling.
pub type AgentId = String;

/// Errors raised when a mapping or request field is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("lease id must not be empty")]
    EmptyLeaseId,

    #[error("cluster id must not be empty")]
    EmptyClusterId,

    #[error("invalid agent ip address: {0}")]
    InvalidAgentIp(String),

    #[error("invalid source address: {0}")]
    InvalidSourceAddress(String),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("agent port must be non-zero")]
    ZeroAgentPort,

    #[error("a port mapping needs at least one port")]
    NoPorts,
}

// ── Protocol ──────────────────────────────────────────────────────

/// Transport protocol forwarded by a relay port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Lower-case protocol name, as used in firewall rules.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(ValidationError::UnknownProtocol(s.to_string())),
        }
    }
}

// ── Ports and mappings ────────────────────────────────────────────

/// One forwarded port of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub protocol: Protocol,
    /// The real port on the agent.
    pub agent_port: u16,
    /// Public port on the relay. `None` until allocated.
    pub relay_port: Option<u16>,
}

impl Port {
    /// An unallocated port request.
    pub fn new(protocol: Protocol, agent_port: u16) -> Self {
        Self {
            protocol,
            agent_port,
            relay_port: None,
        }
    }
}

/// Ports forwarded for a single lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub lease_id: LeaseId,
    pub agent_ip: String,
    /// Source addresses allowed to reach the ports. Empty means unrestricted.
    #[serde(default)]
    pub allowed_source_ips: BTreeSet<String>,
    pub ports: Vec<Port>,
}

impl PortMapping {
    /// Check the mapping is well formed before it is stored.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.lease_id.trim().is_empty() {
            return Err(ValidationError::EmptyLeaseId);
        }
        if self.agent_ip.parse::<IpAddr>().is_err() {
            return Err(ValidationError::InvalidAgentIp(self.agent_ip.clone()));
        }
        for source in &self.allowed_source_ips {
            if !is_valid_source(source) {
                return Err(ValidationError::InvalidSourceAddress(source.clone()));
            }
        }
        if self.ports.is_empty() {
            return Err(ValidationError::NoPorts);
        }
        if self.ports.iter().any(|p| p.agent_port == 0) {
            return Err(ValidationError::ZeroAgentPort);
        }
        Ok(())
    }

    /// Relay ports assigned to this mapping.
    pub fn relay_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().filter_map(|p| p.relay_port)
    }
}

/// Accepts a bare address or `address/prefix` with a prefix that fits the family.
fn is_valid_source(source: &str) -> bool {
    match source.split_once('/') {
        Some((addr, prefix)) => {
            let Ok(addr) = addr.parse::<IpAddr>() else {
                return false;
            };
            let max = if addr.is_ipv4() { 32 } else { 128 };
            prefix.parse::<u8>().is_ok_and(|p| p <= max)
        }
        None => source.parse::<IpAddr>().is_ok(),
    }
}

// ── Cluster state ─────────────────────────────────────────────────

/// Canonical mapping table of one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Starts at 0, incremented once per successful mutation.
    pub revision: u64,
    pub mappings: BTreeMap<LeaseId, PortMapping>,
}

impl ClusterState {
    /// Relay ports in use by every mapping except `except`.
    pub fn used_relay_ports(&self, except: Option<&str>) -> HashSet<u16> {
        self.mappings
            .values()
            .filter(|m| Some(m.lease_id.as_str()) != except)
            .flat_map(|m| m.relay_ports())
            .collect()
    }

    /// Mappings in lease order.
    pub fn mapping_list(&self) -> Vec<PortMapping> {
        self.mappings.values().cloned().collect()
    }
}

// ── Relay agents ──────────────────────────────────────────────────

/// A relay host as seen through its polling traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAgentInfo {
    pub agent_id: AgentId,
    pub ip_addresses: Vec<String>,
    /// Unix timestamp (milliseconds) of the last poll.
    pub last_heartbeat_ms: u64,
}
