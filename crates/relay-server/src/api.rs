//! Request and response types of the relay service surface.

use serde::{Deserialize, Serialize};

use relay_core::{ClusterId, PortMapping};

/// A relay host's poll for the mapping table. Doubles as its heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPortMappingsRequest {
    pub cluster_id: ClusterId,
    pub agent_id: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    /// Last revision the caller has seen. Equal to the live revision means
    /// "wait for a change"; any other value returns immediately.
    pub revision: i64,
    /// Longest the caller wants to wait. Capped by the server's limit.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPortMappingsResponse {
    pub revision: u64,
    pub port_mappings: Vec<PortMapping>,
}

/// A port to forward, before a relay port is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// `tcp` or `udp`, case-insensitive.
    pub protocol: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPortMappingRequest {
    pub cluster_id: ClusterId,
    pub lease_id: String,
    /// When set, only this source address may reach the mapping.
    #[serde(default)]
    pub client_ip: Option<String>,
    pub agent_ip: String,
    pub ports: Vec<PortSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPortMappingResponse {
    pub revision: u64,
    pub port_mapping: PortMapping,
}
