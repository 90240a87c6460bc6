//! relay-server — the Agent Relay control plane service.
//!
//! # Architecture
//!
//! ```text
//! RelayService
//!   ├── MappingTable (relay-state)   add / remove / snapshot, CAS + retry
//!   ├── ChangeNotifier               per-cluster watch channels, long-poll
//!   └── LivenessTracker (relay-cluster)  heartbeat from every poll
//!
//! RelayAgent (runs on each relay host)
//!   ├── polls GetPortMappings with its last-seen revision
//!   ├── diffs mappings against its local table
//!   └── writes the nftables ruleset (relay-nat)
//! ```
//!
//! Transport is left to the embedding process: the request and response
//! types in [`api`] are plain serde structs.

pub mod agent;
pub mod api;
pub mod error;
pub mod notifier;
pub mod service;

pub use agent::{AgentConfig, MappingDiff, MappingSource, RelayAgent};
pub use api::*;
pub use error::{CancelReason, RelayError, RelayResult};
pub use notifier::ChangeNotifier;
pub use service::RelayService;
