//! Firewall rules for the Agent Relay.
//!
//! # Components
//!
//! - **`rules`** — Pure translation of port mappings into nftables DNAT rules
//! - **`writer`** — Atomic, change-detecting ruleset file output

pub mod rules;
pub mod writer;

pub use rules::{generate_file, generate_rules, TABLE_NAME};
pub use writer::RulesetWriter;
