//! relay-state — the shared port-mapping table for the Agent Relay.
//!
//! # Architecture
//!
//! Each cluster's [`ClusterState`](relay_core::ClusterState) is stored as a
//! single record. Every mutation replaces that record through a
//! compare-and-swap on its revision, so readers never see a mapping with
//! only some of its ports assigned and concurrent writers (threads or
//! replicas sharing one store) resolve conflicts by retrying.
//!
//! - [`MappingStore`] is the storage seam (CAS on a cluster record).
//! - [`MemoryMappingStore`] and [`RedbMappingStore`] implement it.
//! - [`MappingTable`] allocates relay ports and drives the retry loop.

pub mod allocator;
pub mod error;
pub mod mappings;
pub mod store;
pub mod tables;

pub use allocator::find_range;
pub use error::{StateError, StateResult};
pub use mappings::{LeaseRemoval, MappingTable, MappingUpdate};
pub use store::{MappingStore, MemoryMappingStore, RedbMappingStore};
