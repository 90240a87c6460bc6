//! relay-cluster — which relay hosts are alive in each cluster.
//!
//! Relay hosts never register explicitly. Every mapping poll they make is
//! recorded as a heartbeat, and a host counts as available while its last
//! poll is younger than the stale timeout. Nothing here is persisted: after
//! a server restart hosts reappear on their next poll.

pub mod liveness;

pub use liveness::LivenessTracker;
