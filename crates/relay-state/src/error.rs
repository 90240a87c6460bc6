//! Error types for the mapping store.

use relay_core::ValidationError;
use thiserror::Error;

/// Result type alias for mapping store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during mapping store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("cluster {cluster_id} has no free range of {requested} ports")]
    OutOfPorts { cluster_id: String, requested: usize },

    #[error("cluster {cluster_id} changed concurrently; gave up after {attempts} attempts")]
    ConcurrentModification { cluster_id: String, attempts: u32 },

    #[error("invalid port mapping: {0}")]
    Invalid(#[from] ValidationError),
}

impl StateError {
    /// Whether retrying the whole call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::ConcurrentModification { .. })
    }
}
