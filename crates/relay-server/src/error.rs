//! Error types for the relay service.

use std::fmt;

use relay_core::ValidationError;
use relay_state::StateError;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

/// Why a long poll ended without new data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's wait window elapsed with the cluster unchanged.
    Timeout,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout => f.write_str("timed out"),
            CancelReason::Shutdown => f.write_str("server shutting down"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("long poll cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("ruleset write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the caller should retry the whole call.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::State(e) => e.is_transient(),
            RelayError::Cancelled(CancelReason::Timeout) => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled(_))
    }
}
