//! Errors surfaced by registry and peering operations.

use crate::mac::MacAddr;

/// Failure of a registry or peering operation. Nothing here is fatal to the controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("{0} already exists")]
    AlreadyExists(MacAddr),
    #[error("{0} not found")]
    NotFound(MacAddr),
    #[error("{0} is full")]
    CapacityExceeded(&'static str),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("radio transport: {0}")]
    Transport(String),
    #[error("storage: {0}")]
    Storage(String),
}

impl PeerError {
    /// Stable machine-readable name, used in control replies.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerError::InvalidArgument(_) => "invalid_argument",
            PeerError::InvalidState(_) => "invalid_state",
            PeerError::AlreadyExists(_) => "already_exists",
            PeerError::NotFound(_) => "not_found",
            PeerError::CapacityExceeded(_) => "capacity_exceeded",
            PeerError::Timeout(_) => "timeout",
            PeerError::Transport(_) => "transport",
            PeerError::Storage(_) => "storage",
        }
    }
}

pub type PeerResult<T> = Result<T, PeerError>;
