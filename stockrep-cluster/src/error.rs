//! Error types for replica operations.

use crate::types::NodeId;
use thiserror::Error;

/// Result type for replica operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Errors that can occur in replica operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Malformed client input, rejected before any lock or network action.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No state arrived from the donor before the deadline.
    #[error("State transfer timed out after {timeout_ms}ms")]
    StateTransferTimeout {
        /// The configured bound.
        timeout_ms: u64,
    },

    /// The donor answered but the state could not be installed.
    #[error("State transfer failed: {0}")]
    StateTransfer(String),

    /// The distributed lock was not granted within the configured bound.
    #[error("Timed out acquiring lock '{name}'")]
    LockTimeout {
        /// Lock name.
        name: String,
    },

    /// Distributed lock protocol error.
    #[error("Lock error: {0}")]
    Lock(String),

    /// This member has not finished joining and does not serve requests yet.
    #[error("Node {0} is not ready")]
    NotReady(NodeId),

    /// Network/RPC error.
    #[error("Network error: {0}")]
    Network(#[from] tonic::Status),

    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Node not found in the current view.
    #[error("Node {0} not found in view")]
    NodeNotFound(NodeId),

    /// The transport has been shut down.
    #[error("Transport is shut down")]
    Shutdown,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for ClusterError {
    fn from(e: toml::de::Error) -> Self {
        ClusterError::Config(e.to_string())
    }
}

impl ClusterError {
    /// Whether the error was caused by bad client input.
    pub fn is_input_error(&self) -> bool {
        matches!(self, ClusterError::InvalidInput(_))
    }
}
