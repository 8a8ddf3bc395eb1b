//! Error types for the group membership service

use std::time::Duration;

use thiserror::Error;

/// Group membership errors
#[derive(Debug, Error)]
pub enum GmsError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No tokio runtime was available when the service was built
    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    /// Operation requires a connected node
    #[error("Node is not connected to a cluster")]
    NotConnected,

    /// Connect called twice
    #[error("Node is already connected")]
    AlreadyConnected,

    /// Singleton fallback is disabled and every join attempt failed
    #[error("Cluster unreachable after {attempts} join attempts")]
    ClusterUnreachable {
        /// Join rounds attempted
        attempts: u32,
    },

    /// The join loop was stopped by a concurrent leave
    #[error("Join cancelled")]
    JoinCancelled,

    /// A bounded wait elapsed
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Elapsed bound
        timeout: Duration,
    },

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Header encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Application collaborator error
    #[error("Application error: {0}")]
    Application(String),
}

/// Result type for group membership operations
pub type GmsResult<T> = Result<T, GmsError>;

impl GmsError {
    /// Whether the failure is a transient protocol condition worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, GmsError::Timeout { .. } | GmsError::Transport(_))
    }
}
