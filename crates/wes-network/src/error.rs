//! Network error types

use crate::peer::PeerId;
use thiserror::Error;

/// Errors that can occur in the network layer.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Message encoding/decoding error
    #[error("codec error: {0}")]
    Codec(String),

    /// Request timed out
    #[error("request to {peer} on {protocol} timed out")]
    Timeout {
        /// Target peer
        peer: PeerId,
        /// Protocol the request was sent on
        protocol: String,
    },

    /// Peer cannot be reached
    #[error("peer unreachable: {0}")]
    Unreachable(PeerId),

    /// Peer not found in the connection set
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Remote answered with a protocol-level error
    #[error("remote error from {peer}: {message}")]
    Remote {
        /// Responding peer
        peer: PeerId,
        /// Error string carried on the wire
        message: String,
    },

    /// Channel send error
    #[error("channel send error")]
    ChannelSend,

    /// Service not running
    #[error("service not running")]
    NotRunning,
}

impl NetworkError {
    /// Whether a retry against the same or another peer is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetworkError::Io(_)
                | NetworkError::Timeout { .. }
                | NetworkError::Unreachable(_)
                | NetworkError::PeerNotFound(_)
        )
    }

    /// Whether the error was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetworkError::Timeout { .. })
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
