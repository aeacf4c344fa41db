//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A frame could not be decoded into a message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A message could not be encoded.
    #[error("encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The peer closed, or was replaced, before the operation finished.
    #[error("peer closed: {0}")]
    PeerClosed(String),

    /// Timeout waiting for a peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Peer is not connected.
    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
