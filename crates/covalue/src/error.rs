//! Error types for the node.

use covalue_core::{CoId, CoValueKind, CoreError, ValidationError};
use covalue_perms::PermsError;
use covalue_store::StoreError;
use covalue_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// An id was empty or not a well-formed `co_z…`.
    #[error("invalid CoValue id {id:?}: {reason}")]
    InvalidId { id: String, reason: String },

    /// The CoValue is not resident on this node.
    #[error("CoValue not found: {0}")]
    NotFound(CoId),

    /// No reachable peer had the CoValue.
    #[error("CoValue {id} unavailable (at {})", display_path(.path))]
    Unavailable { id: CoId, path: Vec<String> },

    /// The CoValue is resident but this agent may not read it.
    #[error("not authorized to read {id} (at {})", display_path(.path))]
    Unauthorized { id: CoId, path: Vec<String> },

    /// The local agent lacks the role for a group operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The CoValue exists but has another kind.
    #[error("{id} is a {actual:?}, expected {expected:?}")]
    WrongKind {
        id: CoId,
        expected: CoValueKind,
        actual: CoValueKind,
    },

    /// The operation was cancelled, or the node shut down.
    #[error("cancelled")]
    Cancelled,

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Permission engine error.
    #[error("permission error: {0}")]
    Perms(#[from] PermsError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
}

fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        "root".to_string()
    } else {
        path.join(".")
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
