//! Error types for the permissions module.

use thiserror::Error;

/// Errors that can occur during permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The ruleset does not describe a group.
    #[error("not a group: {0}")]
    NotAGroup(String),

    /// No read key is available to the caller.
    #[error("no usable read key: {0}")]
    NoReadKey(String),

    /// A ledger entry could not be interpreted.
    #[error("invalid ledger entry: {0}")]
    InvalidLedgerEntry(String),

    /// Encryption error.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Core error.
    #[error("core error: {0}")]
    CoreError(#[from] covalue_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
