//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored header or transaction could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] covalue_core::CoreError),

    /// Transactions were appended for a CoValue whose header is not stored.
    #[error("no header stored for {0}")]
    MissingHeader(String),

    /// A different header is already stored under this id.
    #[error("header conflict for {0}")]
    HeaderConflict(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The blocking worker failed.
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
