//! Error types for the CoValue core.

use thiserror::Error;

use crate::types::SessionId;

/// Core errors that can occur while decoding or encoding primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing prefix: expected {expected}_z…")]
    MissingPrefix { expected: &'static str },

    #[error("invalid base58 payload for {prefix}: {reason}")]
    InvalidBase58 { prefix: &'static str, reason: String },

    #[error("invalid length for {prefix}: expected {expected} bytes, got {got}")]
    InvalidLength {
        prefix: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("malformed identifier: {0}")]
    MalformedId(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("malformed change: {0}")]
    MalformedChange(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors raised when remote transactions are offered to a session log.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("signature verification failed for session {session}")]
    InvalidSignature { session: SessionId },

    #[error("batch for session {session} is empty")]
    EmptyBatch { session: SessionId },

    #[error("session {session} is at {tip}, batch starts after {after}")]
    Gap {
        session: SessionId,
        tip: usize,
        after: usize,
    },

    #[error("header does not hash to the claimed id")]
    HeaderMismatch,

    #[error("structural error: {0}")]
    StructuralError(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        ValidationError::StructuralError(e.to_string())
    }
}
