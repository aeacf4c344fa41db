//! Transactions: atomic, signed batches of changes.

use serde::{Deserialize, Serialize};

use crate::crypto::{Encrypted, KeyId};
use crate::error::CoreError;
use crate::types::SessionId;

/// Whether a transaction's changes travel in the clear or encrypted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Trusting,
    Private,
}

/// One atomic batch of changes in a session.
///
/// `changes` is the JSON text of the change array, kept verbatim so that the
/// bytes that were signed are the bytes that are stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "camelCase")]
pub enum Transaction {
    Trusting {
        #[serde(rename = "madeAt")]
        made_at: i64,
        changes: String,
    },
    Private {
        #[serde(rename = "madeAt")]
        made_at: i64,
        #[serde(rename = "keyUsed")]
        key_used: KeyId,
        #[serde(rename = "encryptedChanges")]
        encrypted_changes: Encrypted,
    },
}

impl Transaction {
    /// Build a trusting transaction from a list of changes.
    pub fn trusting(made_at: i64, changes: &[serde_json::Value]) -> Result<Self, CoreError> {
        Ok(Transaction::Trusting {
            made_at,
            changes: encode_changes(changes)?,
        })
    }

    /// When the author made this transaction (Unix milliseconds).
    pub fn made_at(&self) -> i64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => {
                *made_at
            }
        }
    }

    pub fn privacy(&self) -> Privacy {
        match self {
            Transaction::Trusting { .. } => Privacy::Trusting,
            Transaction::Private { .. } => Privacy::Private,
        }
    }

    /// The read key a private transaction was encrypted under.
    pub fn key_used(&self) -> Option<&KeyId> {
        match self {
            Transaction::Private { key_used, .. } => Some(key_used),
            Transaction::Trusting { .. } => None,
        }
    }

    /// Parse the changes of a trusting transaction.
    ///
    /// Returns `None` for private transactions; those need a read key first.
    pub fn trusting_changes(&self) -> Option<Result<Vec<serde_json::Value>, CoreError>> {
        match self {
            Transaction::Trusting { changes, .. } => Some(decode_changes(changes.as_bytes())),
            Transaction::Private { .. } => None,
        }
    }
}

/// Serialize a change list to JSON text.
pub fn encode_changes(changes: &[serde_json::Value]) -> Result<String, CoreError> {
    serde_json::to_string(changes).map_err(|e| CoreError::EncodingError(e.to_string()))
}

/// Parse a change list from JSON bytes.
pub fn decode_changes(bytes: &[u8]) -> Result<Vec<serde_json::Value>, CoreError> {
    serde_json::from_slice(bytes).map_err(|e| CoreError::MalformedChange(e.to_string()))
}

/// A transaction whose changes are readable, positioned in its session.
///
/// This is the input of every merge.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedTransaction {
    pub session: SessionId,
    pub tx_index: u32,
    pub made_at: i64,
    pub changes: Vec<serde_json::Value>,
}

impl DecodedTransaction {
    /// Merge order: `(made_at, session, tx_index)`.
    pub fn order_key(&self) -> (i64, SessionId, u32) {
        (self.made_at, self.session, self.tx_index)
    }
}

/// Sort decoded transactions into merge order.
pub fn sort_for_merge(txs: &mut [DecodedTransaction]) {
    txs.sort_by_key(|tx| tx.order_key());
}
