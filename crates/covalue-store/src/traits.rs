//! Storage trait: the abstract interface for CoValue persistence.
//!
//! A store is a replica, not a validator. It keeps headers and per-session
//! transaction runs exactly as they were received; signatures and permissions
//! are checked again by whichever node loads the data back.

use async_trait::async_trait;
use std::collections::BTreeMap;

use covalue_core::{CoId, Header, KnownState, SessionId, Signature, Transaction};

use crate::error::Result;

/// One session's stored transactions.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub transactions: Vec<Transaction>,
    /// Signature over the rolling hash of all `transactions`.
    pub last_signature: Signature,
}

/// Everything stored for one CoValue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCoValue {
    pub id: CoId,
    pub header: Header,
    pub sessions: BTreeMap<SessionId, StoredSession>,
}

impl StoredCoValue {
    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: true,
            sessions: self
                .sessions
                .iter()
                .map(|(session, stored)| (*session, stored.transactions.len()))
                .collect(),
        }
    }
}

/// Result of appending a run of transactions to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// `added` new transactions were stored.
    Appended { added: usize },
    /// Every transaction in the run was already stored.
    AlreadyKnown,
    /// The run starts past the stored tip; nothing was stored.
    Gap { held: usize },
}

/// The Storage trait: async interface for CoValue persistence.
///
/// # Design Notes
///
/// - **Idempotent appends**: re-appending a stored run returns `AlreadyKnown`,
///   and a run overlapping the stored tip only stores the new suffix.
/// - **No gaps**: a run starting beyond the tip is refused with `Gap`, so the
///   caller can send a corrected known state.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load everything stored for `id`.
    async fn load(&self, id: &CoId) -> Result<Option<StoredCoValue>>;

    /// Store a header. Returns `true` if it was not stored before.
    async fn store_header(&self, id: &CoId, header: &Header) -> Result<bool>;

    /// Append transactions to a session, starting at position `after`.
    async fn append_transactions(
        &self,
        id: &CoId,
        session: &SessionId,
        after: usize,
        transactions: &[Transaction],
        last_signature: &Signature,
    ) -> Result<AppendResult>;

    /// What is stored for `id`, as a known state.
    async fn known_state(&self, id: &CoId) -> Result<KnownState>;

    /// Ids of every stored CoValue.
    async fn list_ids(&self) -> Result<Vec<CoId>>;
}

/// Decide what part of a run to store given `held` stored transactions.
pub(crate) fn plan_append(held: usize, after: usize, len: usize) -> std::result::Result<usize, AppendResult> {
    if after > held {
        return Err(AppendResult::Gap { held });
    }
    if after + len <= held {
        return Err(AppendResult::AlreadyKnown);
    }
    Ok(held - after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_append() {
        assert_eq!(plan_append(0, 0, 3), Ok(0));
        assert_eq!(plan_append(2, 1, 3), Ok(1));
        assert_eq!(plan_append(3, 0, 3), Err(AppendResult::AlreadyKnown));
        assert_eq!(plan_append(3, 5, 1), Err(AppendResult::Gap { held: 3 }));
        assert_eq!(plan_append(3, 3, 0), Err(AppendResult::AlreadyKnown));
    }
}
