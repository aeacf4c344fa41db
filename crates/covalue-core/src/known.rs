//! Known state: the per-CoValue sync cursor.
//!
//! `sessions` maps each session to the number of transactions held for it.
//! A content message's `after` for a session is the receiver's count.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{CoId, SessionId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoId,
    pub header: bool,
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, usize>,
}

impl KnownState {
    /// Nothing known about `id`.
    pub fn empty(id: CoId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Transactions held for `session`.
    pub fn count(&self, session: &SessionId) -> usize {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Total transactions across sessions.
    pub fn total(&self) -> usize {
        self.sessions.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        !self.header && self.sessions.values().all(|n| *n == 0)
    }

    /// Record that `session` holds at least `count` transactions.
    pub fn advance(&mut self, session: SessionId, count: usize) {
        let entry = self.sessions.entry(session).or_insert(0);
        if count > *entry {
            *entry = count;
        }
    }

    /// Pointwise maximum with `other`. Never moves a cursor backwards.
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, count) in &other.sessions {
            self.advance(*session, *count);
        }
    }

    /// Whether everything known here is also known in `other`.
    pub fn is_subset_of(&self, other: &KnownState) -> bool {
        (!self.header || other.header)
            && self
                .sessions
                .iter()
                .all(|(session, count)| *count <= other.count(session))
    }

    /// Sessions where `self` is ahead of `other`, with `other`'s count.
    pub fn sessions_ahead_of<'a>(
        &'a self,
        other: &'a KnownState,
    ) -> impl Iterator<Item = (SessionId, usize)> + 'a {
        self.sessions.iter().filter_map(move |(session, count)| {
            let theirs = other.count(session);
            (*count > theirs).then_some((*session, theirs))
        })
    }
}
