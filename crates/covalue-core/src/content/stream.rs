//! Stream content: each session appends to its own feed.

use serde_json::Value;
use std::collections::BTreeMap;

use super::ApplyChanges;
use crate::transaction::DecodedTransaction;
use crate::types::{OpId, SessionId};

#[derive(Clone, Debug, PartialEq)]
pub struct StreamItem {
    pub op: OpId,
    pub made_at: i64,
    pub value: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamContent {
    feeds: BTreeMap<SessionId, Vec<StreamItem>>,
}

impl StreamContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items pushed by `session`, in push order.
    pub fn items(&self, session: &SessionId) -> &[StreamItem] {
        self.feeds.get(session).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The most recent item of `session`.
    pub fn latest(&self, session: &SessionId) -> Option<&StreamItem> {
        self.feeds.get(session).and_then(|feed| feed.last())
    }

    /// Sessions that pushed at least one item.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.feeds.keys()
    }

    pub fn len(&self) -> usize {
        self.feeds.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.feeds
                .iter()
                .map(|(session, feed)| {
                    (
                        session.to_string(),
                        Value::Array(feed.iter().map(|item| item.value.clone()).collect()),
                    )
                })
                .collect(),
        )
    }
}

impl ApplyChanges for StreamContent {
    fn apply(&mut self, tx: &DecodedTransaction) {
        let feed = self.feeds.entry(tx.session).or_default();
        for (index, value) in tx.changes.iter().enumerate() {
            let item = StreamItem {
                op: OpId::new(tx.session, tx.tx_index, index as u32),
                made_at: tx.made_at,
                value: value.clone(),
            };
            match feed.binary_search_by(|existing| existing.op.cmp(&item.op)) {
                Ok(_) => {}
                Err(pos) => feed.insert(pos, item),
            }
        }
    }
}
