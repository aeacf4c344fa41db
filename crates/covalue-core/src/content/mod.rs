//! Deterministic content merge.
//!
//! Content is a pure function of the set of valid, readable transactions.
//! Transactions are replayed in `(made_at, session, tx_index)` order and each
//! kind applies its own operation semantics through [`ApplyChanges`].

pub mod edit;
pub mod list;
pub mod map;
pub mod stream;

use serde_json::Value;

use crate::header::CoValueKind;
use crate::transaction::{sort_for_merge, DecodedTransaction};

pub use edit::{ListEdit, MapEdit, StreamEdit};
pub use list::{ListChange, ListContent, ListItem, OpRef};
pub use map::{MapChange, MapContent, MapEntry};
pub use stream::{StreamContent, StreamItem};

/// Apply the changes of one transaction to merged content.
///
/// Malformed changes are skipped; they never abort the rest of the merge.
pub trait ApplyChanges {
    fn apply(&mut self, tx: &DecodedTransaction);
}

/// Merged content of a CoValue, by kind.
#[derive(Clone, Debug, PartialEq)]
pub enum CoValueContent {
    Map(MapContent),
    List(ListContent),
    Stream(StreamContent),
    /// A group's ledger, as a map of its valid entries.
    Group(MapContent),
}

impl CoValueContent {
    /// Empty content for `kind`.
    pub fn empty(kind: CoValueKind) -> Self {
        match kind {
            CoValueKind::Map => CoValueContent::Map(MapContent::new()),
            CoValueKind::List => CoValueContent::List(ListContent::new()),
            CoValueKind::Stream => CoValueContent::Stream(StreamContent::new()),
            CoValueKind::Group => CoValueContent::Group(MapContent::new()),
        }
    }

    /// Replay `transactions` in merge order.
    pub fn from_transactions(kind: CoValueKind, mut transactions: Vec<DecodedTransaction>) -> Self {
        sort_for_merge(&mut transactions);
        let mut content = Self::empty(kind);
        for tx in &transactions {
            content.apply(tx);
        }
        content
    }

    pub fn kind(&self) -> CoValueKind {
        match self {
            CoValueContent::Map(_) => CoValueKind::Map,
            CoValueContent::List(_) => CoValueKind::List,
            CoValueContent::Stream(_) => CoValueKind::Stream,
            CoValueContent::Group(_) => CoValueKind::Group,
        }
    }

    pub fn as_map(&self) -> Option<&MapContent> {
        match self {
            CoValueContent::Map(map) | CoValueContent::Group(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListContent> {
        match self {
            CoValueContent::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamContent> {
        match self {
            CoValueContent::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// Plain JSON view, for comparisons and display.
    pub fn to_json(&self) -> Value {
        match self {
            CoValueContent::Map(map) | CoValueContent::Group(map) => map.to_json(),
            CoValueContent::List(list) => list.to_json(),
            CoValueContent::Stream(stream) => stream.to_json(),
        }
    }
}

impl ApplyChanges for CoValueContent {
    fn apply(&mut self, tx: &DecodedTransaction) {
        match self {
            CoValueContent::Map(map) | CoValueContent::Group(map) => map.apply(tx),
            CoValueContent::List(list) => list.apply(tx),
            CoValueContent::Stream(stream) => stream.apply(tx),
        }
    }
}
