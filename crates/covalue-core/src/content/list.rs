//! List content: insertions anchored on other insertions.
//!
//! Every insertion names a reference op: `app` inserts after it (or after the
//! start), `pre` inserts before it (or before the end). The insertions form a
//! tree rooted at the two sentinels. The list is read by walking that tree:
//! a node's before-children in ascending op order, then the node, then its
//! after-children in descending op order. The newest concurrent insert at the
//! same anchor therefore sits closest to it.
//!
//! Deleted insertions stay in the tree as anchors. Insertions that reference
//! an op this replica never saw are unreachable and do not appear.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::ApplyChanges;
use crate::error::CoreError;
use crate::transaction::DecodedTransaction;
use crate::types::OpId;

/// Reference to a list position in a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpRef {
    /// The start sentinel (only valid for `app`).
    Start,
    /// The end sentinel (only valid for `pre`).
    End,
    /// An insertion from any transaction.
    Op(OpId),
    /// An insertion earlier in the same transaction, by change index.
    Local(u32),
}

impl OpRef {
    fn resolve(self, tx: &DecodedTransaction) -> Option<OpId> {
        match self {
            OpRef::Op(op) => Some(op),
            OpRef::Local(change) => Some(OpId::new(tx.session, tx.tx_index, change)),
            OpRef::Start | OpRef::End => None,
        }
    }
}

impl fmt::Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpRef::Start => f.write_str("start"),
            OpRef::End => f.write_str("end"),
            OpRef::Op(op) => write!(f, "{op}"),
            OpRef::Local(change) => write!(f, "~{change}"),
        }
    }
}

impl FromStr for OpRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(OpRef::Start),
            "end" => Ok(OpRef::End),
            _ => match s.strip_prefix('~') {
                Some(change) => change
                    .parse()
                    .map(OpRef::Local)
                    .map_err(|_| CoreError::MalformedChange(format!("bad local ref: {s}"))),
                None => s.parse().map(OpRef::Op),
            },
        }
    }
}

impl Serialize for OpRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OpRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A change to a list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ListChange {
    /// Insert after `after`.
    App { value: Value, after: OpRef },
    /// Insert before `before`.
    Pre { value: Value, before: OpRef },
    /// Delete the insertion `insertion`.
    Del { insertion: OpRef },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Anchor {
    Start,
    End,
    After(OpId),
    Before(OpId),
}

#[derive(Clone, Debug, PartialEq)]
struct ListNode {
    made_at: i64,
    value: Value,
    anchor: Anchor,
}

/// One visible list element.
#[derive(Clone, Debug, PartialEq)]
pub struct ListItem<'a> {
    pub op: OpId,
    pub value: &'a Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListContent {
    nodes: BTreeMap<OpId, ListNode>,
    deleted: BTreeSet<OpId>,
}

impl ListContent {
    pub fn new() -> Self {
        Self::default()
    }

    fn order_key(&self, op: &OpId) -> (i64, OpId) {
        let made_at = self.nodes.get(op).map(|n| n.made_at).unwrap_or(i64::MIN);
        (made_at, *op)
    }

    /// Visible items in list order.
    pub fn items(&self) -> Vec<ListItem<'_>> {
        let mut children: BTreeMap<Anchor, Vec<OpId>> = BTreeMap::new();
        for (op, node) in &self.nodes {
            children.entry(node.anchor).or_default().push(*op);
        }
        for ops in children.values_mut() {
            ops.sort_by_key(|op| self.order_key(op));
        }
        let kids = |anchor: Anchor| children.get(&anchor).map(Vec::as_slice).unwrap_or(&[]);

        enum Frame {
            Visit(OpId),
            Emit(OpId),
        }

        // Roots: after-start children (descending), then before-end children
        // (ascending). Pushed in reverse so they pop in order.
        let mut stack: Vec<Frame> = Vec::new();
        for op in kids(Anchor::End).iter().rev() {
            stack.push(Frame::Visit(*op));
        }
        for op in kids(Anchor::Start) {
            stack.push(Frame::Visit(*op));
        }

        let mut items = Vec::new();
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Emit(op) => {
                    if !self.deleted.contains(&op) {
                        if let Some(node) = self.nodes.get(&op) {
                            items.push(ListItem {
                                op,
                                value: &node.value,
                            });
                        }
                    }
                }
                Frame::Visit(op) => {
                    for child in kids(Anchor::After(op)) {
                        stack.push(Frame::Visit(*child));
                    }
                    stack.push(Frame::Emit(op));
                    for child in kids(Anchor::Before(op)).iter().rev() {
                        stack.push(Frame::Visit(*child));
                    }
                }
            }
        }
        items
    }

    /// Visible values in list order.
    pub fn values(&self) -> Vec<&Value> {
        self.items().into_iter().map(|item| item.value).collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `op` names an insertion this list holds (deleted or not).
    pub fn contains_op(&self, op: &OpId) -> bool {
        self.nodes.contains_key(op)
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.values().into_iter().cloned().collect())
    }
}

impl ApplyChanges for ListContent {
    fn apply(&mut self, tx: &DecodedTransaction) {
        for (index, change) in tx.changes.iter().enumerate() {
            let op = OpId::new(tx.session, tx.tx_index, index as u32);
            let parsed = match ListChange::deserialize(change) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::debug!(op = %op, error = %e, "skipping malformed list change");
                    continue;
                }
            };

            let (value, anchor) = match parsed {
                ListChange::App { value, after } => match after {
                    OpRef::Start => (value, Anchor::Start),
                    OpRef::End => continue,
                    other => match other.resolve(tx) {
                        Some(target) => (value, Anchor::After(target)),
                        None => continue,
                    },
                },
                ListChange::Pre { value, before } => match before {
                    OpRef::End => (value, Anchor::End),
                    OpRef::Start => continue,
                    other => match other.resolve(tx) {
                        Some(target) => (value, Anchor::Before(target)),
                        None => continue,
                    },
                },
                ListChange::Del { insertion } => {
                    if let Some(target) = insertion.resolve(tx) {
                        self.deleted.insert(target);
                    }
                    continue;
                }
            };

            self.nodes.entry(op).or_insert(ListNode {
                made_at: tx.made_at,
                value,
                anchor,
            });
        }
    }
}
