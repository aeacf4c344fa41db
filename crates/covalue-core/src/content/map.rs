//! Map content: last-writer-wins per key, with full history.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::ApplyChanges;
use crate::transaction::DecodedTransaction;
use crate::types::OpId;

/// A change to a map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MapChange {
    Set { key: String, value: Value },
    Del { key: String },
}

/// One write to a key. `value` is `None` for deletions.
#[derive(Clone, Debug, PartialEq)]
pub struct MapEntry {
    pub op: OpId,
    pub made_at: i64,
    pub value: Option<Value>,
}

impl MapEntry {
    fn order_key(&self) -> (i64, OpId) {
        (self.made_at, self.op)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapContent {
    entries: BTreeMap<String, Vec<MapEntry>>,
}

impl MapContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`, if set and not deleted.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.latest(key).and_then(|entry| entry.value.as_ref())
    }

    /// The winning write for `key`, including deletions.
    pub fn latest(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key).and_then(|history| history.last())
    }

    /// Every write to `key` in merge order.
    pub fn history(&self, key: &str) -> &[MapEntry] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Keys with a live value, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, history)| history.last().is_some_and(|e| e.value.is_some()))
            .map(|(key, _)| key.as_str())
    }

    /// Live `(key, value)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().filter_map(|(key, history)| {
            history
                .last()
                .and_then(|e| e.value.as_ref())
                .map(|v| (key.as_str(), v))
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a write. Writes are ordered by `(made_at, op)`, so insertion
    /// order does not affect the result.
    pub fn insert(&mut self, key: String, entry: MapEntry) {
        let history = self.entries.entry(key).or_default();
        match history.binary_search_by(|e| e.order_key().cmp(&entry.order_key())) {
            Ok(_) => {}
            Err(pos) => history.insert(pos, entry),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }
}

impl ApplyChanges for MapContent {
    fn apply(&mut self, tx: &DecodedTransaction) {
        for (index, change) in tx.changes.iter().enumerate() {
            let op = OpId::new(tx.session, tx.tx_index, index as u32);
            match MapChange::deserialize(change) {
                Ok(MapChange::Set { key, value }) => self.insert(
                    key,
                    MapEntry {
                        op,
                        made_at: tx.made_at,
                        value: Some(value),
                    },
                ),
                Ok(MapChange::Del { key }) => self.insert(
                    key,
                    MapEntry {
                        op,
                        made_at: tx.made_at,
                        value: None,
                    },
                ),
                Err(e) => {
                    tracing::debug!(op = %op, error = %e, "skipping malformed map change");
                }
            }
        }
    }
}
