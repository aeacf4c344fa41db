//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::Value;

use covalue_core::{CoId, ListEdit, MapEdit};

/// Generate a random CoId.
pub fn co_id() -> impl Strategy<Value = CoId> {
    any::<[u8; 32]>().prop_map(CoId)
}

/// Generate a JSON scalar.
pub fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
    ]
}

/// Generate a map key from a small alphabet, so edits collide.
pub fn map_key() -> impl Strategy<Value = String> {
    "[a-d]".prop_map(String::from)
}

/// One edit to a shared map, made on node `node`.
#[derive(Debug, Clone)]
pub enum MapOp {
    Set { node: usize, key: String, value: Value },
    Delete { node: usize, key: String },
}

impl MapOp {
    pub fn node(&self) -> usize {
        match self {
            MapOp::Set { node, .. } | MapOp::Delete { node, .. } => *node,
        }
    }

    pub fn edit(&self) -> MapEdit {
        match self {
            MapOp::Set { key, value, .. } => MapEdit::new().set(key.clone(), value.clone()),
            MapOp::Delete { key, .. } => MapEdit::new().delete(key.clone()),
        }
    }
}

/// Generate up to `max` map edits spread over `nodes` nodes.
pub fn map_ops(nodes: usize, max: usize) -> impl Strategy<Value = Vec<MapOp>> {
    let op = prop_oneof![
        4 => (0..nodes, map_key(), json_scalar())
            .prop_map(|(node, key, value)| MapOp::Set { node, key, value }),
        1 => (0..nodes, map_key()).prop_map(|(node, key)| MapOp::Delete { node, key }),
    ];
    prop::collection::vec(op, 1..=max)
}

/// One edit to a shared list. Indices are reduced modulo the list length
/// when applied.
#[derive(Debug, Clone)]
pub enum ListOp {
    Push { node: usize, value: Value },
    Insert { node: usize, index: usize, value: Value },
    Delete { node: usize, index: usize },
}

impl ListOp {
    pub fn node(&self) -> usize {
        match self {
            ListOp::Push { node, .. } | ListOp::Insert { node, .. } | ListOp::Delete { node, .. } => {
                *node
            }
        }
    }

    /// Apply to `edit`, skipping deletes on an empty list.
    pub fn apply(&self, edit: &mut ListEdit) -> Result<(), covalue_core::CoreError> {
        match self {
            ListOp::Push { value, .. } => {
                edit.push(value.clone());
            }
            ListOp::Insert { index, value, .. } => {
                let index = index % (edit.len() + 1);
                edit.insert(index, value.clone())?;
            }
            ListOp::Delete { index, .. } => {
                if !edit.is_empty() {
                    edit.delete(index % edit.len())?;
                }
            }
        }
        Ok(())
    }
}

/// Generate up to `max` list edits spread over `nodes` nodes.
pub fn list_ops(nodes: usize, max: usize) -> impl Strategy<Value = Vec<ListOp>> {
    let op = prop_oneof![
        3 => (0..nodes, json_scalar()).prop_map(|(node, value)| ListOp::Push { node, value }),
        2 => (0..nodes, any::<usize>(), json_scalar())
            .prop_map(|(node, index, value)| ListOp::Insert { node, index, value }),
        1 => (0..nodes, any::<usize>()).prop_map(|(node, index)| ListOp::Delete { node, index }),
    ];
    prop::collection::vec(op, 1..=max)
}
