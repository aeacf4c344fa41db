//! Explicit command builders that produce change lists.
//!
//! Builders never touch content; they only describe the changes of one
//! transaction. Hand the result to `make_transaction`.

use serde_json::Value;

use super::list::{ListChange, ListContent, OpRef};
use super::map::MapChange;
use crate::error::CoreError;

fn to_value<T: serde::Serialize>(change: T) -> Value {
    // change enums hold only strings and JSON values
    serde_json::to_value(change).unwrap_or(Value::Null)
}

/// Changes for a map.
#[derive(Clone, Debug, Default)]
pub struct MapEdit {
    changes: Vec<Value>,
}

impl MapEdit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.push(to_value(MapChange::Set {
            key: key.into(),
            value: value.into(),
        }));
        self
    }

    /// Delete `key`.
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.changes
            .push(to_value(MapChange::Del { key: key.into() }));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<Value> {
        self.changes
    }
}

/// Changes for a list, addressed by index into a snapshot.
///
/// The builder keeps its own view of the list so that several edits in one
/// transaction compose: a second `push` lands after the first.
#[derive(Clone, Debug)]
pub struct ListEdit {
    view: Vec<OpRef>,
    changes: Vec<Value>,
}

impl ListEdit {
    /// Start editing the visible state of `list`.
    pub fn new(list: &ListContent) -> Self {
        Self {
            view: list.items().into_iter().map(|item| OpRef::Op(item.op)).collect(),
            changes: Vec::new(),
        }
    }

    /// Start editing an empty list.
    pub fn empty() -> Self {
        Self {
            view: Vec::new(),
            changes: Vec::new(),
        }
    }

    /// Length of the list as this builder sees it.
    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    fn next_ref(&self) -> OpRef {
        OpRef::Local(self.changes.len() as u32)
    }

    fn out_of_range(&self, index: usize) -> CoreError {
        CoreError::MalformedChange(format!(
            "index {index} out of range for list of length {}",
            self.view.len()
        ))
    }

    /// Insert after an explicit reference.
    pub fn append(&mut self, after: OpRef, value: impl Into<Value>) -> &mut Self {
        let inserted = self.next_ref();
        let position = match after {
            OpRef::Start => Some(0),
            other => self.view.iter().position(|r| *r == other).map(|p| p + 1),
        };
        self.changes.push(to_value(ListChange::App {
            value: value.into(),
            after,
        }));
        if let Some(position) = position {
            self.view.insert(position, inserted);
        }
        self
    }

    /// Insert before an explicit reference.
    pub fn prepend(&mut self, before: OpRef, value: impl Into<Value>) -> &mut Self {
        let inserted = self.next_ref();
        let position = match before {
            OpRef::End => Some(self.view.len()),
            other => self.view.iter().position(|r| *r == other),
        };
        self.changes.push(to_value(ListChange::Pre {
            value: value.into(),
            before,
        }));
        if let Some(position) = position {
            self.view.insert(position, inserted);
        }
        self
    }

    /// Append at the end.
    pub fn push(&mut self, value: impl Into<Value>) -> &mut Self {
        let after = self.view.last().copied().unwrap_or(OpRef::Start);
        self.append(after, value)
    }

    /// Insert so the new item ends up at `index`.
    pub fn insert(&mut self, index: usize, value: impl Into<Value>) -> Result<&mut Self, CoreError> {
        if index > self.view.len() {
            return Err(self.out_of_range(index));
        }
        Ok(match index {
            0 => match self.view.first().copied() {
                Some(first) => self.prepend(first, value),
                None => self.append(OpRef::Start, value),
            },
            _ => {
                let after = self.view[index - 1];
                self.append(after, value)
            }
        })
    }

    /// Delete the item at `index`.
    pub fn delete(&mut self, index: usize) -> Result<&mut Self, CoreError> {
        if index >= self.view.len() {
            return Err(self.out_of_range(index));
        }
        let insertion = self.view.remove(index);
        self.changes.push(to_value(ListChange::Del { insertion }));
        Ok(self)
    }

    /// Remove `delete_count` items at `start` and insert `values` there.
    pub fn splice(
        &mut self,
        start: usize,
        delete_count: usize,
        values: impl IntoIterator<Item = Value>,
    ) -> Result<&mut Self, CoreError> {
        if start + delete_count > self.view.len() {
            return Err(self.out_of_range(start + delete_count));
        }
        for _ in 0..delete_count {
            self.delete(start)?;
        }
        for (offset, value) in values.into_iter().enumerate() {
            self.insert(start + offset, value)?;
        }
        Ok(self)
    }

    pub fn into_changes(self) -> Vec<Value> {
        self.changes
    }
}

/// Changes for a stream: each item is pushed to the author's feed.
#[derive(Clone, Debug, Default)]
pub struct StreamEdit {
    changes: Vec<Value>,
}

impl StreamEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, value: impl Into<Value>) -> Self {
        self.changes.push(value.into());
        self
    }

    pub fn into_changes(self) -> Vec<Value> {
        self.changes
    }
}
