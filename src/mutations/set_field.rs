//! Set-valued field declarations and pure edits on their JSON values.

use crate::error::{Result, SyncError};
use crate::query::compare_values;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a set-valued field is mutated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Array of subject ids; the store applies union/remove natively.
    Atomic,
    /// Object mapping a key to an array of subject ids; needs a guarded
    /// read-modify-write.
    Composite,
}

/// Declaration of one set-valued field on a collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetField {
    pub collection: String,
    pub field: String,
    pub kind: FieldKind,
    /// Field stamped with the server time in the same commit as every
    /// mutation of this one.
    #[serde(default)]
    pub touch: Option<String>,
    /// Numeric field kept equal to the set's size: bumped by one when a
    /// subject actually joins, dropped by one when it actually leaves.
    /// Atomic fields only.
    #[serde(default)]
    pub counter: Option<String>,
}

impl SetField {
    pub fn atomic(collection: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            kind: FieldKind::Atomic,
            touch: None,
            counter: None,
        }
    }

    pub fn composite(collection: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            kind: FieldKind::Composite,
            touch: None,
            counter: None,
        }
    }

    pub fn touching(mut self, field: impl Into<String>) -> Self {
        self.touch = Some(field.into());
        self
    }

    pub fn counted_by(mut self, field: impl Into<String>) -> Self {
        self.counter = Some(field.into());
        self
    }
}

/// Edit applied to one key of a composite field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapEdit {
    Add,
    Remove,
    /// Remove the subject if present, add it otherwise.
    Toggle,
}

/// Apply `edit` for `subject` under `key` to a composite field value.
///
/// A missing or null value is an empty map. Returns the new map and whether
/// anything changed. Sets never hold duplicates, and a key whose set becomes
/// empty is removed.
pub fn edit_map(
    current: Option<&Value>,
    key: &str,
    subject: &Value,
    edit: MapEdit,
) -> Result<(Value, bool)> {
    let mut map: Map<String, Value> = match current {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(SyncError::InvalidArgument(format!(
                "composite field must be an object, found {}",
                other
            )))
        }
    };

    let mut set = match map.remove(key) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => dedup(items),
        Some(other) => {
            return Err(SyncError::InvalidArgument(format!(
                "entry '{}' must be an array, found {}",
                key, other
            )))
        }
    };
    let before = set.len();

    let present = set.iter().any(|v| same(v, subject));
    let changed = match (edit, present) {
        (MapEdit::Add, false) | (MapEdit::Toggle, false) => {
            set.push(subject.clone());
            true
        }
        (MapEdit::Remove, true) | (MapEdit::Toggle, true) => {
            set.retain(|v| !same(v, subject));
            true
        }
        _ => false,
    };

    if !set.is_empty() {
        map.insert(key.to_string(), Value::Array(set));
    } else if before == 0 && current_had_key(current, key) {
        // an empty set left behind by another writer counts as a change
        return Ok((Value::Object(map), true));
    }

    Ok((Value::Object(map), changed))
}

fn current_had_key(current: Option<&Value>, key: &str) -> bool {
    matches!(current, Some(Value::Object(map)) if map.contains_key(key))
}

fn same(a: &Value, b: &Value) -> bool {
    compare_values(a, b).is_eq()
}

fn dedup(items: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !out.iter().any(|v| same(v, &item)) {
            out.push(item);
        }
    }
    out
}

/// Subjects held under `key`, or empty.
pub fn members(value: Option<&Value>, key: &str) -> Vec<Value> {
    value
        .and_then(Value::as_object)
        .and_then(|map| map.get(key))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}
