//! Total orderings over field values and documents.

use crate::types::Document;
use serde_json::Value;
use std::cmp::Ordering;

use super::types::{Direction, OrderSpec};

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: values of different types order by type
/// (null < bool < number < string < array < object), values of the same type
/// by content.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord.is_ne() {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // serde_json maps iterate in key order
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord.is_ne() {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Fallback ordering used when the store cannot serve the declared order:
/// creation time descending with pending (unconfirmed) timestamps first,
/// then document id ascending.
pub fn degraded_compare(a: &Document, b: &Document) -> Ordering {
    let by_time = match (a.create_time, b.create_time) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    };
    by_time.then_with(|| a.id.cmp(&b.id))
}

/// How a snapshot's documents are ordered locally.
#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotOrder {
    /// The query's declared order (document id ascending when none, and as
    /// the tiebreaker otherwise). Matches the store's own query order.
    Declared(Option<OrderSpec>),
    /// Deterministic fallback; see [`degraded_compare`].
    Degraded,
}

impl SnapshotOrder {
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        match self {
            SnapshotOrder::Declared(None) => a.id.cmp(&b.id),
            SnapshotOrder::Declared(Some(declared)) => {
                let null = Value::Null;
                let left = a.field(&declared.field).unwrap_or(&null);
                let right = b.field(&declared.field).unwrap_or(&null);
                let ord = compare_values(left, right);
                let ord = match declared.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                };
                ord.then_with(|| a.id.cmp(&b.id))
            }
            SnapshotOrder::Degraded => degraded_compare(a, b),
        }
    }

    pub fn sort(&self, docs: &mut [Document]) {
        docs.sort_by(|a, b| self.compare(a, b));
    }
}
