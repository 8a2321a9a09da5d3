//! Live query descriptors and their canonical identity.

use crate::error::Result;
use crate::types::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use super::order::compare_values;

/// Comparison operator of a single filter clause.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    ArrayContains,
    In,
}

/// A single `field <op> value` clause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn array_contains(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::ArrayContains, value)
    }

    /// Whether `doc` satisfies this clause. Documents missing the field never
    /// match, and range operators only compare values of the same type.
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.field(&self.field) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => compare_values(actual, &self.value).is_eq(),
            FilterOp::NotEq => !compare_values(actual, &self.value).is_eq(),
            FilterOp::Lt | FilterOp::Le | FilterOp::Gt | FilterOp::Ge => {
                if std::mem::discriminant(actual) != std::mem::discriminant(&self.value) {
                    return false;
                }
                let ord = compare_values(actual, &self.value);
                match self.op {
                    FilterOp::Lt => ord.is_lt(),
                    FilterOp::Le => ord.is_le(),
                    FilterOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                }
            }
            FilterOp::ArrayContains => actual
                .as_array()
                .map(|items| items.iter().any(|v| compare_values(v, &self.value).is_eq()))
                .unwrap_or(false),
            FilterOp::In => self
                .value
                .as_array()
                .map(|options| options.iter().any(|v| compare_values(actual, v).is_eq()))
                .unwrap_or(false),
        }
    }

    fn sort_key(&self) -> (String, FilterOp, String) {
        (self.field.clone(), self.op, self.value.to_string())
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ascending,
    Descending,
}

/// Declared ordering of a query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderSpec {
    pub field: String,
    pub direction: Direction,
}

impl OrderSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Descending,
        }
    }
}

/// What is actually sent to the store: the query as declared in Primary mode,
/// or only its filters in Degraded mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order: Option<OrderSpec>,
    pub limit: Option<usize>,
}

impl QueryRequest {
    /// Whether the store would have to combine filters with an ordering.
    pub fn is_compound(&self) -> bool {
        !self.filters.is_empty() && self.order.is_some()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }
}

/// A standing request for a continuously updated result set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveQuery {
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order: Option<OrderSpec>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LiveQuery {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, order: OrderSpec) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Canonical identity: filters sorted, JSON encoded, SHA-256 digested.
    /// Queries differing only in filter order share an id.
    pub fn id(&self) -> Result<QueryId> {
        let mut filters: Vec<&Filter> = self.filters.iter().collect();
        filters.sort_by_key(|f| f.sort_key());

        let canonical = serde_json::to_vec(&(
            &self.collection,
            &filters,
            &self.order,
            &self.limit,
        ))?;

        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(QueryId(hex::encode(hasher.finalize())))
    }

    /// The query exactly as declared.
    pub fn primary_request(&self) -> QueryRequest {
        QueryRequest {
            collection: self.collection.clone(),
            filters: self.filters.clone(),
            order: self.order.clone(),
            limit: self.limit,
        }
    }

    /// Filters only; ordering and pagination are recomputed locally.
    pub fn degraded_request(&self) -> QueryRequest {
        QueryRequest {
            collection: self.collection.clone(),
            filters: self.filters.clone(),
            order: None,
            limit: None,
        }
    }
}

/// Canonical identity of a [`LiveQuery`] (hex SHA-256).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub String);

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryId({}...)", &self.0[..self.0.len().min(8)])
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
