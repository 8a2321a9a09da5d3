//! Live query descriptors, identity, ordering and degradation.
//!
//! A [`LiveQuery`] is identified by a digest of its canonical serialization,
//! so equal queries opened from different places share one subscription.
//! Each live query instance carries a [`QueryExecution`] that starts in
//! `Primary` mode and falls back to `Degraded` (filters only, ordered locally)
//! when the store reports the compound query as unsupported.

mod degradation;
mod order;
mod types;

pub use degradation::{ExecutionMode, ExecutionPlan, QueryExecution, Transition};
pub use order::{compare_values, degraded_compare, SnapshotOrder};
pub use types::{Direction, Filter, FilterOp, LiveQuery, OrderSpec, QueryId, QueryRequest};
