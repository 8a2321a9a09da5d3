//! Local cache reconciliation.
//!
//! Each live query owns one [`Reconciler`]. Full pushes replace the ordered
//! list, incremental pushes are spliced in by binary search, and refetches go
//! through the same sequence-checked path so they never overwrite newer
//! state.

mod reconciler;

pub use reconciler::{ApplyOutcome, QuerySnapshot, Reconciler, SnapshotEntry};
