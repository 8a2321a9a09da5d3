//! Primary/Degraded/Failed execution state per live query.

use crate::error::SyncError;
use std::fmt;

use super::order::SnapshotOrder;
use super::types::{LiveQuery, QueryRequest};

/// How a live query is currently executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Declared filter and order served by the store.
    Primary,
    /// Filters served by the store; order and limit recomputed locally.
    Degraded,
    /// No listener could be established.
    Failed,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Primary => write!(f, "primary"),
            ExecutionMode::Degraded => write!(f, "degraded"),
            ExecutionMode::Failed => write!(f, "failed"),
        }
    }
}

/// Result of feeding a setup error into the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// Retry with the degraded plan.
    Degrade,
    /// Give up and surface the error.
    Fail(SyncError),
    /// Already failed; nothing to do.
    Unchanged,
}

/// Everything needed to run a query in the current mode.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionPlan {
    pub mode: ExecutionMode,
    /// What to send to the store.
    pub request: QueryRequest,
    /// How the reconciler orders results.
    pub order: SnapshotOrder,
    /// Window exposed to consumers.
    pub limit: Option<usize>,
}

/// Degradation state machine. One instance per live query instance; a new
/// subscription starts again from `Primary`.
#[derive(Clone, Debug)]
pub struct QueryExecution {
    mode: ExecutionMode,
    failure: Option<SyncError>,
}

impl QueryExecution {
    pub fn new() -> Self {
        Self {
            mode: ExecutionMode::Primary,
            failure: None,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The error that moved this query to `Failed`, if any.
    pub fn failure(&self) -> Option<&SyncError> {
        self.failure.as_ref()
    }

    /// Plan for the current mode. `None` once failed.
    pub fn plan(&self, query: &LiveQuery) -> Option<ExecutionPlan> {
        match self.mode {
            ExecutionMode::Primary => Some(ExecutionPlan {
                mode: ExecutionMode::Primary,
                request: query.primary_request(),
                order: SnapshotOrder::Declared(query.order.clone()),
                limit: query.limit,
            }),
            ExecutionMode::Degraded => Some(ExecutionPlan {
                mode: ExecutionMode::Degraded,
                request: query.degraded_request(),
                order: SnapshotOrder::Degraded,
                limit: query.limit,
            }),
            ExecutionMode::Failed => None,
        }
    }

    /// Feed a listener setup error.
    ///
    /// `QueryUnsupported` in `Primary` degrades; the move is irreversible.
    /// Anything else, including `QueryUnsupported` for a filter-only request,
    /// fails the query.
    pub fn on_setup_error(&mut self, err: &SyncError) -> Transition {
        match (self.mode, err) {
            (ExecutionMode::Failed, _) => Transition::Unchanged,
            (ExecutionMode::Primary, SyncError::QueryUnsupported(_)) => {
                self.mode = ExecutionMode::Degraded;
                Transition::Degrade
            }
            (_, err) => {
                self.mode = ExecutionMode::Failed;
                self.failure = Some(err.clone());
                Transition::Fail(err.clone())
            }
        }
    }
}

impl Default for QueryExecution {
    fn default() -> Self {
        Self::new()
    }
}
