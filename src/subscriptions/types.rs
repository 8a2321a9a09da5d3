//! Subscription types for live queries.

use crate::cache::QuerySnapshot;
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration for subscriptions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Max buffered events before a channel consumer is dropped.
    /// Default: 256
    pub buffer_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// Events delivered to a consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    /// Current ordered result of the live query.
    Snapshot(QuerySnapshot),

    /// The query could not be served in any mode. No further snapshots
    /// follow; the handle still has to be closed.
    Failed(SyncError),

    /// Consumer was detached by the registry.
    Dropped { reason: DropReason },
}

/// Why a consumer was detached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Channel buffer overflowed (slow consumer).
    BufferOverflow,
    /// Receiver went away.
    Disconnected,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a consumer attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Callback receiving subscription events.
pub type EventSink = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;
