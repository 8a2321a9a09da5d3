//! Live query subscriptions.
//!
//! Consumers attach to a [`LiveQuery`](crate::query::LiveQuery) and receive
//! ordered snapshots as the store pushes changes:
//! - Equal queries share one entry and one remote listener
//! - The listener is released when the last consumer detaches
//! - Unsupported compound queries fall back to degraded execution silently
//!
//! Consumers attach either a callback or a bounded channel; a channel
//! consumer that falls behind is dropped.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new(store, SubscriptionConfig::default(), RetryPolicy::default());
//!
//! let query = LiveQuery::new("chatMessages")
//!     .filter(Filter::eq("roomId", json!("general")))
//!     .order_by(OrderSpec::asc("timestamp"));
//! let sub = registry.open_channel(query)?;
//!
//! loop {
//!     match sub.recv() {
//!         Ok(SubscriptionEvent::Snapshot(snapshot)) => render(&snapshot),
//!         Ok(SubscriptionEvent::Failed(err)) => break,
//!         Ok(SubscriptionEvent::Dropped { .. }) | Err(_) => break,
//!     }
//! }
//! ```

mod registry;
mod types;

pub use registry::{ChannelSubscription, SubscriptionHandle, SubscriptionRegistry};
pub use types::{DropReason, EventSink, SubscriptionConfig, SubscriptionEvent, SubscriptionId};
