//! # livesync
//!
//! Real-time synchronization and consistency layer between a presentation
//! layer and a shared, remote, multi-writer document store.
//!
//! ## Core Concepts
//!
//! - **Live queries**: Reference-counted subscriptions, one remote listener
//!   per distinct query no matter how many consumers
//! - **Degradation**: Compound queries the store cannot serve fall back to
//!   filter-only execution with deterministic local ordering
//! - **Reconciliation**: Full and incremental pushes and refetches merged
//!   into one ordered snapshot by commit sequence
//! - **Set mutations**: Atomic union/remove, or version-guarded
//!   read-modify-write with a single conflict retry
//!
//! ## Example
//!
//! ```ignore
//! use livesync::{Filter, LiveQuery, MemoryStore, MutationRequest, OrderSpec, SyncClient, SyncConfig};
//!
//! let client = SyncClient::new(Arc::new(MemoryStore::new()), SyncConfig::default());
//!
//! // Watch a chat room
//! let query = LiveQuery::new("chatMessages")
//!     .filter(Filter::eq("roomId", json!("general")))
//!     .order_by(OrderSpec::asc("timestamp"))
//!     .limit(50);
//! let handle = client.subscribe(query, |event| println!("{:?}", event))?;
//!
//! // React to a message
//! client.mutate_set(&MutationRequest::toggle(
//!     DocRef::new("chatMessages", "m1"),
//!     "reactions",
//!     "👍",
//!     "alice",
//! ))?;
//!
//! client.unsubscribe(handle);
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod mutations;
pub mod query;
pub mod retry;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use cache::{ApplyOutcome, QuerySnapshot, Reconciler, SnapshotEntry};
pub use client::{SyncClient, SyncConfig};
pub use error::{ErrorKind, Result, SyncError};
pub use mutations::{
    CreateAndIncrement, FieldKind, FieldSchema, MapEdit, MutationCoordinator, MutationOp,
    MutationOutcome, MutationRequest, SetField,
};
pub use query::{
    Direction, ExecutionMode, Filter, FilterOp, LiveQuery, OrderSpec, QueryExecution, QueryId,
    SnapshotOrder,
};
pub use retry::RetryPolicy;
pub use store::{
    ChangeKind, DocumentChange, DocumentStore, EventCallback, ListenEvent, MemoryStore, MemoryStoreConfig,
    Precondition, QueryResult, SetOp, Unsubscribe, WriteOp,
};
pub use subscriptions::{
    ChannelSubscription, DropReason, SubscriptionConfig, SubscriptionEvent, SubscriptionHandle,
    SubscriptionId, SubscriptionRegistry,
};
pub use types::*;
