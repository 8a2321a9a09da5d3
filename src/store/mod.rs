//! Remote document store contract and an in-process implementation.
//!
//! The sync layer only ever talks to a store through [`DocumentStore`]:
//! one-shot queries, live listeners delivering full and incremental change
//! notifications, native array union/remove, increments, version-guarded
//! writes, and all-or-nothing batches.

mod memory;
mod remote;

pub use memory::{MemoryStore, MemoryStoreConfig};
pub use remote::{
    ChangeKind, DocumentChange, DocumentStore, EventCallback, ListenEvent, Precondition,
    QueryResult, SetOp, Unsubscribe, WriteOp,
};
