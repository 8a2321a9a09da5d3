//! Contract of the remote document store.

use crate::error::Result;
use crate::query::QueryRequest;
use crate::types::{DocRef, Document, Sequence, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Kind of a single-document change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document entering, changing within, or leaving a result set.
/// For `Removed` the document is its last known state.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub doc: Document,
}

/// Notification delivered to a listener.
#[derive(Clone, Debug, PartialEq)]
pub enum ListenEvent {
    /// Complete result set as of `seq`.
    Full { documents: Vec<Document>, seq: Sequence },
    /// A single change committed at `seq`. Several changes may share a
    /// sequence when one commit touched several documents.
    Incremental { change: DocumentChange, seq: Sequence },
    /// The listener is dead. `QueryUnsupported` is distinguishable from
    /// other causes.
    Error(crate::error::SyncError),
}

/// Result of a one-shot query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub documents: Vec<Document>,
    /// Commit position the result reflects.
    pub read_seq: Sequence,
}

/// Callback invoked for every listener event.
pub type EventCallback = Arc<dyn Fn(ListenEvent) + Send + Sync>;

/// Releases a remote listener. Runs its release action exactly once, either
/// through [`Unsubscribe::unsubscribe`] or on drop.
pub struct Unsubscribe {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A registration with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("pending", &self.release.is_some())
            .finish()
    }
}

/// Native set operation on an array field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetOp {
    Add,
    Remove,
}

/// Guard checked by the store before applying a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    None,
    /// Document must exist.
    Exists,
    /// Document must exist at exactly this version.
    Version(Version),
}

/// One write inside an all-or-nothing batch.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Create a new document; fails if it exists.
    Create { doc: DocRef, data: Value },
    /// Replace a document's content.
    Set {
        doc: DocRef,
        data: Value,
        precondition: Precondition,
    },
    /// Merge top-level fields into an existing document.
    Update {
        doc: DocRef,
        patch: Map<String, Value>,
        precondition: Precondition,
    },
    /// Array union/remove.
    SetOp {
        doc: DocRef,
        field: String,
        op: SetOp,
        value: Value,
    },
    /// Numeric increment (missing field counts as zero).
    Increment {
        doc: DocRef,
        field: String,
        delta: i64,
    },
    /// Stamp a field with the commit time.
    ServerTimestamp { doc: DocRef, field: String },
    Delete { doc: DocRef },
}

impl WriteOp {
    pub fn doc(&self) -> &DocRef {
        match self {
            WriteOp::Create { doc, .. }
            | WriteOp::Set { doc, .. }
            | WriteOp::Update { doc, .. }
            | WriteOp::SetOp { doc, .. }
            | WriteOp::Increment { doc, .. }
            | WriteOp::ServerTimestamp { doc, .. }
            | WriteOp::Delete { doc } => doc,
        }
    }
}

/// Remote document store client.
///
/// Implementations must deliver events for one listener in commit order and
/// must not invoke a listener's callback while holding locks that the callback
/// could need (callbacks may open listeners or write).
pub trait DocumentStore: Send + Sync {
    /// One-shot query.
    fn query(&self, request: &QueryRequest) -> Result<QueryResult>;

    /// Start a live listener. A compound query the store cannot serve may be
    /// rejected here or through an `Error` event; both carry
    /// `SyncError::QueryUnsupported`.
    fn listen(&self, request: &QueryRequest, on_event: EventCallback) -> Result<Unsubscribe>;

    fn get(&self, doc: &DocRef) -> Result<Option<Document>>;

    fn set(&self, doc: &DocRef, data: Value, precondition: Precondition) -> Result<Version>;

    fn update(
        &self,
        doc: &DocRef,
        patch: Map<String, Value>,
        precondition: Precondition,
    ) -> Result<Version>;

    fn atomic_set_op(&self, doc: &DocRef, field: &str, op: SetOp, value: Value) -> Result<Version>;

    fn atomic_increment(&self, doc: &DocRef, field: &str, delta: i64) -> Result<Version>;

    /// Apply every op or none of them.
    fn batch(&self, ops: Vec<WriteOp>) -> Result<Sequence>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unsubscribe_runs_once_explicit() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let unsub = Unsubscribe::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        unsub.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_runs_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let c = Arc::clone(&count);
            let _unsub = Unsubscribe::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
