//! In-process implementation of the document store contract.
//!
//! Serves filtered, ordered, limited queries; pushes incremental changes to
//! listeners by diffing each listener's visible window after every commit;
//! checks version preconditions; applies batches all-or-nothing. Composite
//! index requirements, denied collections and injected transient failures
//! make the degraded and retry paths reachable in tests.

use crate::error::{Result, SyncError};
use crate::query::{QueryRequest, SnapshotOrder};
use crate::types::{DocId, DocRef, Document, Sequence, Timestamp, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::remote::{
    ChangeKind, DocumentChange, DocumentStore, EventCallback, ListenEvent, Precondition,
    QueryResult, SetOp, Unsubscribe, WriteOp,
};
use crate::query::compare_values;

/// Behaviour switches for [`MemoryStore`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// Reject queries combining filters with an order unless a matching
    /// composite index was registered.
    pub require_composite_indexes: bool,

    /// Report an unsupported query as an error from `listen` itself instead
    /// of through the listener's event stream.
    pub reject_unsupported_on_listen: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CompositeIndex {
    collection: String,
    fields: Vec<String>,
    order_field: String,
}

impl CompositeIndex {
    fn new(collection: &str, fields: &[&str], order_field: &str) -> Self {
        let mut fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        fields.sort();
        fields.dedup();
        Self {
            collection: collection.to_string(),
            fields,
            order_field: order_field.to_string(),
        }
    }

    fn for_request(request: &QueryRequest) -> Option<Self> {
        let order = request.order.as_ref()?;
        let fields: Vec<&str> = request.filters.iter().map(|f| f.field.as_str()).collect();
        Some(Self::new(&request.collection, &fields, &order.field))
    }
}

struct ListenerState {
    request: QueryRequest,
    callback: EventCallback,
    /// Window last reported to the listener, in query order.
    visible: Vec<Document>,
    /// Listener errored; receives nothing further.
    dead: bool,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<DocId, Document>>,
    commit_seq: Sequence,
    indexes: HashSet<CompositeIndex>,
    denied: HashSet<String>,
    injected: VecDeque<SyncError>,
    listeners: HashMap<u64, ListenerState>,
    /// Events awaiting delivery, in commit order.
    pending: VecDeque<(u64, ListenEvent)>,
    next_listener_id: u64,
}

impl Inner {
    fn lookup(&self, doc: &DocRef) -> Option<&Document> {
        self.collections.get(&doc.collection)?.get(&doc.id)
    }

    fn check_access(&self, collection: &str) -> Result<()> {
        if self.denied.contains(collection) {
            Err(SyncError::PermissionDenied(format!(
                "access to collection '{}' denied",
                collection
            )))
        } else {
            Ok(())
        }
    }

    fn take_injected(&mut self) -> Result<()> {
        match self.injected.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn run_query(&self, request: &QueryRequest) -> Vec<Document> {
        let Some(docs) = self.collections.get(&request.collection) else {
            return Vec::new();
        };
        let mut result: Vec<Document> = docs
            .values()
            .filter(|d| request.matches(d))
            .cloned()
            .collect();
        SnapshotOrder::Declared(request.order.clone()).sort(&mut result);
        if let Some(limit) = request.limit {
            result.truncate(limit);
        }
        result
    }

    /// Apply `ops` atomically and return the commit position plus the new
    /// version of every surviving touched document.
    fn apply(&mut self, ops: Vec<WriteOp>) -> Result<(Sequence, HashMap<DocRef, Version>)> {
        let now = Timestamp::now();
        let mut staged: BTreeMap<DocRef, Option<Document>> = BTreeMap::new();

        for op in ops {
            let doc_ref = op.doc().clone();
            if !staged.contains_key(&doc_ref) {
                let current = self.lookup(&doc_ref).cloned();
                staged.insert(doc_ref.clone(), current);
            }
            if let Some(current) = staged.get_mut(&doc_ref) {
                apply_write(current, op, now)?;
            }
        }

        let seq = self.commit_seq.next();
        self.commit_seq = seq;

        let mut versions = HashMap::new();
        let mut touched = HashSet::new();
        for (doc_ref, state) in staged {
            let previous = self.lookup(&doc_ref).map(|d| d.version).unwrap_or_default();
            let collection = self.collections.entry(doc_ref.collection.clone()).or_default();
            match state {
                Some(mut doc) => {
                    doc.version = previous.next();
                    versions.insert(doc_ref.clone(), doc.version);
                    collection.insert(doc_ref.id.clone(), doc);
                }
                None => {
                    collection.remove(&doc_ref.id);
                }
            }
            touched.insert(doc_ref.collection);
        }

        self.publish(&touched, seq);
        Ok((seq, versions))
    }

    /// Diff every affected listener's window and queue incremental events.
    fn publish(&mut self, touched: &HashSet<String>, seq: Sequence) {
        let mut ids: Vec<u64> = self
            .listeners
            .iter()
            .filter(|(_, l)| !l.dead && touched.contains(&l.request.collection))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        for id in ids {
            let Some(request) = self.listeners.get(&id).map(|l| l.request.clone()) else {
                continue;
            };
            let next = self.run_query(&request);
            let Some(listener) = self.listeners.get_mut(&id) else {
                continue;
            };

            let changes = {
                let next_ids: HashSet<&DocId> = next.iter().map(|d| &d.id).collect();
                let previous: HashMap<&DocId, &Document> =
                    listener.visible.iter().map(|d| (&d.id, d)).collect();

                let mut changes = Vec::new();
                for doc in &listener.visible {
                    if !next_ids.contains(&doc.id) {
                        changes.push(DocumentChange {
                            kind: ChangeKind::Removed,
                            doc: doc.clone(),
                        });
                    }
                }
                for doc in &next {
                    match previous.get(&doc.id) {
                        None => changes.push(DocumentChange {
                            kind: ChangeKind::Added,
                            doc: doc.clone(),
                        }),
                        Some(old) if *old != doc => changes.push(DocumentChange {
                            kind: ChangeKind::Modified,
                            doc: doc.clone(),
                        }),
                        Some(_) => {}
                    }
                }
                changes
            };

            listener.visible = next;
            for change in changes {
                self.pending
                    .push_back((id, ListenEvent::Incremental { change, seq }));
            }
        }
    }

    /// Next deliverable event, skipping events of released listeners.
    fn next_delivery(&mut self) -> Option<(EventCallback, ListenEvent)> {
        while let Some((id, event)) = self.pending.pop_front() {
            if let Some(listener) = self.listeners.get(&id) {
                return Some((Arc::clone(&listener.callback), event));
            }
        }
        None
    }
}

fn check_precondition(
    doc_ref: &DocRef,
    current: &Option<Document>,
    precondition: Precondition,
) -> Result<()> {
    match (precondition, current) {
        (Precondition::None, _) => Ok(()),
        (_, None) => Err(SyncError::NotFound(doc_ref.clone())),
        (Precondition::Exists, Some(_)) => Ok(()),
        (Precondition::Version(expected), Some(doc)) => {
            if doc.version == expected {
                Ok(())
            } else {
                Err(SyncError::VersionMismatch {
                    doc: doc_ref.clone(),
                    expected,
                    found: doc.version,
                })
            }
        }
    }
}

fn into_object(doc_ref: &DocRef, data: Value) -> Result<Map<String, Value>> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::InvalidArgument(format!(
            "document {} content must be an object, got {}",
            doc_ref, other
        ))),
    }
}

fn existing<'a>(doc_ref: &DocRef, current: &'a mut Option<Document>) -> Result<&'a mut Document> {
    current
        .as_mut()
        .ok_or_else(|| SyncError::NotFound(doc_ref.clone()))
}

fn apply_write(current: &mut Option<Document>, op: WriteOp, now: Timestamp) -> Result<()> {
    match op {
        WriteOp::Create { doc, data } => {
            if current.is_some() {
                return Err(SyncError::AlreadyExists(doc));
            }
            let data = into_object(&doc, data)?;
            *current = Some(Document {
                id: doc.id,
                data,
                create_time: Some(now),
                version: Version::default(),
            });
        }

        WriteOp::Set {
            doc,
            data,
            precondition,
        } => {
            check_precondition(&doc, current, precondition)?;
            let data = into_object(&doc, data)?;
            let create_time = current.as_ref().and_then(|d| d.create_time).or(Some(now));
            let version = current.as_ref().map(|d| d.version).unwrap_or_default();
            *current = Some(Document {
                id: doc.id,
                data,
                create_time,
                version,
            });
        }

        WriteOp::Update {
            doc,
            patch,
            precondition,
        } => {
            check_precondition(&doc, current, precondition)?;
            let target = existing(&doc, current)?;
            for (key, value) in patch {
                target.data.insert(key, value);
            }
        }

        WriteOp::SetOp {
            doc,
            field,
            op,
            value,
        } => {
            let target = existing(&doc, current)?;
            let mut items = match target.data.remove(&field) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            match op {
                SetOp::Add => {
                    if !items.iter().any(|v| compare_values(v, &value).is_eq()) {
                        items.push(value);
                    }
                }
                SetOp::Remove => items.retain(|v| !compare_values(v, &value).is_eq()),
            }
            target.data.insert(field, Value::Array(items));
        }

        WriteOp::Increment { doc, field, delta } => {
            let target = existing(&doc, current)?;
            let base = target.data.get(&field).and_then(Value::as_i64).unwrap_or(0);
            target.data.insert(field, Value::from(base + delta));
        }

        WriteOp::ServerTimestamp { doc, field } => {
            let target = existing(&doc, current)?;
            target.data.insert(field, Value::from(now.0));
        }

        WriteOp::Delete { .. } => {
            *current = None;
        }
    }
    Ok(())
}

/// In-process document store.
pub struct MemoryStore {
    config: MemoryStoreConfig,
    inner: Arc<Mutex<Inner>>,
    /// Held by whichever thread is draining the event queue.
    delivery: Mutex<()>,
    listens_started: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner::default())),
            delivery: Mutex::new(()),
            listens_started: AtomicU64::new(0),
        }
    }

    /// Register a composite index so a filter+order query on it is served.
    pub fn add_composite_index(&self, collection: &str, filter_fields: &[&str], order_field: &str) {
        self.inner
            .lock()
            .indexes
            .insert(CompositeIndex::new(collection, filter_fields, order_field));
    }

    /// Reject every operation on `collection` with `PermissionDenied`.
    pub fn deny_collection(&self, collection: &str) {
        self.inner.lock().denied.insert(collection.to_string());
    }

    /// Fail the next read or write operation with `err`. Queued failures are
    /// consumed in order.
    pub fn inject_failure(&self, err: SyncError) {
        self.inner.lock().injected.push_back(err);
    }

    /// Insert a document exactly as given (version and creation time
    /// included) and notify listeners.
    pub fn seed(&self, collection: &str, doc: Document) -> Sequence {
        let seq = {
            let mut inner = self.inner.lock();
            let seq = inner.commit_seq.next();
            inner.commit_seq = seq;
            inner
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(doc.id.clone(), doc);
            let touched = HashSet::from([collection.to_string()]);
            inner.publish(&touched, seq);
            seq
        };
        self.deliver();
        seq
    }

    /// Number of registered listeners.
    pub fn active_listeners(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Total `listen` calls accepted since creation.
    pub fn listens_started(&self) -> u64 {
        self.listens_started.load(Ordering::SeqCst)
    }

    /// Latest commit position.
    pub fn commit_seq(&self) -> Sequence {
        self.inner.lock().commit_seq
    }

    /// Read a document bypassing access checks and injected failures.
    pub fn peek(&self, doc: &DocRef) -> Option<Document> {
        self.inner.lock().lookup(doc).cloned()
    }

    fn unsupported(&self, inner: &Inner, request: &QueryRequest) -> Option<SyncError> {
        if !self.config.require_composite_indexes || !request.is_compound() {
            return None;
        }
        let index = CompositeIndex::for_request(request)?;
        if inner.indexes.contains(&index) {
            None
        } else {
            Some(SyncError::QueryUnsupported(format!(
                "query on '{}' filtering {:?} ordered by '{}' requires a composite index",
                index.collection, index.fields, index.order_field
            )))
        }
    }

    fn commit(&self, ops: Vec<WriteOp>) -> Result<(Sequence, HashMap<DocRef, Version>)> {
        let result = {
            let mut inner = self.inner.lock();
            inner.take_injected()?;
            for op in &ops {
                inner.check_access(&op.doc().collection)?;
            }
            inner.apply(ops)?
        };
        self.deliver();
        Ok(result)
    }

    fn commit_one(&self, op: WriteOp) -> Result<Version> {
        let doc_ref = op.doc().clone();
        let (seq, versions) = self.commit(vec![op])?;
        // a delete leaves no version behind; report the commit position
        Ok(versions.get(&doc_ref).copied().unwrap_or(Version(seq.0)))
    }

    /// Drain queued events. Only one thread drains at a time; a thread that
    /// finds the queue busy leaves its events to the active drainer, which
    /// re-checks the queue after releasing.
    fn deliver(&self) {
        loop {
            let Some(guard) = self.delivery.try_lock() else {
                return;
            };
            loop {
                let next = self.inner.lock().next_delivery();
                match next {
                    Some((callback, event)) => callback(event),
                    None => break,
                }
            }
            drop(guard);
            if self.inner.lock().pending.is_empty() {
                return;
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        let mut inner = self.inner.lock();
        inner.take_injected()?;
        inner.check_access(&request.collection)?;
        if let Some(err) = self.unsupported(&inner, request) {
            return Err(err);
        }
        Ok(QueryResult {
            documents: inner.run_query(request),
            read_seq: inner.commit_seq,
        })
    }

    fn listen(&self, request: &QueryRequest, on_event: EventCallback) -> Result<Unsubscribe> {
        let id = {
            let mut inner = self.inner.lock();
            inner.check_access(&request.collection)?;

            let unsupported = self.unsupported(&inner, request);
            if let (Some(err), true) = (&unsupported, self.config.reject_unsupported_on_listen) {
                return Err(err.clone());
            }

            let id = inner.next_listener_id;
            inner.next_listener_id += 1;

            let (visible, first_event, dead) = match unsupported {
                Some(err) => (Vec::new(), ListenEvent::Error(err), true),
                None => {
                    let visible = inner.run_query(request);
                    let event = ListenEvent::Full {
                        documents: visible.clone(),
                        seq: inner.commit_seq,
                    };
                    (visible, event, false)
                }
            };

            inner.listeners.insert(
                id,
                ListenerState {
                    request: request.clone(),
                    callback: on_event,
                    visible,
                    dead,
                },
            );
            inner.pending.push_back((id, first_event));
            id
        };

        self.listens_started.fetch_add(1, Ordering::SeqCst);
        debug!(listener = id, collection = %request.collection, "memory store listener registered");
        self.deliver();

        let inner = Arc::downgrade(&self.inner);
        Ok(Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut inner = inner.lock();
                inner.listeners.remove(&id);
                inner.pending.retain(|(lid, _)| *lid != id);
            }
        }))
    }

    fn get(&self, doc: &DocRef) -> Result<Option<Document>> {
        let mut inner = self.inner.lock();
        inner.take_injected()?;
        inner.check_access(&doc.collection)?;
        Ok(inner.lookup(doc).cloned())
    }

    fn set(&self, doc: &DocRef, data: Value, precondition: Precondition) -> Result<Version> {
        self.commit_one(WriteOp::Set {
            doc: doc.clone(),
            data,
            precondition,
        })
    }

    fn update(
        &self,
        doc: &DocRef,
        patch: Map<String, Value>,
        precondition: Precondition,
    ) -> Result<Version> {
        self.commit_one(WriteOp::Update {
            doc: doc.clone(),
            patch,
            precondition,
        })
    }

    fn atomic_set_op(&self, doc: &DocRef, field: &str, op: SetOp, value: Value) -> Result<Version> {
        self.commit_one(WriteOp::SetOp {
            doc: doc.clone(),
            field: field.to_string(),
            op,
            value,
        })
    }

    fn atomic_increment(&self, doc: &DocRef, field: &str, delta: i64) -> Result<Version> {
        self.commit_one(WriteOp::Increment {
            doc: doc.clone(),
            field: field.to_string(),
            delta,
        })
    }

    fn batch(&self, ops: Vec<WriteOp>) -> Result<Sequence> {
        if ops.is_empty() {
            return Err(SyncError::InvalidArgument(
                "batch must contain at least one write".into(),
            ));
        }
        self.commit(ops).map(|(seq, _)| seq)
    }
}
