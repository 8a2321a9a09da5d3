//! Error handling and edge case tests.

use livesync::{
    DocRef, Document, DocumentStore, ErrorKind, EventCallback, ExecutionMode, ListenEvent,
    LiveQuery, MemoryStore, MutationRequest, Precondition, QueryResult, RetryPolicy, Sequence,
    SetOp, SubscriptionEvent, SyncClient, SyncConfig, SyncError, Unsubscribe, Version, WriteOp,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn quick_retries() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy::immediate(3),
        ..Default::default()
    }
}

/// Store wrapper that lets another writer sneak in right after each of the
/// first `races` reads.
struct RacingStore {
    inner: MemoryStore,
    races: AtomicUsize,
}

impl RacingStore {
    fn new(inner: MemoryStore, races: usize) -> Self {
        Self {
            inner,
            races: AtomicUsize::new(races),
        }
    }
}

impl DocumentStore for RacingStore {
    fn query(&self, request: &livesync::query::QueryRequest) -> livesync::Result<QueryResult> {
        self.inner.query(request)
    }

    fn listen(
        &self,
        request: &livesync::query::QueryRequest,
        on_event: EventCallback,
    ) -> livesync::Result<Unsubscribe> {
        self.inner.listen(request, on_event)
    }

    fn get(&self, doc: &DocRef) -> livesync::Result<Option<Document>> {
        let read = self.inner.get(doc)?;
        let left = self
            .races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if left.is_ok() {
            self.inner.atomic_increment(doc, "edits", 1)?;
        }
        Ok(read)
    }

    fn set(&self, doc: &DocRef, data: Value, precondition: Precondition) -> livesync::Result<Version> {
        self.inner.set(doc, data, precondition)
    }

    fn update(
        &self,
        doc: &DocRef,
        patch: Map<String, Value>,
        precondition: Precondition,
    ) -> livesync::Result<Version> {
        self.inner.update(doc, patch, precondition)
    }

    fn atomic_set_op(&self, doc: &DocRef, field: &str, op: SetOp, value: Value) -> livesync::Result<Version> {
        self.inner.atomic_set_op(doc, field, op, value)
    }

    fn atomic_increment(&self, doc: &DocRef, field: &str, delta: i64) -> livesync::Result<Version> {
        self.inner.atomic_increment(doc, field, delta)
    }

    fn batch(&self, ops: Vec<WriteOp>) -> livesync::Result<Sequence> {
        self.inner.batch(ops)
    }
}

/// Store wrapper whose listeners can fail to open or drop mid-stream.
struct FlakyListenStore {
    inner: MemoryStore,
    failures: AtomicUsize,
    attempts: AtomicUsize,
    callbacks: Mutex<Vec<EventCallback>>,
}

impl FlakyListenStore {
    fn new(inner: MemoryStore, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Push a transient error into the first listener ever opened.
    fn interrupt_first(&self) {
        let first = self.callbacks.lock().first().cloned();
        if let Some(callback) = first {
            callback(ListenEvent::Error(SyncError::Unavailable("stream reset".into())));
        }
    }
}

impl DocumentStore for FlakyListenStore {
    fn query(&self, request: &livesync::query::QueryRequest) -> livesync::Result<QueryResult> {
        self.inner.query(request)
    }

    fn listen(
        &self,
        request: &livesync::query::QueryRequest,
        on_event: EventCallback,
    ) -> livesync::Result<Unsubscribe> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SyncError::Unavailable("blip".into()));
        }
        self.callbacks.lock().push(Arc::clone(&on_event));
        self.inner.listen(request, on_event)
    }

    fn get(&self, doc: &DocRef) -> livesync::Result<Option<Document>> {
        self.inner.get(doc)
    }

    fn set(&self, doc: &DocRef, data: Value, precondition: Precondition) -> livesync::Result<Version> {
        self.inner.set(doc, data, precondition)
    }

    fn update(
        &self,
        doc: &DocRef,
        patch: Map<String, Value>,
        precondition: Precondition,
    ) -> livesync::Result<Version> {
        self.inner.update(doc, patch, precondition)
    }

    fn atomic_set_op(&self, doc: &DocRef, field: &str, op: SetOp, value: Value) -> livesync::Result<Version> {
        self.inner.atomic_set_op(doc, field, op, value)
    }

    fn atomic_increment(&self, doc: &DocRef, field: &str, delta: i64) -> livesync::Result<Version> {
        self.inner.atomic_increment(doc, field, delta)
    }

    fn batch(&self, ops: Vec<WriteOp>) -> livesync::Result<Sequence> {
        self.inner.batch(ops)
    }
}

fn racing_client(races: usize) -> (Arc<RacingStore>, SyncClient) {
    let inner = MemoryStore::new();
    inner.seed("chatMessages", Document::new("m1", json!({"reactions": {"🔥": ["zoe"]}})));
    let store = Arc::new(RacingStore::new(inner, races));
    let client = SyncClient::new(store.clone(), quick_retries());
    (store, client)
}

// --- Conflicts ---

#[test]
fn test_single_race_is_absorbed_by_retry() {
    let (store, client) = racing_client(1);
    let msg = DocRef::new("chatMessages", "m1");

    let outcome = client
        .mutate_set(&MutationRequest::toggle(msg.clone(), "reactions", "👍", "alice"))
        .unwrap();
    assert_eq!(outcome.attempts, 2);

    let doc = store.inner.peek(&msg).unwrap();
    assert_eq!(doc.data["reactions"], json!({"🔥": ["zoe"], "👍": ["alice"]}));
    assert_eq!(doc.data["edits"], json!(1));
}

#[test]
fn test_repeated_race_surfaces_conflict() {
    let (store, client) = racing_client(2);
    let msg = DocRef::new("chatMessages", "m1");

    let err = client
        .mutate_set(&MutationRequest::toggle(msg.clone(), "reactions", "👍", "alice"))
        .unwrap_err();
    assert!(matches!(err, SyncError::Conflict { ref field, .. } if field == "reactions"));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // the losing write left the field untouched
    let doc = store.inner.peek(&msg).unwrap();
    assert_eq!(doc.data["reactions"], json!({"🔥": ["zoe"]}));
}

// --- Missing and forbidden ---

#[test]
fn test_toggle_on_missing_document() {
    let store = Arc::new(MemoryStore::new());
    let client = SyncClient::new(store, quick_retries());

    let err = client
        .mutate_set(&MutationRequest::toggle(
            DocRef::new("chatMessages", "ghost"),
            "reactions",
            "👍",
            "alice",
        ))
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[test]
fn test_atomic_add_on_missing_document() {
    let store = Arc::new(MemoryStore::new());
    let client = SyncClient::new(store, quick_retries());

    let err = client
        .mutate_set(&MutationRequest::add(DocRef::new("podPosts", "ghost"), "bookmarks", "alice"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_permission_denied_surfaces_immediately() {
    let store = Arc::new(MemoryStore::new());
    store.seed("pods", Document::new("p1", json!({"members": []})));
    store.deny_collection("pods");
    let client = SyncClient::new(store.clone(), quick_retries());

    let err = client
        .mutate_set(&MutationRequest::add(DocRef::new("pods", "p1"), "members", "alice"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[test]
fn test_undeclared_field_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let client = SyncClient::new(store, quick_retries());

    let err = client
        .mutate_set(&MutationRequest::add(DocRef::new("pods", "p1"), "admins", "alice"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

// --- Transient failures ---

#[test]
fn test_transient_failures_are_retried() {
    let store = Arc::new(MemoryStore::new());
    store.seed("chatMessages", Document::new("m1", json!({})));
    store.inject_failure(SyncError::Unavailable("timeout".into()));
    store.inject_failure(SyncError::Unavailable("timeout".into()));
    let client = SyncClient::new(store.clone(), quick_retries());
    let msg = DocRef::new("chatMessages", "m1");

    client
        .mutate_set(&MutationRequest::toggle(msg.clone(), "reactions", "👍", "alice"))
        .unwrap();
    assert_eq!(store.peek(&msg).unwrap().data["reactions"], json!({"👍": ["alice"]}));
}

#[test]
fn test_persistent_unavailability_surfaces_after_retries() {
    let store = Arc::new(MemoryStore::new());
    store.seed("pods", Document::new("p1", json!({"members": []})));
    for _ in 0..3 {
        store.inject_failure(SyncError::Unavailable("offline".into()));
    }
    let client = SyncClient::new(store.clone(), quick_retries());
    let pod = DocRef::new("pods", "p1");

    let err = client
        .mutate_set(&MutationRequest::add(pod.clone(), "members", "alice"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(store.peek(&pod).unwrap().data["members"], json!([]));
}

#[test]
fn test_retried_mutation_commits_once() {
    let store = Arc::new(MemoryStore::new());
    store.seed("chatMessages", Document::new("m1", json!({})).with_version(Version(1)));
    store.inject_failure(SyncError::Unavailable("hiccup".into()));
    let client = SyncClient::new(store.clone(), quick_retries());
    let msg = DocRef::new("chatMessages", "m1");
    let before = store.commit_seq();

    let outcome = client
        .mutate_set(&MutationRequest::toggle(msg.clone(), "reactions", "👍", "alice"))
        .unwrap();
    assert!(outcome.written);
    assert_eq!(store.commit_seq(), before.next());
    assert_eq!(store.peek(&msg).unwrap().version, Version(2));
}

// --- Subscriptions ---

#[test]
fn test_denied_subscription_reports_failure_once() {
    let store = Arc::new(MemoryStore::new());
    store.deny_collection("startups");
    let client = SyncClient::new(store.clone(), quick_retries());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let handle = client
        .subscribe(LiveQuery::new("startups"), move |e| sink.lock().push(e))
        .unwrap();

    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], SubscriptionEvent::Failed(SyncError::PermissionDenied(_))));
    assert_eq!(store.active_listeners(), 0);
    drop(events);

    // a late joiner learns about the failure too
    let late = Arc::new(Mutex::new(Vec::new()));
    let late_sink = Arc::clone(&late);
    let _second = client
        .subscribe(LiveQuery::new("startups"), move |e| late_sink.lock().push(e))
        .unwrap();
    assert!(matches!(late.lock().as_slice(), [SubscriptionEvent::Failed(_)]));

    client.unsubscribe(handle);
}

#[test]
fn test_consumer_count_drops_on_unsubscribe() {
    let store = Arc::new(MemoryStore::new());
    let client = SyncClient::new(store, quick_retries());
    let keep = client.subscribe(LiveQuery::new("pods"), |_| {}).unwrap();

    let registry = client.registry();
    let query_id = keep.query_id().clone();
    assert_eq!(registry.consumer_count(&query_id), 1);
    client.unsubscribe(keep);
    assert_eq!(registry.consumer_count(&query_id), 0);
}

// --- Transient listener failures ---

fn flaky_client(failures: usize, retry: RetryPolicy) -> (Arc<FlakyListenStore>, SyncClient) {
    let inner = MemoryStore::new();
    inner.seed("chatMessages", Document::new("m1", json!({"roomId": "general", "timestamp": 1})));
    let store = Arc::new(FlakyListenStore::new(inner, failures));
    let client = SyncClient::new(
        store.clone(),
        SyncConfig {
            retry,
            ..Default::default()
        },
    );
    (store, client)
}

#[test]
fn test_listen_unavailable_once_is_retried() {
    let (store, client) = flaky_client(1, RetryPolicy::immediate(4));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _handle = client
        .subscribe(LiveQuery::new("chatMessages"), move |e| sink.lock().push(e))
        .unwrap();

    let events = events.lock();
    assert!(events.iter().all(|e| matches!(e, SubscriptionEvent::Snapshot(_))));
    match events.last() {
        Some(SubscriptionEvent::Snapshot(snap)) => {
            assert_eq!(snap.mode, ExecutionMode::Primary);
            assert_eq!(snap.ids(), vec!["m1"]);
        }
        other => panic!("expected a snapshot, got {:?}", other),
    }
    assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(store.inner.active_listeners(), 1);
}

#[test]
fn test_listener_dropped_mid_stream_is_rearmed() {
    let (store, client) = flaky_client(0, RetryPolicy::immediate(3));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _handle = client
        .subscribe(LiveQuery::new("chatMessages"), move |e| sink.lock().push(e))
        .unwrap();

    store.interrupt_first();
    assert_eq!(store.inner.listens_started(), 2);
    assert_eq!(store.inner.active_listeners(), 1);

    store
        .inner
        .seed("chatMessages", Document::new("m2", json!({"roomId": "general", "timestamp": 2})));

    let events = events.lock();
    assert!(!events.iter().any(|e| matches!(e, SubscriptionEvent::Failed(_))));
    match events.last() {
        Some(SubscriptionEvent::Snapshot(snap)) => assert_eq!(snap.len(), 2),
        other => panic!("expected a snapshot, got {:?}", other),
    }
}

#[test]
fn test_persistent_listen_unavailability_fails_query() {
    let (store, client) = flaky_client(100, RetryPolicy::immediate(3));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _handle = client
        .subscribe(LiveQuery::new("chatMessages"), move |e| sink.lock().push(e))
        .unwrap();

    assert!(matches!(
        events.lock().as_slice(),
        [SubscriptionEvent::Failed(SyncError::Unavailable(_))]
    ));
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(client.active_listeners(), 0);
}
