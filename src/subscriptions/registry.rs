//! Reference-counted registry of live queries.

use crate::cache::{ApplyOutcome, QuerySnapshot, Reconciler};
use crate::error::{Result, SyncError};
use crate::query::{LiveQuery, QueryExecution, QueryId, SnapshotOrder, Transition};
use crate::retry::RetryPolicy;
use crate::store::{DocumentStore, EventCallback, ListenEvent, Unsubscribe};
use crate::types::DocId;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{DropReason, EventSink, SubscriptionConfig, SubscriptionEvent, SubscriptionId};

enum Sink {
    Callback(EventSink),
    Channel(Sender<SubscriptionEvent>),
}

enum Offer {
    Delivered,
    Skipped,
    Overflow,
    Disconnected,
}

/// One attached consumer.
struct Consumer {
    id: SubscriptionId,
    sink: Sink,
    /// Revision of the newest snapshot handed to this consumer.
    delivered: AtomicU64,
}

impl Consumer {
    fn new(id: SubscriptionId, sink: Sink) -> Self {
        Self {
            id,
            sink,
            delivered: AtomicU64::new(0),
        }
    }

    /// Hand over a snapshot unless a newer one already went out.
    fn offer_snapshot(&self, revision: u64, snapshot: &QuerySnapshot) -> Offer {
        if self.delivered.fetch_max(revision, Ordering::SeqCst) >= revision {
            return Offer::Skipped;
        }
        self.send(SubscriptionEvent::Snapshot(snapshot.clone()))
    }

    fn send(&self, event: SubscriptionEvent) -> Offer {
        match &self.sink {
            Sink::Callback(callback) => {
                callback(event);
                Offer::Delivered
            }
            Sink::Channel(sender) => match sender.try_send(event) {
                Ok(()) => Offer::Delivered,
                Err(TrySendError::Full(_)) => Offer::Overflow,
                Err(TrySendError::Disconnected(_)) => Offer::Disconnected,
            },
        }
    }

    /// Best-effort notice for channel consumers being detached.
    fn notify_dropped(&self, reason: DropReason) {
        if let Sink::Channel(sender) = &self.sink {
            let _ = sender.try_send(SubscriptionEvent::Dropped { reason });
        }
    }
}

struct EntryState {
    execution: QueryExecution,
    reconciler: Reconciler,
    /// Bumped for every listener attempt; events from older attempts are
    /// ignored.
    generation: u64,
    listener: Option<Unsubscribe>,
    /// Bumped for every change consumers should see.
    revision: u64,
    /// Listeners re-opened after a transient drop since the last full
    /// snapshot.
    rearms: u32,
    closed: bool,
}

impl EntryState {
    fn bump(&mut self, query_id: &QueryId) -> (u64, QuerySnapshot) {
        self.revision += 1;
        let snapshot = self.reconciler.snapshot(query_id, self.execution.mode());
        (self.revision, snapshot)
    }
}

/// One live query shared by every consumer that asked for it.
struct QueryEntry {
    id: QueryId,
    query: LiveQuery,
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
    registry: Weak<Shared>,
    consumers: Mutex<Vec<Arc<Consumer>>>,
    state: Mutex<EntryState>,
}

impl QueryEntry {
    fn new(
        id: QueryId,
        query: LiveQuery,
        store: Arc<dyn DocumentStore>,
        retry: RetryPolicy,
        registry: Weak<Shared>,
    ) -> Self {
        let reconciler = Reconciler::new(SnapshotOrder::Declared(query.order.clone()), query.limit);
        Self {
            id,
            query,
            store,
            retry,
            registry,
            consumers: Mutex::new(Vec::new()),
            state: Mutex::new(EntryState {
                execution: QueryExecution::new(),
                reconciler,
                generation: 0,
                listener: None,
                revision: 0,
                rearms: 0,
                closed: false,
            }),
        }
    }

    /// Open a listener for the current execution mode.
    ///
    /// Runs without holding any lock across the store call. If the entry
    /// was closed or moved on while setup was in flight, the new listener is
    /// released as soon as it is returned.
    fn start_listener(self: &Arc<Self>) {
        let (generation, plan) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let Some(plan) = state.execution.plan(&self.query) else {
                return;
            };
            state.generation += 1;
            (state.generation, plan)
        };

        let weak = Arc::downgrade(self);
        let callback: EventCallback = Arc::new(move |event| {
            if let Some(entry) = weak.upgrade() {
                entry.on_event(generation, event);
            }
        });

        debug!(query = %self.id, mode = %plan.mode, generation, "opening listener");
        let opened = self
            .retry
            .run("listen", || self.store.listen(&plan.request, Arc::clone(&callback)));
        match opened {
            Ok(unsubscribe) => {
                let superseded = {
                    let mut state = self.state.lock();
                    if state.closed || state.generation != generation {
                        Some(unsubscribe)
                    } else {
                        state.listener = Some(unsubscribe);
                        None
                    }
                };
                if let Some(unsubscribe) = superseded {
                    debug!(query = %self.id, generation, "releasing listener superseded during setup");
                    unsubscribe.unsubscribe();
                }
            }
            Err(err) => self.advance(generation, err),
        }
    }

    fn on_event(self: &Arc<Self>, generation: u64, event: ListenEvent) {
        let update = {
            let mut state = self.state.lock();
            if state.closed || state.generation != generation {
                return;
            }
            let outcome = match event {
                ListenEvent::Full { documents, seq } => {
                    state.rearms = 0;
                    state.reconciler.apply_full(documents, seq)
                }
                ListenEvent::Incremental { change, seq } => {
                    state.reconciler.apply_change(change, seq)
                }
                ListenEvent::Error(err) => {
                    drop(state);
                    self.on_listener_error(generation, err);
                    return;
                }
            };
            match outcome {
                ApplyOutcome::Applied => state.bump(&self.id),
                ApplyOutcome::Stale => return,
            }
        };
        self.publish(update.0, &update.1);
    }

    /// An established listener reported an error. Transient drops re-open
    /// the listener with backoff until the retry budget is spent; everything
    /// else goes to the degradation state machine.
    fn on_listener_error(self: &Arc<Self>, generation: u64, err: SyncError) {
        if err.is_retryable() && self.rearm(generation, &err) {
            return;
        }
        self.advance(generation, err);
    }

    /// Returns false once no re-arm attempts are left.
    fn rearm(self: &Arc<Self>, generation: u64, err: &SyncError) -> bool {
        let (attempt, previous) = {
            let mut state = self.state.lock();
            if state.closed || state.generation != generation {
                return true;
            }
            if state.rearms + 1 >= self.retry.max_attempts.max(1) {
                return false;
            }
            state.rearms += 1;
            state.generation += 1;
            (state.rearms, state.listener.take())
        };

        if let Some(previous) = previous {
            previous.unsubscribe();
        }
        let delay = self.retry.backoff(attempt);
        warn!(
            query = %self.id,
            error = %err,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "listener interrupted, re-arming"
        );
        thread::sleep(delay);
        self.start_listener();
        true
    }

    /// Feed a listener failure into the degradation state machine.
    fn advance(self: &Arc<Self>, generation: u64, err: SyncError) {
        let (transition, previous) = {
            let mut state = self.state.lock();
            if state.closed || state.generation != generation {
                return;
            }
            let transition = state.execution.on_setup_error(&err);
            match &transition {
                Transition::Degrade => {
                    state.generation += 1;
                    if let Some(plan) = state.execution.plan(&self.query) {
                        state.reconciler.reorder(plan.order, plan.limit);
                    }
                }
                Transition::Fail(_) => state.generation += 1,
                Transition::Unchanged => {}
            }
            (transition, state.listener.take())
        };

        if let Some(previous) = previous {
            previous.unsubscribe();
        }

        match transition {
            Transition::Degrade => {
                info!(query = %self.id, error = %err, "compound query unsupported, degrading");
                self.start_listener();
            }
            Transition::Fail(err) => {
                warn!(query = %self.id, error = %err, "live query failed");
                self.publish_failure(err);
            }
            Transition::Unchanged => {}
        }
    }

    fn publish(&self, revision: u64, snapshot: &QuerySnapshot) {
        let consumers = self.consumers.lock().clone();
        let mut detached = Vec::new();
        for consumer in consumers {
            match consumer.offer_snapshot(revision, snapshot) {
                Offer::Delivered | Offer::Skipped => {}
                Offer::Overflow => detached.push((consumer.id, DropReason::BufferOverflow)),
                Offer::Disconnected => detached.push((consumer.id, DropReason::Disconnected)),
            }
        }
        self.detach_all(detached);
    }

    fn publish_failure(&self, err: SyncError) {
        let consumers = self.consumers.lock().clone();
        let mut detached = Vec::new();
        for consumer in consumers {
            match consumer.send(SubscriptionEvent::Failed(err.clone())) {
                Offer::Delivered | Offer::Skipped => {}
                Offer::Overflow => detached.push((consumer.id, DropReason::BufferOverflow)),
                Offer::Disconnected => detached.push((consumer.id, DropReason::Disconnected)),
            }
        }
        self.detach_all(detached);
    }

    fn detach_all(&self, detached: Vec<(SubscriptionId, DropReason)>) {
        if detached.is_empty() {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        for (id, reason) in detached {
            warn!(query = %self.id, subscription = id.0, ?reason, "dropping consumer");
            registry.detach(&self.id, id, reason);
        }
    }

    /// Bring a consumer that joined an existing entry up to date.
    fn catch_up(&self, consumer: &Consumer) {
        let pending = {
            let state = self.state.lock();
            if let Some(err) = state.execution.failure() {
                Some(Err(err.clone()))
            } else if state.reconciler.is_loaded() {
                let snapshot = state.reconciler.snapshot(&self.id, state.execution.mode());
                Some(Ok((state.revision, snapshot)))
            } else {
                None
            }
        };

        let offer = match pending {
            Some(Ok((revision, snapshot))) => consumer.offer_snapshot(revision, &snapshot),
            Some(Err(err)) => consumer.send(SubscriptionEvent::Failed(err)),
            None => return,
        };
        match offer {
            Offer::Overflow => self.detach_all(vec![(consumer.id, DropReason::BufferOverflow)]),
            Offer::Disconnected => self.detach_all(vec![(consumer.id, DropReason::Disconnected)]),
            Offer::Delivered | Offer::Skipped => {}
        }
    }

    /// Run the current plan once and merge the result through the
    /// sequence-checked refetch path.
    fn refetch(&self, retry: &RetryPolicy) -> Result<ApplyOutcome> {
        let plan = {
            let state = self.state.lock();
            match state.execution.plan(&self.query) {
                Some(plan) => plan,
                None => {
                    return Err(state
                        .execution
                        .failure()
                        .cloned()
                        .unwrap_or_else(|| SyncError::Unknown("query failed".into())))
                }
            }
        };

        let result = retry.run("refetch", || self.store.query(&plan.request))?;

        let update = {
            let mut state = self.state.lock();
            if state.closed || state.execution.mode() != plan.mode {
                return Ok(ApplyOutcome::Stale);
            }
            match state.reconciler.apply_refetch(result) {
                ApplyOutcome::Applied => state.bump(&self.id),
                ApplyOutcome::Stale => return Ok(ApplyOutcome::Stale),
            }
        };
        self.publish(update.0, &update.1);
        Ok(ApplyOutcome::Applied)
    }

    fn set_anchor(&self, anchor: Option<DocId>) {
        self.state.lock().reconciler.set_anchor(anchor);
    }

    fn snapshot(&self) -> Option<QuerySnapshot> {
        let state = self.state.lock();
        state
            .reconciler
            .is_loaded()
            .then(|| state.reconciler.snapshot(&self.id, state.execution.mode()))
    }

    fn has_listener(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    /// Stop for good and release the listener.
    fn shutdown(&self) {
        let listener = {
            let mut state = self.state.lock();
            state.closed = true;
            state.generation += 1;
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.unsubscribe();
            info!(query = %self.id, "listener released");
        } else {
            debug!(query = %self.id, "closed with no listener attached");
        }
    }
}

struct Shared {
    store: Arc<dyn DocumentStore>,
    config: SubscriptionConfig,
    retry: RetryPolicy,
    entries: RwLock<HashMap<QueryId, Arc<QueryEntry>>>,
    next_id: AtomicU64,
}

impl Shared {
    /// Remove one consumer; the last one out shuts the entry down.
    fn detach(&self, query_id: &QueryId, id: SubscriptionId, reason: DropReason) -> bool {
        let (consumer, released) = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get(query_id).cloned() else {
                return false;
            };
            let (consumer, remaining) = {
                let mut consumers = entry.consumers.lock();
                let Some(pos) = consumers.iter().position(|c| c.id == id) else {
                    return false;
                };
                (consumers.remove(pos), consumers.len())
            };
            if remaining == 0 {
                entries.remove(query_id);
                (consumer, Some(entry))
            } else {
                (consumer, None)
            }
        };

        consumer.notify_dropped(reason);
        debug!(query = %query_id, subscription = id.0, "consumer detached");
        if let Some(entry) = released {
            entry.shutdown();
        }
        true
    }
}

/// Owns the lifecycle of live queries.
///
/// Equal queries share one entry, one remote listener and one snapshot.
/// The first consumer opens the listener; the last one to detach releases
/// it. Consumer callbacks never run under a registry lock, so they may open
/// or close subscriptions themselves.
pub struct SubscriptionRegistry {
    shared: Arc<Shared>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: SubscriptionConfig, retry: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                config,
                retry,
                entries: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a callback consumer to `query`.
    pub fn open(
        &self,
        query: LiveQuery,
        on_event: impl Fn(SubscriptionEvent) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        self.attach(query, Sink::Callback(Arc::new(on_event)))
    }

    /// Attach a channel consumer to `query`. The consumer is dropped if its
    /// buffer fills up.
    pub fn open_channel(&self, query: LiveQuery) -> Result<ChannelSubscription> {
        let (sender, receiver) = bounded(self.shared.config.buffer_size);
        let handle = self.attach(query, Sink::Channel(sender))?;
        Ok(ChannelSubscription { handle, receiver })
    }

    fn attach(&self, query: LiveQuery, sink: Sink) -> Result<SubscriptionHandle> {
        let query_id = query.id()?;
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let consumer = Arc::new(Consumer::new(id, sink));

        let (entry, created) = {
            let mut entries = self.shared.entries.write();
            match entries.get(&query_id).cloned() {
                Some(entry) => {
                    entry.consumers.lock().push(Arc::clone(&consumer));
                    (entry, false)
                }
                None => {
                    let entry = Arc::new(QueryEntry::new(
                        query_id.clone(),
                        query,
                        Arc::clone(&self.shared.store),
                        self.shared.retry.clone(),
                        Arc::downgrade(&self.shared),
                    ));
                    entry.consumers.lock().push(Arc::clone(&consumer));
                    entries.insert(query_id.clone(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        let handle = SubscriptionHandle {
            id,
            query_id: query_id.clone(),
            registry: Some(Arc::downgrade(&self.shared)),
        };

        if created {
            info!(query = %query_id, collection = %entry.query.collection, "live query opened");
            entry.start_listener();
        } else {
            debug!(query = %query_id, subscription = id.0, "joined existing live query");
            entry.catch_up(&consumer);
        }
        Ok(handle)
    }

    /// Detach the consumer behind `handle`.
    pub fn close(&self, handle: SubscriptionHandle) {
        handle.close();
    }

    /// Refetch the query behind `handle` and merge the result if it is not
    /// older than what has already been applied.
    pub fn refetch(&self, handle: &SubscriptionHandle) -> Result<ApplyOutcome> {
        self.entry(handle)?.refetch(&self.shared.retry)
    }

    /// Set the selection anchor kept across full replaces.
    pub fn set_anchor(&self, handle: &SubscriptionHandle, anchor: Option<DocId>) -> Result<()> {
        self.entry(handle)?.set_anchor(anchor);
        Ok(())
    }

    /// Latest materialized snapshot, if any has arrived.
    pub fn snapshot(&self, handle: &SubscriptionHandle) -> Result<Option<QuerySnapshot>> {
        Ok(self.entry(handle)?.snapshot())
    }

    /// Number of distinct live queries.
    pub fn active_queries(&self) -> usize {
        self.shared.entries.read().len()
    }

    /// Number of remote listeners currently held.
    pub fn active_listeners(&self) -> usize {
        let entries: Vec<Arc<QueryEntry>> = self.shared.entries.read().values().cloned().collect();
        entries.iter().filter(|e| e.has_listener()).count()
    }

    /// Number of consumers attached to `query_id`.
    pub fn consumer_count(&self, query_id: &QueryId) -> usize {
        let entry = self.shared.entries.read().get(query_id).cloned();
        entry.map_or(0, |e| e.consumers.lock().len())
    }

    fn entry(&self, handle: &SubscriptionHandle) -> Result<Arc<QueryEntry>> {
        self.shared
            .entries
            .read()
            .get(&handle.query_id)
            .filter(|e| e.consumers.lock().iter().any(|c| c.id == handle.id))
            .cloned()
            .ok_or_else(|| SyncError::InvalidArgument(format!("subscription {} is closed", handle.id.0)))
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("active_queries", &self.active_queries())
            .finish()
    }
}

/// A consumer's attachment to a live query. Closing, explicitly or by
/// dropping, detaches it exactly once.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    query_id: QueryId,
    registry: Option<Weak<Shared>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    /// Detach from the live query.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|r| r.upgrade()) {
            registry.detach(&self.query_id, self.id, DropReason::Unsubscribed);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("query_id", &self.query_id)
            .field("open", &self.registry.is_some())
            .finish()
    }
}

/// Channel consumer: a handle plus the receiving end of its buffer.
pub struct ChannelSubscription {
    pub handle: SubscriptionHandle,
    pub receiver: Receiver<SubscriptionEvent>,
}

impl ChannelSubscription {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> std::result::Result<SubscriptionEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<SubscriptionEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<SubscriptionEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn close(self) {
        self.handle.close();
    }
}
