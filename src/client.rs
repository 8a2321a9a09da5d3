//! Top-level client tying subscriptions and mutations together.

use crate::cache::{ApplyOutcome, QuerySnapshot, Reconciler};
use crate::error::{Result, SyncError};
use crate::mutations::{CreateAndIncrement, FieldSchema, MutationCoordinator, MutationOutcome, MutationRequest};
use crate::query::{LiveQuery, QueryExecution, Transition};
use crate::retry::RetryPolicy;
use crate::store::DocumentStore;
use crate::subscriptions::{
    ChannelSubscription, SubscriptionConfig, SubscriptionEvent, SubscriptionHandle,
    SubscriptionRegistry,
};
use crate::types::{DocId, DocRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Configuration for a [`SyncClient`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Backoff for transient store failures.
    pub retry: RetryPolicy,

    /// Subscription delivery settings.
    pub subscriptions: SubscriptionConfig,

    /// Declared set fields.
    /// Default: the social platform schema
    pub schema: FieldSchema,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            subscriptions: SubscriptionConfig::default(),
            schema: FieldSchema::social(),
        }
    }
}

/// Real-time sync layer over a remote document store.
pub struct SyncClient {
    store: Arc<dyn DocumentStore>,
    registry: SubscriptionRegistry,
    mutations: MutationCoordinator,
    retry: RetryPolicy,
}

impl SyncClient {
    pub fn new(store: Arc<dyn DocumentStore>, config: SyncConfig) -> Self {
        info!(
            fields = config.schema.len(),
            max_attempts = config.retry.max_attempts,
            "sync client ready"
        );
        Self {
            registry: SubscriptionRegistry::new(
                Arc::clone(&store),
                config.subscriptions,
                config.retry.clone(),
            ),
            mutations: MutationCoordinator::new(
                Arc::clone(&store),
                config.schema,
                config.retry.clone(),
            ),
            store,
            retry: config.retry,
        }
    }

    // --- Subscriptions ---

    /// Subscribe to a live query with a callback.
    pub fn subscribe(
        &self,
        query: LiveQuery,
        on_change: impl Fn(SubscriptionEvent) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        self.registry.open(query, on_change)
    }

    /// Subscribe to a live query through a bounded channel.
    pub fn subscribe_channel(&self, query: LiveQuery) -> Result<ChannelSubscription> {
        self.registry.open_channel(query)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.registry.close(handle);
    }

    /// Explicit refetch for write flows the store does not push.
    pub fn refetch(&self, handle: &SubscriptionHandle) -> Result<ApplyOutcome> {
        self.registry.refetch(handle)
    }

    pub fn set_anchor(&self, handle: &SubscriptionHandle, anchor: Option<DocId>) -> Result<()> {
        self.registry.set_anchor(handle, anchor)
    }

    pub fn snapshot(&self, handle: &SubscriptionHandle) -> Result<Option<QuerySnapshot>> {
        self.registry.snapshot(handle)
    }

    /// One-shot read with the same degradation rules as a live query.
    pub fn fetch_once(&self, query: &LiveQuery) -> Result<QuerySnapshot> {
        let query_id = query.id()?;
        let mut execution = QueryExecution::new();

        loop {
            let Some(plan) = execution.plan(query) else {
                return Err(execution
                    .failure()
                    .cloned()
                    .unwrap_or_else(|| SyncError::Unknown("query failed".into())));
            };

            match self.retry.run("fetch_once", || self.store.query(&plan.request)) {
                Ok(result) => {
                    let mut reconciler = Reconciler::new(plan.order, plan.limit);
                    reconciler.apply_refetch(result);
                    return Ok(reconciler.snapshot(&query_id, plan.mode));
                }
                Err(err) => match execution.on_setup_error(&err) {
                    Transition::Degrade => {
                        info!(query = %query_id, error = %err, "one-shot query unsupported, degrading");
                    }
                    Transition::Fail(err) => return Err(err),
                    Transition::Unchanged => return Err(err),
                },
            }
        }
    }

    // --- Mutations ---

    pub fn mutate_set(&self, request: &MutationRequest) -> Result<MutationOutcome> {
        self.mutations.mutate_set(request)
    }

    /// Create a record and bump its parent in one commit.
    pub fn create_and_increment(&self, request: &CreateAndIncrement) -> Result<DocRef> {
        self.mutations.apply_create_and_increment(request)
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    // --- Introspection ---

    pub fn active_queries(&self) -> usize {
        self.registry.active_queries()
    }

    pub fn active_listeners(&self) -> usize {
        self.registry.active_listeners()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ExecutionMode, Filter, OrderSpec};
    use crate::store::{MemoryStore, MemoryStoreConfig};
    use crate::types::{Document, Timestamp};
    use serde_json::json;

    #[test]
    fn test_config_loads_with_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"retry": {"max_attempts": 2}}"#).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 25);
        assert_eq!(config.subscriptions.buffer_size, 256);
        assert_eq!(config.schema, FieldSchema::social());
    }

    #[test]
    fn test_fetch_once_degrades_and_orders_locally() {
        let store = Arc::new(MemoryStore::with_config(MemoryStoreConfig {
            require_composite_indexes: true,
            ..Default::default()
        }));
        store.seed(
            "podPosts",
            Document::new("a", json!({"podId": "p1"})).with_create_time(Timestamp(10)),
        );
        store.seed(
            "podPosts",
            Document::new("b", json!({"podId": "p1"})).with_create_time(Timestamp(30)),
        );
        store.seed("podPosts", Document::new("c", json!({"podId": "p1"})));
        store.seed(
            "podPosts",
            Document::new("d", json!({"podId": "p2"})).with_create_time(Timestamp(50)),
        );

        let client = SyncClient::new(store, SyncConfig::default());
        let query = LiveQuery::new("podPosts")
            .filter(Filter::eq("podId", json!("p1")))
            .order_by(OrderSpec::desc("createdAt"))
            .limit(2);

        let snapshot = client.fetch_once(&query).unwrap();
        assert_eq!(snapshot.mode, ExecutionMode::Degraded);
        assert_eq!(snapshot.ids(), vec!["c", "b"]);
    }

    #[test]
    fn test_fetch_once_surfaces_permission_denied() {
        let store = Arc::new(MemoryStore::new());
        store.deny_collection("startups");
        let client = SyncClient::new(store, SyncConfig::default());

        let err = client.fetch_once(&LiveQuery::new("startups")).unwrap_err();
        assert!(matches!(err, SyncError::PermissionDenied(_)));
    }
}
