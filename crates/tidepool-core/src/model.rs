// ── Model ──
//
// Per-collection context owned by a session: the live query registry,
// plain model events with refcounted remote subscriptions, and thin
// passthroughs for remote writes.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use strum::IntoEnumIterator;
use tidepool_rpc::PushHandlers;
use tracing::{debug, warn};

use crate::document::ID_FIELD;
use crate::emitter::{Emitter, ListenerId, Registration};
use crate::error::CoreError;
use crate::live::{Handle, LiveQuery, LiveQueryRegistry, Mutation, MutationKind};
use crate::query::QueryDescriptor;
use crate::session::{Lifecycle, SessionShared};

/// A named remote collection. Cheap to clone.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

pub(crate) struct ModelInner {
    pub(crate) name: String,
    pub(crate) session: Arc<SessionShared>,
    pub(crate) registry: LiveQueryRegistry,
    events: Emitter<String, Value>,
    resubscribers: DashMap<String, Vec<(Lifecycle, ListenerId)>>,
}

impl ModelInner {
    pub(crate) async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CoreError> {
        let path = format!("{}.{}.{method}", self.session.namespace, self.name);
        let response = self.session.rpc.call(&path, params);
        Ok(response.await?)
    }

    async fn subscribe(&self, event: &str) -> Result<(), CoreError> {
        self.session.authorization_settled().await;
        self.call("subscribe", vec![Value::from(event)]).await?;
        debug!(model = %self.name, event, "subscribed to model event");
        Ok(())
    }

    /// Route a live query push (`[handle, payload, hint]`) to its query.
    fn dispatch(&self, kind: MutationKind, params: Vec<Value>) {
        let mut args = params.into_iter();
        let Some(handle) = args.next().as_ref().and_then(Handle::from_wire) else {
            warn!(model = %self.name, %kind, "push without a live query handle, ignoring");
            return;
        };
        let Some(live_query) = self.registry.get(handle) else {
            warn!(model = %self.name, %handle, %kind, "push for unknown live query, ignoring");
            return;
        };
        live_query.receive(Mutation {
            kind,
            payload: args.next().unwrap_or(Value::Null),
            hint: args.next().unwrap_or(Value::Null),
        });
    }
}

impl Model {
    pub(crate) fn new(name: &str, session: Arc<SessionShared>) -> Self {
        Self {
            inner: Arc::new(ModelInner {
                name: name.to_owned(),
                session,
                registry: LiveQueryRegistry::new(),
                events: Emitter::new(),
                resubscribers: DashMap::new(),
            }),
        }
    }

    /// Handlers for the `add`/`update`/`remove`/`distinctSync` pushes.
    pub(crate) fn push_handlers(&self) -> PushHandlers {
        MutationKind::iter().fold(PushHandlers::new(), |handlers, kind| {
            let weak = Arc::downgrade(&self.inner);
            handlers.with(
                kind.as_ref(),
                Arc::new(move |params: Vec<Value>| {
                    if let Some(model) = weak.upgrade() {
                        model.dispatch(kind, params);
                    }
                }),
            )
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn registry(&self) -> &LiveQueryRegistry {
        &self.inner.registry
    }

    // ── Live queries ─────────────────────────────────────────────────

    /// Build an unexecuted live query.
    pub fn live_query(&self, query: QueryDescriptor) -> LiveQuery {
        LiveQuery::new(&self.inner, query)
    }

    /// Build and execute a live query.
    pub async fn watch(&self, query: QueryDescriptor) -> Result<LiveQuery, CoreError> {
        self.live_query(query).exec().await
    }

    /// Stop `previous` (when it was executed) and build a fresh,
    /// unexecuted live query with the same descriptor.
    pub async fn live_query_from(&self, previous: &LiveQuery) -> Result<LiveQuery, CoreError> {
        if previous.handle().is_some() && !previous.is_stopped() {
            previous.stop().await?;
        }
        Ok(self.live_query(previous.query().clone()))
    }

    // ── Plain model events ───────────────────────────────────────────

    /// Listen for a model event. The first listener for `event` subscribes
    /// on the server and keeps the subscription alive across reconnects.
    pub async fn on<F>(&self, event: &str, handler: F) -> Result<Registration, CoreError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let registration = self.inner.events.on(event.to_owned(), handler);
        if registration.listeners == 1 {
            self.install_resubscriber(event);
            if let Err(e) = self.inner.subscribe(event).await {
                // Roll back so the next listener retries the subscribe.
                self.inner.events.off(&event.to_owned(), Some(registration.id));
                self.remove_resubscriber(event);
                return Err(e);
            }
        }
        Ok(registration)
    }

    /// Remove one listener (or all, with `None`). When none remain the
    /// server subscription is dropped. Returns the listeners left.
    pub async fn off(&self, event: &str, id: Option<ListenerId>) -> Result<usize, CoreError> {
        let key = event.to_owned();
        if self.inner.events.listener_count(&key) == 0 {
            return Ok(0);
        }
        let left = self.inner.events.off(&key, id);
        if left == 0 {
            self.remove_resubscriber(event);
            self.inner
                .call("unsubscribe", vec![Value::from(event)])
                .await?;
            debug!(model = %self.inner.name, event, "unsubscribed from model event");
        }
        Ok(left)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.events.listener_count(&event.to_owned())
    }

    pub(crate) fn emit_schema_event(&self, event: &str, doc: &Value) {
        self.inner.events.emit(&event.to_owned(), doc);
    }

    fn install_resubscriber(&self, event: &str) {
        let lifecycle = &self.inner.session.lifecycle;
        let hooks = [Lifecycle::Reconnect, Lifecycle::AuthSuccess].map(|kind| {
            let weak = Arc::downgrade(&self.inner);
            let event = event.to_owned();
            let registration = lifecycle.on(kind, move |_| {
                let Some(model) = weak.upgrade() else {
                    return;
                };
                let event = event.clone();
                tokio::spawn(async move {
                    if let Err(e) = model.subscribe(&event).await {
                        warn!(model = %model.name, event = %event, error = %e, "resubscribe failed");
                    }
                });
            });
            (kind, registration.id)
        });
        self.inner
            .resubscribers
            .insert(event.to_owned(), hooks.to_vec());
    }

    fn remove_resubscriber(&self, event: &str) {
        if let Some((_, hooks)) = self.inner.resubscribers.remove(event) {
            for (kind, id) in hooks {
                self.inner.session.lifecycle.off(&kind, Some(id));
            }
        }
    }

    // ── Remote writes ────────────────────────────────────────────────

    pub async fn create(&self, doc: Value) -> Result<Value, CoreError> {
        self.inner.call("create", vec![doc]).await
    }

    pub async fn update(&self, doc: Value) -> Result<Value, CoreError> {
        self.inner.call("update", vec![doc]).await
    }

    /// Remove by document (its `_id` is used) or by bare identifier.
    pub async fn remove(&self, target: &Value) -> Result<Value, CoreError> {
        let id = match target {
            Value::Object(fields) => fields.get(ID_FIELD).cloned().ok_or_else(|| {
                CoreError::invalid_state("document to remove has no _id")
            })?,
            other => other.clone(),
        };
        self.inner.call("remove", vec![id]).await
    }

    /// Add `item` to the array at `path` of the document matching `query`.
    pub async fn add_to_set(&self, query: Value, path: &str, item: Value) -> Result<Value, CoreError> {
        self.inner
            .call("addToSet", vec![query, Value::from(path), item])
            .await
    }

    pub async fn remove_from_set(
        &self,
        query: Value,
        path: &str,
        item: Value,
    ) -> Result<Value, CoreError> {
        self.inner
            .call("removeFromSet", vec![query, Value::from(path), item])
            .await
    }

    /// Field paths declared by the model's schema.
    pub async fn list_paths(&self) -> Result<Vec<String>, CoreError> {
        let paths = self.inner.call("listPaths", Vec::new()).await?;
        serde_json::from_value(paths).map_err(|e| CoreError::Remote {
            method: format!("{}.{}.listPaths", self.inner.session.namespace, self.inner.name),
            message: format!("unexpected response: {e}"),
            code: None,
        })
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.inner.name)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}
