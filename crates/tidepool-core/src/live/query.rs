// ── Live query ──
//
// One live query: its descriptor, execution phase, materialized result
// and local event emitter. Server pushes are folded here; while the
// initial fetch is in flight they are buffered and replayed in arrival
// order once the snapshot has been applied.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde_json::Value;
use strum::{AsRefStr, Display};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::registry::{Handle, Registered};
use super::result::{LiveResult, Mutation, MutationKind};
use super::stream::ResultStream;
use crate::document::Document;
use crate::emitter::{Emitter, ListenerId, Subscription};
use crate::error::CoreError;
use crate::model::ModelInner;
use crate::query::QueryDescriptor;
use crate::session::Lifecycle;

// ── Phase ────────────────────────────────────────────────────────────

/// Execution phase of a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    /// Built but never executed; holds no handle.
    Unexecuted,
    /// Initial fetch (or resync) in flight; pushes are buffered.
    Pending,
    /// Snapshot applied; pushes are folded as they arrive.
    Live,
    /// The transport dropped or a fetch failed; pushes are ignored until
    /// the next resync.
    Interrupted,
    /// Unsubscribed. Terminal.
    Stopped,
}

// ── Local events ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum LiveEventKind {
    Init,
    Add,
    Update,
    Remove,
    DistinctSync,
    Error,
}

impl From<MutationKind> for LiveEventKind {
    fn from(kind: MutationKind) -> Self {
        match kind {
            MutationKind::Add => Self::Add,
            MutationKind::Update => Self::Update,
            MutationKind::Remove => Self::Remove,
            MutationKind::DistinctSync => Self::DistinctSync,
        }
    }
}

/// Payload delivered to live query listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Raw initial-fetch response, after the result was seeded.
    Init(Value),
    /// A mutation that changed the result.
    Mutation(Mutation),
    /// A mutation that could not be folded.
    Error { mutation: Mutation, message: String },
}

impl LiveEvent {
    pub fn kind(&self) -> LiveEventKind {
        match self {
            Self::Init(_) => LiveEventKind::Init,
            Self::Mutation(m) => m.kind.into(),
            Self::Error { .. } => LiveEventKind::Error,
        }
    }
}

// ── LiveQuery ────────────────────────────────────────────────────────

/// Handle to a live query. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LiveQuery {
    inner: Arc<LiveQueryInner>,
}

struct LiveQueryInner {
    model: Weak<ModelInner>,
    model_name: String,
    query: QueryDescriptor,
    state: Mutex<LiveState>,
    phase: watch::Sender<Phase>,
    result: watch::Sender<Arc<LiveResult>>,
    events: Emitter<LiveEventKind, LiveEvent>,
}

#[derive(Default)]
struct LiveState {
    handle: Option<Handle>,
    key: Option<String>,
    buffer: VecDeque<Mutation>,
    hooks: Vec<(Lifecycle, ListenerId)>,
    /// Bumped on every execution so a superseded snapshot is discarded.
    epoch: u64,
    last_synced: Option<DateTime<Utc>>,
}

type Outcome = (Mutation, Result<bool, CoreError>);

impl LiveQuery {
    pub(crate) fn new(model: &Arc<ModelInner>, query: QueryDescriptor) -> Self {
        let (phase, _) = watch::channel(Phase::Unexecuted);
        let (result, _) = watch::channel(Arc::new(LiveResult::empty(query.shape())));
        Self {
            inner: Arc::new(LiveQueryInner {
                model: Arc::downgrade(model),
                model_name: model.name.clone(),
                query,
                state: Mutex::new(LiveState::default()),
                phase,
                result,
                events: Emitter::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LiveState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn model(&self) -> Result<Arc<ModelInner>, CoreError> {
        self.inner
            .model
            .upgrade()
            .ok_or_else(|| CoreError::invalid_state("the owning session has been dropped"))
    }

    /// Phase changes happen only while the state lock is held.
    fn set_phase(&self, phase: Phase) {
        self.inner.phase.send_replace(phase);
    }

    pub(crate) fn assign(&self, handle: Handle, key: String) {
        let mut state = self.state();
        state.handle = Some(handle);
        state.key = Some(key);
    }

    pub(crate) fn ptr_eq(&self, other: &LiveQuery) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn query(&self) -> &QueryDescriptor {
        &self.inner.query
    }

    pub fn model_name(&self) -> &str {
        &self.inner.model_name
    }

    pub fn handle(&self) -> Option<Handle> {
        self.state().handle
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    /// `true` once the query no longer receives pushes: after a
    /// disconnect (until resynced) or after `stop()`.
    pub fn is_stopped(&self) -> bool {
        matches!(self.phase(), Phase::Interrupted | Phase::Stopped)
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.state().last_synced
    }

    /// Current materialized result.
    pub fn result(&self) -> Arc<LiveResult> {
        self.inner.result.borrow().clone()
    }

    pub fn docs(&self) -> Vec<Document> {
        self.result().docs().to_vec()
    }

    pub fn doc(&self) -> Option<Document> {
        self.result().doc().cloned()
    }

    pub fn count(&self) -> Option<i64> {
        self.result().count()
    }

    pub fn values(&self) -> Vec<Value> {
        self.result().values().map(<[Value]>::to_vec).unwrap_or_default()
    }

    pub fn get_doc_by_id(&self, id: &Value) -> Option<Document> {
        self.result().get_doc_by_id(id).cloned()
    }

    /// Subscribe to result snapshots.
    pub fn watch(&self) -> ResultStream {
        ResultStream::new(self.inner.result.subscribe())
    }

    // ── Listeners ────────────────────────────────────────────────────

    pub fn on<F>(&self, kind: LiveEventKind, handler: F) -> Subscription
    where
        F: Fn(&LiveEvent) + Send + Sync + 'static,
    {
        let registration = self.inner.events.on(kind, handler);
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.events.off(&kind, Some(registration.id));
            }
        })
    }

    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(LiveEventKind, &LiveEvent) + Send + Sync + 'static,
    {
        let id = self.inner.events.on_any(move |kind, event| handler(*kind, event));
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.events.off_any(id);
            }
        })
    }

    pub fn listener_count(&self, kind: LiveEventKind) -> usize {
        self.inner.events.listener_count(&kind)
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Execute the query live.
    ///
    /// The first call validates the descriptor and registers it with the
    /// model. When an identical query is already live, that instance is
    /// returned instead and no request is made; it may still be pending,
    /// so await [`ready`](Self::ready) before reading its result. Calling
    /// `exec` again on a registered query refetches its snapshot.
    pub async fn exec(&self) -> Result<LiveQuery, CoreError> {
        let model = self.model()?;

        if self.state().key.is_none() {
            self.inner.query.classification().check_live()?;
            match model.registry.register(self) {
                Registered::Existing(existing) => {
                    debug!(
                        model = %self.inner.model_name,
                        handle = ?existing.handle(),
                        "reusing identical live query"
                    );
                    return Ok(existing);
                }
                Registered::Fresh(handle) => {
                    debug!(model = %self.inner.model_name, %handle, "registered live query");
                }
            }
        }

        self.execute(&model).await?;
        Ok(self.clone())
    }

    /// Wait until the pending fetch settles.
    pub async fn ready(&self) -> Result<(), CoreError> {
        let mut phases = self.inner.phase.subscribe();
        let phase = *phases
            .wait_for(|phase| *phase != Phase::Pending)
            .await
            .map_err(|_| CoreError::Internal("live query phase channel closed".into()))?;

        match phase {
            Phase::Live => Ok(()),
            Phase::Interrupted => Err(CoreError::Disconnected),
            Phase::Unexecuted => Err(CoreError::invalid_state("live query was never executed")),
            Phase::Stopped | Phase::Pending => {
                Err(CoreError::invalid_state("live query has been stopped"))
            }
        }
    }

    /// Fetch a fresh snapshot and go live. Used for the first execution
    /// and for every resync; the handle never changes.
    async fn execute(&self, model: &Arc<ModelInner>) -> Result<(), CoreError> {
        let (handle, epoch) = {
            let mut state = self.state();
            if self.phase() == Phase::Stopped {
                return Err(CoreError::invalid_state("live query has been stopped"));
            }
            let handle = state
                .handle
                .ok_or_else(|| CoreError::invalid_state("live query is not registered"))?;
            state.epoch += 1;
            state.buffer.clear();
            self.set_phase(Phase::Pending);
            (handle, state.epoch)
        };

        model.session.authorization_settled().await;
        let params = vec![self.inner.query.to_wire(), Value::from(handle)];
        let fetched = model.call("liveQuery", params).await.and_then(|response| {
            let snapshot = LiveResult::from_snapshot(self.inner.query.shape(), &response)?;
            Ok((response, snapshot))
        });

        let (response, snapshot) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                let state = self.state();
                if self.current_epoch_pending(&state, epoch) {
                    self.set_phase(Phase::Interrupted);
                }
                warn!(
                    model = %self.inner.model_name,
                    %handle,
                    error = %e,
                    "live query fetch failed"
                );
                return Err(e);
            }
        };

        let outcomes: Vec<Outcome> = {
            let mut state = self.state();
            if !self.current_epoch_pending(&state, epoch) {
                debug!(%handle, "discarding superseded live query snapshot");
                if self.phase() == Phase::Stopped {
                    return Err(CoreError::invalid_state("live query has been stopped"));
                }
                return Ok(());
            }
            self.inner.result.send_replace(Arc::new(snapshot));
            let buffered = std::mem::take(&mut state.buffer);
            let outcomes = buffered
                .into_iter()
                .map(|mutation| {
                    let outcome = self.fold(&mutation);
                    (mutation, outcome)
                })
                .collect();
            state.last_synced = Some(Utc::now());
            self.set_phase(Phase::Live);
            outcomes
        };

        info!(
            model = %self.inner.model_name,
            %handle,
            replayed = outcomes.len(),
            "live query synced"
        );
        self.inner
            .events
            .emit(&LiveEventKind::Init, &LiveEvent::Init(response));
        for (mutation, outcome) in outcomes {
            self.announce(handle, mutation, outcome);
        }

        self.install_hooks(model);
        Ok(())
    }

    fn current_epoch_pending(&self, state: &LiveState, epoch: u64) -> bool {
        state.epoch == epoch && self.phase() == Phase::Pending
    }

    /// Arrange resync after reconnect (anonymous users) or after
    /// re-authorization (authorized users), and interruption on
    /// disconnect. Installed once per live query.
    fn install_hooks(&self, model: &ModelInner) {
        if !self.state().hooks.is_empty() {
            return;
        }

        let lifecycle = &model.session.lifecycle;
        let resync_on = if model.session.is_authorized() {
            Lifecycle::AuthSuccess
        } else {
            Lifecycle::Reconnect
        };

        let weak = Arc::downgrade(&self.inner);
        let disconnect = lifecycle.on(Lifecycle::Disconnect, move |_| {
            if let Some(inner) = weak.upgrade() {
                LiveQuery { inner }.interrupt();
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let resync = lifecycle.on(resync_on, move |_| {
            if let Some(inner) = weak.upgrade() {
                let live_query = LiveQuery { inner };
                tokio::spawn(async move { live_query.resync().await });
            }
        });

        let hooks = vec![
            (Lifecycle::Disconnect, disconnect.id),
            (resync_on, resync.id),
        ];
        let mut state = self.state();
        if self.phase() == Phase::Stopped || !state.hooks.is_empty() {
            drop(state);
            for (kind, id) in hooks {
                lifecycle.off(&kind, Some(id));
            }
        } else {
            state.hooks = hooks;
        }
    }

    async fn resync(&self) {
        let model = match self.model() {
            Ok(model) => model,
            Err(e) => {
                debug!(error = %e, "skipping resync");
                return;
            }
        };
        if self.phase() == Phase::Stopped {
            return;
        }
        info!(model = %self.inner.model_name, handle = ?self.handle(), "resyncing live query");
        if let Err(e) = self.execute(&model).await {
            warn!(
                model = %self.inner.model_name,
                handle = ?self.handle(),
                error = %e,
                "live query resync failed"
            );
        }
    }

    fn interrupt(&self) {
        let mut state = self.state();
        if matches!(self.phase(), Phase::Pending | Phase::Live) {
            state.buffer.clear();
            self.set_phase(Phase::Interrupted);
            debug!(model = %self.inner.model_name, handle = ?state.handle, "live query interrupted");
        }
    }

    // ── Server pushes ────────────────────────────────────────────────

    pub(crate) fn receive(&self, mutation: Mutation) {
        let mut state = self.state();
        let Some(handle) = state.handle else {
            return;
        };
        match self.phase() {
            Phase::Pending => state.buffer.push_back(mutation),
            Phase::Live => {
                let outcome = self.fold(&mutation);
                drop(state);
                self.announce(handle, mutation, outcome);
            }
            phase => {
                debug!(%handle, %phase, kind = %mutation.kind, "ignoring push for inactive live query");
            }
        }
    }

    fn fold(&self, mutation: &Mutation) -> Result<bool, CoreError> {
        let limit = self.inner.query.classification().limit();
        let mut outcome = Ok(false);
        self.inner.result.send_if_modified(|result| {
            outcome = Arc::make_mut(result).apply(mutation, limit);
            matches!(outcome, Ok(true))
        });
        outcome
    }

    fn announce(&self, handle: Handle, mutation: Mutation, outcome: Result<bool, CoreError>) {
        match outcome {
            Ok(true) => {
                let kind = LiveEventKind::from(mutation.kind);
                self.inner.events.emit(&kind, &LiveEvent::Mutation(mutation));
            }
            Ok(false) => {}
            Err(e) => {
                error!(
                    model = %self.inner.model_name,
                    %handle,
                    kind = %mutation.kind,
                    error = %e,
                    "failed to fold live query mutation"
                );
                let event = LiveEvent::Error {
                    mutation,
                    message: e.to_string(),
                };
                self.inner.events.emit(&LiveEventKind::Error, &event);
            }
        }
    }

    // ── Stop ─────────────────────────────────────────────────────────

    /// Unsubscribe from the server and drop out of the registry.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let model = self.model()?;
        let handle = self
            .handle()
            .filter(|h| model.registry.contains(*h))
            .ok_or_else(|| {
                CoreError::invalid_state("there must be a valid handle when stop is called")
            })?;

        let hooks = {
            let mut state = self.state();
            state.buffer.clear();
            self.set_phase(Phase::Stopped);
            std::mem::take(&mut state.hooks)
        };
        for (kind, id) in hooks {
            model.session.lifecycle.off(&kind, Some(id));
        }

        model.call("unsubLQ", vec![Value::from(handle)]).await?;
        model.registry.unregister(self)?;
        info!(model = %self.inner.model_name, %handle, "live query stopped");
        Ok(())
    }
}

impl fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("model", &self.inner.model_name)
            .field("handle", &self.handle())
            .field("phase", &self.phase())
            .field("shape", &self.inner.query.shape())
            .finish_non_exhaustive()
    }
}
