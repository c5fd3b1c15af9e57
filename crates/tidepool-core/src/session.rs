// ── Session ──
//
// Client root. Owns the RPC channel, the per-collection models, the
// authorized user, and the local lifecycle emitter that live queries and
// model subscriptions hook into for resync.

use std::fmt;
use std::sync::{Arc, Weak};

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;
use tidepool_rpc::{PushHandlers, RpcChannel, TransportEvent, WsRpcClient};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::emitter::{Emitter, Subscription};
use crate::error::CoreError;
use crate::model::Model;

// ── Lifecycle ────────────────────────────────────────────────────────

/// Session lifecycle signals consumed by resync hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "camelCase")]
pub enum Lifecycle {
    Disconnect,
    Reconnect,
    AuthSuccess,
}

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

// ── User ─────────────────────────────────────────────────────────────

/// The user the server authorized this session as.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// 0 for anonymous users.
    #[serde(default)]
    pub privilege_level: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl User {
    pub fn is_authorized(&self) -> bool {
        self.privilege_level > 0
    }
}

// ── Shared state ─────────────────────────────────────────────────────

pub(crate) struct SessionShared {
    pub(crate) rpc: Arc<dyn RpcChannel>,
    pub(crate) namespace: String,
    pub(crate) lifecycle: Emitter<Lifecycle, ()>,
    user: ArcSwap<User>,
    auth_args: ArcSwapOption<Vec<Value>>,
    /// Held for writing while an authorize call is in flight.
    auth_gate: Arc<RwLock<()>>,
}

impl SessionShared {
    pub(crate) fn is_authorized(&self) -> bool {
        self.user.load().is_authorized()
    }

    /// Resolves once no authorization is in flight.
    pub(crate) async fn authorization_settled(&self) {
        drop(self.auth_gate.read().await);
    }

    async fn authorize_locked(
        &self,
        args: Vec<Value>,
        gate: OwnedRwLockWriteGuard<()>,
    ) -> Result<User, CoreError> {
        let method = format!("{}.authorize", self.namespace);
        let outcome = match self.rpc.call(&method, args.clone()).await {
            Ok(value) => {
                serde_json::from_value::<User>(value).map_err(|e| CoreError::AuthorizationFailed {
                    message: format!("unexpected user payload: {e}"),
                })
            }
            Err(tidepool_rpc::Error::Remote { message, .. }) => {
                Err(CoreError::AuthorizationFailed { message })
            }
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(user) => {
                self.user.store(Arc::new(user.clone()));
                self.auth_args.store(Some(Arc::new(args)));
                drop(gate);
                info!(privilege_level = user.privilege_level, "authorized");
                self.lifecycle.emit(&Lifecycle::AuthSuccess, &());
                Ok(user)
            }
            Err(e) => {
                drop(gate);
                warn!(error = %e, "authorization failed");
                Err(e)
            }
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────

/// Entry point for consumers. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    shared: Arc<SessionShared>,
    models: Arc<DashMap<String, Model>>,
    connection: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Session {
    /// Open a WebSocket session and authorize when credentials are
    /// configured.
    pub async fn connect(config: SessionConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let client = WsRpcClient::connect(config.url.clone(), config.rpc_config(), cancel.clone());
        info!(url = %config.url, namespace = %config.namespace, "connecting");

        let session = Self::build(Arc::new(client), &config.namespace, cancel);
        if let Some(auth) = &config.auth {
            session.authorize(auth.to_args()).await?;
        }
        Ok(session)
    }

    /// Build a session over an existing channel. Must be called inside a
    /// tokio runtime.
    pub fn with_channel(rpc: Arc<dyn RpcChannel>, namespace: impl Into<String>) -> Self {
        Self::build(rpc, &namespace.into(), CancellationToken::new())
    }

    fn build(rpc: Arc<dyn RpcChannel>, namespace: &str, cancel: CancellationToken) -> Self {
        let transport = rpc.lifecycle();
        let shared = Arc::new(SessionShared {
            rpc,
            namespace: namespace.to_owned(),
            lifecycle: Emitter::new(),
            user: ArcSwap::from_pointee(User::default()),
            auth_args: ArcSwapOption::empty(),
            auth_gate: Arc::new(RwLock::new(())),
        });
        let models: Arc<DashMap<String, Model>> = Arc::new(DashMap::new());
        let (connection, _) = watch::channel(ConnectionState::Connecting);

        shared
            .rpc
            .expose(namespace, schema_event_handlers(Arc::downgrade(&models)));

        tokio::spawn(lifecycle_task(
            Arc::clone(&shared),
            transport,
            connection.clone(),
            cancel.clone(),
        ));

        Self {
            inner: Arc::new(SessionInner {
                shared,
                models,
                connection,
                cancel,
            }),
        }
    }

    /// The model for a remote collection, created (and its push handlers
    /// exposed) on first use.
    pub fn model(&self, name: &str) -> Model {
        if let Some(model) = self.inner.models.get(name) {
            return model.clone();
        }
        self.inner
            .models
            .entry(name.to_owned())
            .or_insert_with(|| {
                let model = Model::new(name, Arc::clone(&self.inner.shared));
                let namespace = format!("{}.{name}", self.inner.shared.namespace);
                self.inner.shared.rpc.expose(&namespace, model.push_handlers());
                debug!(model = name, "model created");
                model
            })
            .clone()
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.models.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn namespace(&self) -> &str {
        &self.inner.shared.namespace
    }

    // ── Authorization ────────────────────────────────────────────────

    /// Authorize with the server. The arguments are remembered and sent
    /// again after every reconnect.
    pub async fn authorize(&self, args: Vec<Value>) -> Result<User, CoreError> {
        let gate = Arc::clone(&self.inner.shared.auth_gate).write_owned().await;
        self.inner.shared.authorize_locked(args, gate).await
    }

    pub async fn deauthorize(&self) -> Result<(), CoreError> {
        let method = format!("{}.deAuthorize", self.inner.shared.namespace);
        self.inner.shared.rpc.call(&method, Vec::new()).await?;
        self.inner.shared.user.store(Arc::new(User::default()));
        self.inner.shared.auth_args.store(None);
        info!("deauthorized");
        Ok(())
    }

    pub fn user(&self) -> Arc<User> {
        self.inner.shared.user.load_full()
    }

    pub fn is_authorized(&self) -> bool {
        self.inner.shared.is_authorized()
    }

    /// Models the server exposes.
    pub async fn list_models(&self) -> Result<Value, CoreError> {
        let method = format!("{}.getModels", self.inner.shared.namespace);
        Ok(self.inner.shared.rpc.call(&method, Vec::new()).await?)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    pub fn on_lifecycle<F>(&self, kind: Lifecycle, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let registration = self.inner.shared.lifecycle.on(kind, move |_| handler());
        let weak = Arc::downgrade(&self.inner.shared);
        Subscription::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.lifecycle.off(&kind, Some(registration.id));
            }
        })
    }

    /// Stop reacting to transport events. Live queries stay registered
    /// but are no longer resynced.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("namespace", &self.inner.shared.namespace)
            .field("models", &self.model_names())
            .field("authorized", &self.is_authorized())
            .finish_non_exhaustive()
    }
}

/// `schemaEvent` pushes carry `{modelName, evName, doc}` and are re-emitted
/// on the matching model.
fn schema_event_handlers(models: Weak<DashMap<String, Model>>) -> PushHandlers {
    PushHandlers::new().with(
        "schemaEvent",
        Arc::new(move |params: Vec<Value>| {
            let Some(models) = models.upgrade() else {
                return;
            };
            let Some(details) = params.first() else {
                warn!("schemaEvent without payload, ignoring");
                return;
            };
            let (Some(model_name), Some(event)) = (
                details.get("modelName").and_then(Value::as_str),
                details.get("evName").and_then(Value::as_str),
            ) else {
                warn!(%details, "malformed schemaEvent, ignoring");
                return;
            };
            let model = models.get(model_name).map(|m| m.value().clone());
            match model {
                Some(model) => {
                    let doc = details.get("doc").cloned().unwrap_or(Value::Null);
                    model.emit_schema_event(event, &doc);
                }
                None => debug!(model = model_name, event, "schemaEvent for unused model"),
            }
        }),
    )
}

// ── Background task ──────────────────────────────────────────────────

/// Translate transport lifecycle into local lifecycle signals.
///
/// On reconnect with remembered credentials, the authorization gate is
/// taken before `Reconnect` fires so that resubscriptions wait for the
/// re-authorization to finish.
async fn lifecycle_task(
    shared: Arc<SessionShared>,
    mut transport: broadcast::Receiver<TransportEvent>,
    connection: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = transport.recv() => event,
        };

        match event {
            Ok(TransportEvent::Connected) => {
                connection.send_replace(ConnectionState::Connected);
                info!("connected");
            }
            Ok(TransportEvent::Disconnected) => {
                connection.send_replace(ConnectionState::Disconnected);
                warn!("disconnected");
                shared.lifecycle.emit(&Lifecycle::Disconnect, &());
            }
            Ok(TransportEvent::Reconnected) => {
                connection.send_replace(ConnectionState::Connected);
                info!("reconnected");
                if let Some(args) = shared.auth_args.load_full() {
                    let gate = Arc::clone(&shared.auth_gate).write_owned().await;
                    let reauth = Arc::clone(&shared);
                    tokio::spawn(async move {
                        // Failure is logged inside; the user stays as before.
                        let _ = reauth.authorize_locked(args.to_vec(), gate).await;
                    });
                }
                shared.lifecycle.emit(&Lifecycle::Reconnect, &());
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "lifecycle receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("lifecycle task exiting");
}
