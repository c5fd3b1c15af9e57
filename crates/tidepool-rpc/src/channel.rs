//! Abstract bidirectional RPC channel.
//!
//! `tidepool-core` only ever talks to the server through [`RpcChannel`]:
//! request/response calls, inbound push handlers registered per
//! namespace, and a broadcast of transport lifecycle transitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Error;

/// Transport lifecycle transitions observed by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEvent {
    /// First successful connection.
    Connected,
    /// The socket dropped. Pending requests have failed.
    Disconnected,
    /// A connection was re-established after a disconnect.
    Reconnected,
}

/// Callback invoked with the positional arguments of an inbound push.
pub type PushFn = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Handler table for one namespace, keyed by method name.
#[derive(Clone, Default)]
pub struct PushHandlers {
    handlers: HashMap<String, PushFn>,
}

impl PushHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method`, replacing any previous one.
    pub fn with(mut self, method: impl Into<String>, handler: PushFn) -> Self {
        self.handlers.insert(method.into(), handler);
        self
    }

    pub fn get(&self, method: &str) -> Option<&PushFn> {
        self.handlers.get(method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for PushHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("PushHandlers").field("methods", &names).finish()
    }
}

/// Routing table from dotted namespace (`"MR.task"`) to its handlers.
///
/// Shared by every [`RpcChannel`] implementation so that push dispatch
/// behaves identically regardless of the wire underneath.
#[derive(Debug, Default)]
pub struct PushRouter {
    namespaces: DashMap<String, PushHandlers>,
}

impl PushRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expose(&self, namespace: &str, handlers: PushHandlers) {
        tracing::debug!(namespace, methods = handlers.len(), "exposing push handlers");
        self.namespaces.insert(namespace.to_owned(), handlers);
    }

    /// Dispatch a push addressed to a full method path.
    ///
    /// The path is split at its last `.` into namespace and method name.
    /// Returns `false` when nothing is registered for it.
    pub fn dispatch(&self, path: &str, params: Vec<Value>) -> bool {
        let Some((namespace, method)) = path.rsplit_once('.') else {
            tracing::warn!(path, "push without namespace, dropping");
            return false;
        };

        // Clone the handler out so the map shard is not held while it runs.
        let handler = self
            .namespaces
            .get(namespace)
            .and_then(|h| h.get(method).cloned());

        match handler {
            Some(handler) => {
                handler(params);
                true
            }
            None => {
                tracing::warn!(path, "no push handler registered, dropping");
                false
            }
        }
    }
}

/// The transport contract consumed by the live-query engine.
pub trait RpcChannel: Send + Sync + 'static {
    /// Invoke a remote method and await its result.
    fn call(&self, method: &str, params: Vec<Value>) -> BoxFuture<'static, Result<Value, Error>>;

    /// Register inbound push handlers under a namespace path.
    fn expose(&self, namespace: &str, handlers: PushHandlers);

    /// Subscribe to transport lifecycle transitions.
    fn lifecycle(&self) -> broadcast::Receiver<TransportEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn dispatch_routes_by_namespace_and_method() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let router = PushRouter::new();
        router.expose(
            "MR.task",
            PushHandlers::new().with(
                "add",
                Arc::new(move |params: Vec<Value>| {
                    if let Ok(mut guard) = sink.lock() {
                        guard.push(params);
                    }
                }),
            ),
        );

        assert!(router.dispatch("MR.task.add", vec![Value::from(1)]));
        assert!(!router.dispatch("MR.task.remove", vec![]));
        assert!(!router.dispatch("MR.other.add", vec![]));
        assert!(!router.dispatch("orphan", vec![]));

        let seen = seen.lock().map(|g| g.clone()).unwrap_or_default();
        assert_eq!(seen, vec![vec![Value::from(1)]]);
    }

    #[test]
    fn expose_replaces_namespace() {
        let router = PushRouter::new();
        router.expose("MR.a", PushHandlers::new().with("x", Arc::new(|_| {})));
        router.expose("MR.a", PushHandlers::new().with("y", Arc::new(|_| {})));
        assert!(!router.dispatch("MR.a.x", vec![]));
        assert!(router.dispatch("MR.a.y", vec![]));
    }

    #[test]
    fn debug_lists_sorted_methods() {
        let handlers = PushHandlers::new()
            .with("update", Arc::new(|_| {}))
            .with("add", Arc::new(|_| {}));
        assert_eq!(
            format!("{handlers:?}"),
            r#"PushHandlers { methods: ["add", "update"] }"#
        );
    }
}
