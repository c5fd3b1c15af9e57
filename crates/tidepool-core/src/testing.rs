// ── Scripted in-memory channel ──
//
// An `RpcChannel` whose replies are scripted per method path. Pushes and
// transport transitions are injected by the test; every call is recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tidepool_rpc::{Error, PushHandlers, PushRouter, RpcChannel, TransportEvent};
use tokio::sync::{broadcast, oneshot};

enum Step {
    Reply(Value),
    Fail(String),
    Defer(oneshot::Receiver<Result<Value, Error>>),
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Step>>,
    fallback: HashMap<String, Result<Value, String>>,
    calls: Vec<(String, Vec<Value>)>,
}

/// In-memory channel for exercising sessions without a server.
///
/// A call first consumes the next one-shot step queued for its method
/// (`reply_once`, `defer`), then falls back to the standing reply set with
/// `reply`/`fail`, and finally resolves to `Null`.
pub struct ScriptedRpc {
    script: Mutex<Script>,
    router: PushRouter,
    transport: broadcast::Sender<TransportEvent>,
}

impl ScriptedRpc {
    pub fn new() -> Arc<Self> {
        let (transport, _) = broadcast::channel(16);
        Arc::new(Self {
            script: Mutex::new(Script::default()),
            router: PushRouter::new(),
            transport,
        })
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Standing reply for every call to `method`.
    pub fn reply(&self, method: &str, value: Value) {
        self.script().fallback.insert(method.to_owned(), Ok(value));
    }

    /// Standing remote error for every call to `method`.
    pub fn fail(&self, method: &str, message: &str) {
        self.script()
            .fallback
            .insert(method.to_owned(), Err(message.to_owned()));
    }

    /// Reply to the next call to `method` only.
    pub fn reply_once(&self, method: &str, value: Value) {
        self.queue(method, Step::Reply(value));
    }

    /// Fail the next call to `method` only.
    pub fn fail_once(&self, method: &str, message: &str) {
        self.queue(method, Step::Fail(message.to_owned()));
    }

    /// Hold the next call to `method` until the returned sender resolves
    /// it. Dropping the sender fails the call as a disconnect.
    pub fn defer(&self, method: &str) -> oneshot::Sender<Result<Value, Error>> {
        let (tx, rx) = oneshot::channel();
        self.queue(method, Step::Defer(rx));
        tx
    }

    fn queue(&self, method: &str, step: Step) {
        self.script()
            .queued
            .entry(method.to_owned())
            .or_default()
            .push_back(step);
    }

    /// Deliver a server push. Returns `false` when nothing handled it.
    pub fn push(&self, path: &str, params: Vec<Value>) -> bool {
        self.router.dispatch(path, params)
    }

    /// Broadcast a transport transition to the session.
    pub fn transport(&self, event: TransportEvent) {
        let _ = self.transport.send(event);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.script().calls.clone()
    }

    /// Parameters of every call made to `method`.
    pub fn calls_to(&self, method: &str) -> Vec<Vec<Value>> {
        self.script()
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

fn remote(method: &str, message: String) -> Error {
    Error::Remote {
        method: method.to_owned(),
        message,
        code: None,
    }
}

impl RpcChannel for ScriptedRpc {
    fn call(&self, method: &str, params: Vec<Value>) -> BoxFuture<'static, Result<Value, Error>> {
        let mut script = self.script();
        script.calls.push((method.to_owned(), params));

        let step = script.queued.get_mut(method).and_then(VecDeque::pop_front);
        let step = step.or_else(|| match script.fallback.get(method) {
            Some(Ok(value)) => Some(Step::Reply(value.clone())),
            Some(Err(message)) => Some(Step::Fail(message.clone())),
            None => None,
        });
        drop(script);

        let method = method.to_owned();
        match step {
            Some(Step::Reply(value)) => futures_util::future::ready(Ok(value)).boxed(),
            Some(Step::Fail(message)) => {
                futures_util::future::ready(Err(remote(&method, message))).boxed()
            }
            Some(Step::Defer(rx)) => async move { rx.await.unwrap_or(Err(Error::Disconnected)) }.boxed(),
            None => futures_util::future::ready(Ok(Value::Null)).boxed(),
        }
    }

    fn expose(&self, namespace: &str, handlers: PushHandlers) {
        self.router.expose(namespace, handlers);
    }

    fn lifecycle(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport.subscribe()
    }
}
