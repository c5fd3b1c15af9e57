//! WebSocket RPC client with auto-reconnect.
//!
//! Maintains one socket to the server, correlates responses to requests
//! by id, dispatches server pushes to the registered [`PushHandlers`],
//! and reconnects with exponential backoff + jitter when the socket
//! drops. Every transition is broadcast as a [`TransportEvent`].
//!
//! # Example
//!
//! ```rust,ignore
//! use tidepool_rpc::{RpcChannel, RpcClientConfig, WsRpcClient};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let url = Url::parse("ws://localhost:8080/rpc")?;
//! let client = WsRpcClient::connect(url, RpcClientConfig::default(), CancellationToken::new());
//! let models = client.call("MR.getModels", vec![]).await?;
//! client.shutdown();
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::channel::{PushHandlers, PushRouter, RpcChannel, TransportEvent};
use crate::error::Error;
use crate::frame::{InboundFrame, RequestFrame, ResponseFrame};

// ── Channel capacities ───────────────────────────────────────────────

const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;

// ── Reconnect policy ─────────────────────────────────────────────────

/// Backoff between reconnect attempts: doubles from `initial_delay` up to
/// `max_delay`, with jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_retries: None,
        }
    }
}

/// Tuning for a [`WsRpcClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClientConfig {
    pub reconnect: ReconnectConfig,
    /// How long a call may wait for its response, including time spent
    /// queued while the socket is down.
    pub request_timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────────

type Pending = DashMap<u64, (String, oneshot::Sender<Result<Value, Error>>)>;

/// State reachable from both the client handle and the background task.
///
/// The outbound sender deliberately lives outside of this so that
/// dropping every client handle closes the queue and ends the task.
struct Shared {
    pending: Pending,
    router: PushRouter,
    lifecycle: broadcast::Sender<TransportEvent>,
}

// ── WsRpcClient ──────────────────────────────────────────────────────

/// Handle to a running WebSocket RPC connection.
///
/// Cheaply cloneable. Calls issued while the socket is down are queued
/// and flushed after the next successful (re)connect.
#[derive(Clone)]
pub struct WsRpcClient {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<RequestFrame>,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl WsRpcClient {
    /// Spawn the connection loop and return immediately.
    ///
    /// The first connection attempt happens asynchronously; subscribe to
    /// [`lifecycle`](RpcChannel::lifecycle) to observe it.
    pub fn connect(url: Url, config: RpcClientConfig, cancel: CancellationToken) -> Self {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            router: PushRouter::new(),
            lifecycle,
        });

        tokio::spawn(ws_loop(
            url,
            Arc::clone(&shared),
            outbound_rx,
            config.reconnect.clone(),
            cancel.clone(),
        ));

        Self {
            shared,
            outbound,
            next_id: Arc::new(AtomicU64::new(1)),
            request_timeout: config.request_timeout,
            cancel,
        }
    }

    /// Close the socket and stop reconnecting. Pending calls fail with
    /// [`Error::Shutdown`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

impl RpcChannel for WsRpcClient {
    fn call(&self, method: &str, params: Vec<Value>) -> BoxFuture<'static, Result<Value, Error>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = method.to_owned();
        let (tx, rx) = oneshot::channel();

        self.shared.pending.insert(id, (method.clone(), tx));
        let queued = self.outbound.send(RequestFrame {
            id,
            method: method.clone(),
            params,
        });

        let shared = Arc::clone(&self.shared);
        let timeout = self.request_timeout;
        Box::pin(async move {
            if queued.is_err() {
                shared.pending.remove(&id);
                return Err(Error::Shutdown);
            }

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::Disconnected),
                Err(_) => {
                    shared.pending.remove(&id);
                    Err(Error::Timeout {
                        method,
                        timeout_secs: timeout.as_secs(),
                    })
                }
            }
        })
    }

    fn expose(&self, namespace: &str, handlers: PushHandlers) {
        self.shared.router.expose(namespace, handlers);
    }

    fn lifecycle(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.lifecycle.subscribe()
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Why a single connection ended.
enum Exit {
    /// Socket closed or stream ended; reconnect right away.
    Dropped,
    /// Cancellation token fired or every client handle was dropped.
    Finished,
}

/// Main loop: connect → serve → on error, backoff → reconnect.
async fn ws_loop(
    url: Url,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<RequestFrame>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut connected_before = false;

    loop {
        let result = connect_and_serve(
            &url,
            &shared,
            &mut outbound_rx,
            &cancel,
            &mut connected_before,
        )
        .await;

        match result {
            Ok(Exit::Finished) => break,
            Ok(Exit::Dropped) => {
                tracing::info!("WebSocket disconnected, reconnecting");
                attempt = 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "connection attempt failed");

                if reconnect.max_retries.is_some_and(|max| attempt >= max) {
                    tracing::error!(attempt, "giving up on reconnecting");
                    break;
                }

                let delay = backoff_delay(attempt, &reconnect);
                tracing::debug!(delay = ?delay, attempt, "reconnect scheduled");

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
        }
    }

    fail_all(&shared.pending, || Error::Shutdown);
    tracing::debug!("WebSocket loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Establish one connection and pump frames both ways until it drops.
async fn connect_and_serve(
    url: &Url,
    shared: &Shared,
    outbound_rx: &mut mpsc::UnboundedReceiver<RequestFrame>,
    cancel: &CancellationToken,
    connected_before: &mut bool,
) -> Result<Exit, Error> {
    tracing::debug!(%url, "connecting");

    let connect = tokio_tungstenite::connect_async(url.as_str());
    let (ws_stream, _response) = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(Exit::Finished),
        result = connect => result.map_err(|e| Error::WebSocketConnect(e.to_string()))?,
    };

    let event = if *connected_before {
        TransportEvent::Reconnected
    } else {
        TransportEvent::Connected
    };
    *connected_before = true;
    tracing::info!(?event, %url, "socket open");
    // No receivers is fine.
    let _ = shared.lifecycle.send(event);

    let (mut write, mut read) = ws_stream.split();
    let mut in_flight: HashSet<u64> = HashSet::new();

    let exit = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break Exit::Finished;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&text, shared, &mut in_flight);
                    }
                    Some(Ok(Message::Close(close))) => {
                        let reason = close.as_ref().map(|c| c.reason.to_string());
                        tracing::info!(?reason, "server closed the socket");
                        break Exit::Dropped;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "socket read failed");
                        break Exit::Dropped;
                    }
                    None => {
                        tracing::info!("socket stream ended");
                        break Exit::Dropped;
                    }
                    // Pings are answered by tungstenite; binary is unused.
                    Some(Ok(_)) => {}
                }
            }
            request = outbound_rx.recv() => {
                let Some(request) = request else {
                    // Every client handle is gone.
                    let _ = write.send(Message::Close(None)).await;
                    break Exit::Finished;
                };
                let id = request.id;
                if !shared.pending.contains_key(&id) {
                    // Caller already timed out; don't bother the server.
                    continue;
                }
                match request.encode() {
                    Ok(text) => {
                        if let Err(e) = write.send(Message::text(text)).await {
                            tracing::warn!(error = %e, id, "WebSocket write failed");
                            in_flight.insert(id);
                            break Exit::Dropped;
                        }
                        in_flight.insert(id);
                    }
                    Err(e) => {
                        if let Some((_, (_, tx))) = shared.pending.remove(&id) {
                            let _ = tx.send(Err(e));
                        }
                    }
                }
            }
        }
    };

    for id in in_flight {
        if let Some((_, (_, tx))) = shared.pending.remove(&id) {
            let _ = tx.send(Err(Error::Disconnected));
        }
    }
    let _ = shared.lifecycle.send(TransportEvent::Disconnected);

    Ok(exit)
}

// ── Inbound handling ─────────────────────────────────────────────────

/// Route one text frame: resolve a pending call or dispatch a push.
fn handle_inbound(text: &str, shared: &Shared, in_flight: &mut HashSet<u64>) {
    let frame = match InboundFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to parse inbound frame");
            return;
        }
    };

    match frame {
        InboundFrame::Response(response) => {
            in_flight.remove(&response.id);
            resolve(&shared.pending, response);
        }
        InboundFrame::Push(push) => {
            shared.router.dispatch(&push.method, push.params);
        }
    }
}

fn resolve(pending: &Pending, response: ResponseFrame) {
    let Some((_, (method, tx))) = pending.remove(&response.id) else {
        tracing::debug!(id = response.id, "Response for unknown or expired request");
        return;
    };

    let outcome = match response.error {
        Some(err) => Err(Error::Remote {
            method,
            message: err.message,
            code: err.code,
        }),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    // The caller may have given up already.
    let _ = tx.send(outcome);
}

fn fail_all(pending: &Pending, err: impl Fn() -> Error) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, (_, tx))) = pending.remove(&id) {
            let _ = tx.send(Err(err()));
        }
    }
}

// ── Backoff ──────────────────────────────────────────────────────────

/// Delay before reconnect attempt `attempt` (0-based).
///
/// The doubled delay is capped at `max_delay`, then scaled by a factor in
/// `[0.8, 1.2]` derived from the attempt number so clients that dropped
/// together do not retry in lockstep.
fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let doubled = config
        .initial_delay
        .checked_mul(1_u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .unwrap_or(config.max_delay);
    let capped = doubled.min(config.max_delay);

    let spread = f64::from(attempt.wrapping_mul(2_654_435_761) % 401) / 1000.0;
    capped.mul_f64(0.8 + spread)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared() -> Shared {
        let (lifecycle, _) = broadcast::channel(8);
        Shared {
            pending: DashMap::new(),
            router: PushRouter::new(),
            lifecycle,
        }
    }

    #[test]
    fn backoff_doubles_within_jitter_bounds() {
        let config = ReconnectConfig::default();
        for attempt in 0..4 {
            let nominal = Duration::from_secs(1 << attempt);
            let delay = backoff_delay(attempt, &config);
            assert!(delay >= nominal.mul_f64(0.8), "attempt {attempt}: {delay:?}");
            assert!(delay <= nominal.mul_f64(1.2), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn backoff_is_capped() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..ReconnectConfig::default()
        };
        for attempt in [5, 10, 31, 32, u32::MAX] {
            assert!(backoff_delay(attempt, &config) <= Duration::from_secs(12));
        }
    }

    #[test]
    fn response_resolves_pending_call() {
        let shared = shared();
        let (tx, mut rx) = oneshot::channel();
        shared.pending.insert(5, ("MR.getModels".into(), tx));
        let mut in_flight = HashSet::from([5]);

        handle_inbound(r#"{"id": 5, "result": ["task"]}"#, &shared, &mut in_flight);

        assert!(in_flight.is_empty());
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!(["task"]));
        assert!(shared.pending.is_empty());
    }

    #[test]
    fn error_response_carries_method() {
        let shared = shared();
        let (tx, mut rx) = oneshot::channel();
        shared.pending.insert(1, ("MR.task.liveQuery".into(), tx));

        handle_inbound(
            r#"{"id": 1, "error": {"message": "count and sort"}}"#,
            &shared,
            &mut HashSet::new(),
        );

        match rx.try_recv().unwrap() {
            Err(Error::Remote { method, message, .. }) => {
                assert_eq!(method, "MR.task.liveQuery");
                assert_eq!(message, "count and sort");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn push_is_dispatched_to_router() {
        let shared = shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.router.expose(
            "MR.task",
            PushHandlers::new().with(
                "remove",
                Arc::new(move |params| {
                    let _ = tx.send(params);
                }),
            ),
        );

        handle_inbound(
            r#"{"method": "MR.task.remove", "params": [2, "abc"]}"#,
            &shared,
            &mut HashSet::new(),
        );

        assert_eq!(rx.try_recv().unwrap(), vec![json!(2), json!("abc")]);
    }

    #[test]
    fn malformed_frame_is_ignored() {
        let shared = shared();
        handle_inbound("{{{", &shared, &mut HashSet::new());
        assert!(shared.pending.is_empty());
    }

    #[test]
    fn fail_all_drains_pending() {
        let shared = shared();
        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        shared.pending.insert(1, ("a".into(), tx_a));
        shared.pending.insert(2, ("b".into(), tx_b));

        fail_all(&shared.pending, || Error::Shutdown);

        assert!(matches!(rx_a.try_recv().unwrap(), Err(Error::Shutdown)));
        assert!(matches!(rx_b.try_recv().unwrap(), Err(Error::Shutdown)));
        assert!(shared.pending.is_empty());
    }
}
