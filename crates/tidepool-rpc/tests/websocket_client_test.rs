#![allow(clippy::unwrap_used)]
// End-to-end tests for `WsRpcClient` against an in-process WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use tidepool_rpc::{
    Error, PushHandlers, ReconnectConfig, RpcChannel, RpcClientConfig, TransportEvent,
    WsRpcClient,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn bind() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/rpc")).unwrap();
    (listener, url)
}

fn fast_config() -> RpcClientConfig {
    RpcClientConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_retries: None,
        },
        request_timeout: Duration::from_secs(5),
    }
}

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("lifecycle event in time")
        .unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn call_push_and_reconnect() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let msg = ws.next().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(request["method"], "MR.task.liveQuery");
        assert_eq!(request["params"][1], 1);

        let push = json!({"method": "MR.task.add", "params": [1, {"_id": "a"}, 0]});
        ws.send(Message::text(push.to_string())).await.unwrap();
        let response = json!({"id": request["id"], "result": {"docs": []}});
        ws.send(Message::text(response.to_string())).await.unwrap();

        // Drop the socket without a close handshake, then accept the retry.
        drop(ws);
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });

    let client = WsRpcClient::connect(url, fast_config(), CancellationToken::new());
    let mut lifecycle = client.lifecycle();

    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    client.expose(
        "MR.task",
        PushHandlers::new().with(
            "add",
            Arc::new(move |params| {
                let _ = push_tx.send(params);
            }),
        ),
    );

    assert_eq!(next_event(&mut lifecycle).await, TransportEvent::Connected);

    let result = client
        .call("MR.task.liveQuery", vec![json!([]), json!(1)])
        .await
        .unwrap();
    assert_eq!(result, json!({"docs": []}));

    let params = push_rx.recv().await.unwrap();
    assert_eq!(params, vec![json!(1), json!({"_id": "a"}), json!(0)]);

    assert_eq!(next_event(&mut lifecycle).await, TransportEvent::Disconnected);
    assert_eq!(next_event(&mut lifecycle).await, TransportEvent::Reconnected);

    let _ws = server.await.unwrap();
    client.shutdown();
}

#[tokio::test]
async fn remote_error_is_surfaced() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let msg = ws.next().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        let response = json!({
            "id": request["id"],
            "error": {"message": "not authorized", "code": "E_AUTH"}
        });
        ws.send(Message::text(response.to_string())).await.unwrap();
        // Keep the socket open until the test finishes.
        let _ = ws.next().await;
    });

    let client = WsRpcClient::connect(url, fast_config(), CancellationToken::new());
    let err = client.call("MR.authorize", vec![]).await.unwrap_err();

    match err {
        Error::Remote { method, message, code } => {
            assert_eq!(method, "MR.authorize");
            assert_eq!(message, "not authorized");
            assert_eq!(code.as_deref(), Some("E_AUTH"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(client.pending_requests(), 0);
    client.shutdown();
}

#[tokio::test]
async fn call_after_shutdown_fails() {
    let (_listener, url) = bind().await;
    let cancel = CancellationToken::new();
    let client = WsRpcClient::connect(url, fast_config(), cancel.clone());

    cancel.cancel();
    let err = client.call("MR.getModels", vec![]).await.unwrap_err();
    assert!(
        matches!(err, Error::Shutdown | Error::Disconnected),
        "unexpected error: {err:?}"
    );
}
