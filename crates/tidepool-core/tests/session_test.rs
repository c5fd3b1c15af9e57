#![allow(clippy::unwrap_used)]
// Session and model behavior against the scripted channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use tidepool_core::testing::ScriptedRpc;
use tidepool_core::{ConnectionState, CoreError, Lifecycle, Session};
use tidepool_rpc::TransportEvent;

// ── Helpers ─────────────────────────────────────────────────────────

fn setup() -> (Arc<ScriptedRpc>, Session) {
    let rpc = ScriptedRpc::new();
    let session = Session::with_channel(rpc.clone(), "MR");
    (rpc, session)
}

async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + Clone + 'static) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    (log, move |doc: &Value| sink.lock().unwrap().push(doc.clone()))
}

// ── Model events ────────────────────────────────────────────────────

#[tokio::test]
async fn first_listener_subscribes_and_last_unsubscribes() {
    let (rpc, session) = setup();
    let model = session.model("task");
    let (log, record) = recorder();

    let first = model.on("create", record.clone()).await.unwrap();
    let second = model.on("create", record).await.unwrap();
    assert_eq!(first.listeners, 1);
    assert_eq!(second.listeners, 2);
    assert_eq!(rpc.calls_to("MR.task.subscribe"), vec![vec![json!("create")]]);

    assert!(rpc.push(
        "MR.schemaEvent",
        vec![json!({ "modelName": "task", "evName": "create", "doc": { "_id": 4 } })],
    ));
    assert_eq!(log.lock().unwrap().len(), 2);

    assert_eq!(model.off("create", Some(first.id)).await.unwrap(), 1);
    assert!(rpc.calls_to("MR.task.unsubscribe").is_empty());

    assert_eq!(model.off("create", Some(second.id)).await.unwrap(), 0);
    assert_eq!(rpc.calls_to("MR.task.unsubscribe"), vec![vec![json!("create")]]);

    // Nothing left to remove: no request.
    assert_eq!(model.off("create", None).await.unwrap(), 0);
    assert_eq!(rpc.calls_to("MR.task.unsubscribe").len(), 1);
}

#[tokio::test]
async fn schema_events_route_by_model_name() {
    let (rpc, session) = setup();
    let tasks = session.model("task");
    let users = session.model("user");
    let (task_log, record_task) = recorder();
    let (user_log, record_user) = recorder();
    tasks.on("update", record_task).await.unwrap();
    users.on("update", record_user).await.unwrap();

    rpc.push(
        "MR.schemaEvent",
        vec![json!({ "modelName": "user", "evName": "update", "doc": { "_id": "u1" } })],
    );
    rpc.push(
        "MR.schemaEvent",
        vec![json!({ "modelName": "nobody", "evName": "update", "doc": {} })],
    );
    rpc.push("MR.schemaEvent", vec![json!({ "evName": "update" })]);

    assert!(task_log.lock().unwrap().is_empty());
    assert_eq!(*user_log.lock().unwrap(), vec![json!({ "_id": "u1" })]);
}

#[tokio::test]
async fn model_subscriptions_are_renewed_after_reconnect() {
    let (rpc, session) = setup();
    let model = session.model("task");
    model.on("remove", |_| {}).await.unwrap();

    rpc.transport(TransportEvent::Disconnected);
    rpc.transport(TransportEvent::Reconnected);
    until(|| rpc.calls_to("MR.task.subscribe").len() == 2).await;

    model.off("remove", None).await.unwrap();
    rpc.transport(TransportEvent::Reconnected);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rpc.calls_to("MR.task.subscribe").len(), 2);
}

#[tokio::test]
async fn failed_subscribe_is_retried_by_the_next_listener() {
    let (rpc, session) = setup();
    let model = session.model("task");
    rpc.fail_once("MR.task.subscribe", "not allowed");

    let err = model.on("create", |_| {}).await.unwrap_err();
    assert!(matches!(err, CoreError::Remote { .. }), "{err:?}");
    assert_eq!(model.listener_count("create"), 0);

    let registration = model.on("create", |_| {}).await.unwrap();
    assert_eq!(registration.listeners, 1);
    assert_eq!(rpc.calls_to("MR.task.subscribe").len(), 2);

    // Only the surviving listener's hooks resubscribe.
    rpc.transport(TransportEvent::Reconnected);
    until(|| rpc.calls_to("MR.task.subscribe").len() == 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rpc.calls_to("MR.task.subscribe").len(), 3);
}

// ── Remote writes ───────────────────────────────────────────────────

#[tokio::test]
async fn writes_pass_through_to_model_methods() {
    let (rpc, session) = setup();
    rpc.reply("MR.task.create", json!({ "_id": 10, "title": "new" }));
    rpc.reply("MR.task.listPaths", json!(["_id", "title", "done"]));
    let model = session.model("task");

    let created = model.create(json!({ "title": "new" })).await.unwrap();
    assert_eq!(created["_id"], json!(10));

    model.remove(&json!({ "_id": 10, "title": "new" })).await.unwrap();
    model.remove(&json!(11)).await.unwrap();
    assert_eq!(
        rpc.calls_to("MR.task.remove"),
        vec![vec![json!(10)], vec![json!(11)]]
    );

    model
        .add_to_set(json!({ "_id": 10 }), "tags", json!("urgent"))
        .await
        .unwrap();
    assert_eq!(
        rpc.calls_to("MR.task.addToSet"),
        vec![vec![json!({ "_id": 10 }), json!("tags"), json!("urgent")]]
    );

    assert_eq!(model.list_paths().await.unwrap(), vec!["_id", "title", "done"]);

    let err = model.remove(&json!({ "title": "no id" })).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
}

// ── Authorization ───────────────────────────────────────────────────

#[tokio::test]
async fn authorization_failure_keeps_anonymous_user() {
    let (rpc, session) = setup();
    rpc.fail("MR.authorize", "bad token");

    let err = session.authorize(vec![json!({ "token": "nope" })]).await.unwrap_err();
    assert!(matches!(err, CoreError::AuthorizationFailed { ref message } if message == "bad token"));
    assert!(!session.is_authorized());
    assert_eq!(session.user().privilege_level, 0);
}

#[tokio::test]
async fn deauthorize_resets_user() {
    let (rpc, session) = setup();
    rpc.reply("MR.authorize", json!({ "privilege_level": 1 }));
    session.authorize(vec![json!({ "token": "t" })]).await.unwrap();
    assert!(session.is_authorized());

    session.deauthorize().await.unwrap();
    assert!(!session.is_authorized());
    assert_eq!(rpc.calls_to("MR.deAuthorize").len(), 1);

    // No stored credentials, so a reconnect does not re-authorize.
    rpc.transport(TransportEvent::Reconnected);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rpc.calls_to("MR.authorize").len(), 1);
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn transport_events_drive_connection_state_and_lifecycle() {
    let (rpc, session) = setup();
    let mut state = session.connection_state();
    assert_eq!(*state.borrow(), ConnectionState::Connecting);

    let disconnects = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&disconnects);
    let subscription = session.on_lifecycle(Lifecycle::Disconnect, move || {
        *counter.lock().unwrap() += 1;
    });

    rpc.transport(TransportEvent::Connected);
    state.changed().await.unwrap();
    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

    rpc.transport(TransportEvent::Disconnected);
    state.changed().await.unwrap();
    assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);
    until(|| *disconnects.lock().unwrap() == 1).await;

    subscription.unsubscribe();
    rpc.transport(TransportEvent::Disconnected);
    rpc.transport(TransportEvent::Reconnected);
    state.changed().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*disconnects.lock().unwrap(), 1);
}

#[tokio::test]
async fn models_are_created_once_and_listed() {
    let (rpc, session) = setup();
    rpc.reply("MR.getModels", json!({ "task": {}, "user": {} }));

    let a = session.model("task");
    let b = session.model("task");
    session.model("user");
    assert_eq!(a.name(), b.name());
    assert_eq!(session.model_names(), vec!["task", "user"]);
    assert_eq!(session.namespace(), "MR");

    let remote = session.list_models().await.unwrap();
    assert_eq!(remote, json!({ "task": {}, "user": {} }));
}
