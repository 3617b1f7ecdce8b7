//! Appservice gateway tests: homeserver authentication, transaction
//! dedupe, admin room establishment, and admin command round-trips.

mod common;

use std::sync::Arc;

use common::{test_context, wait_for, RecordingMatrix};
use ironbridge::context::BridgeContext;
use ironbridge::matrix::appservice;
use serde_json::{json, Value};

const HS_TOKEN: &str = "hs-token";

async fn serve(ctx: Arc<BridgeContext>) -> String {
    let app = appservice::router(ctx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

async fn put_txn(base: &str, txn_id: &str, token: Option<&str>, events: Value) -> u16 {
    let client = reqwest::Client::new();
    let mut req = client
        .put(format!("{base}/_matrix/app/v1/transactions/{txn_id}"))
        .json(&json!({ "events": events }));
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    req.send().await.expect("request").status().as_u16()
}

fn invite_event(room: &str, inviter: &str) -> Value {
    json!({
        "event_id": "$invite:test",
        "sender": inviter,
        "room_id": room,
        "type": "m.room.member",
        "state_key": "@ironbridge:test",
        "content": { "membership": "invite" }
    })
}

#[tokio::test]
async fn rejects_bad_homeserver_token() {
    let matrix = RecordingMatrix::new();
    let (ctx, _dir) = test_context(matrix.clone());
    let base = serve(ctx).await;

    let status = put_txn(&base, "t1", Some("wrong"), json!([])).await;
    assert_eq!(status, 403);
    let status = put_txn(&base, "t2", None, json!([])).await;
    assert_eq!(status, 403);
    assert!(matrix.calls().is_empty());
}

#[tokio::test]
async fn replayed_transaction_has_no_effect() {
    let matrix = RecordingMatrix::new();
    let (ctx, _dir) = test_context(matrix.clone());
    let base = serve(ctx).await;

    let events = json!([invite_event("!admin:test", "@alice:test")]);
    assert_eq!(put_txn(&base, "txn", Some(HS_TOKEN), events.clone()).await, 200);
    wait_for("invite processed", || {
        matrix.calls().iter().any(|c| c.starts_with("join !admin:test"))
    })
    .await;
    let joins_before = matrix
        .calls()
        .iter()
        .filter(|c| c.starts_with("join"))
        .count();

    // same transaction ID again: acknowledged, not reprocessed
    assert_eq!(put_txn(&base, "txn", Some(HS_TOKEN), events).await, 200);
    let joins_after = matrix
        .calls()
        .iter()
        .filter(|c| c.starts_with("join"))
        .count();
    assert_eq!(joins_before, joins_after);
}

#[tokio::test]
async fn first_inviter_claims_the_bridge() {
    let matrix = RecordingMatrix::new();
    let (ctx, _dir) = test_context(matrix.clone());
    let base = serve(ctx.clone()).await;

    let events = json!([invite_event("!admin:test", "@alice:test")]);
    assert_eq!(put_txn(&base, "t1", Some(HS_TOKEN), events).await, 200);

    wait_for("admin room", || {
        ctx.store
            .user("@alice:test")
            .and_then(|u| u.admin_room)
            .is_some()
    })
    .await;
    let user = ctx.store.user("@alice:test").unwrap();
    assert!(user.owner);
    assert_eq!(user.admin_room.as_deref(), Some("!admin:test"));
    // greeted in the admin room
    wait_for("greeting", || !matrix.messages().is_empty()).await;

    // a later stranger is refused and the bot leaves again
    let events = json!([invite_event("!other:test", "@mallory:test")]);
    assert_eq!(put_txn(&base, "t2", Some(HS_TOKEN), events).await, 200);
    wait_for("rejection", || {
        matrix.calls().iter().any(|c| c.starts_with("leave !other:test"))
    })
    .await;
    assert!(ctx.store.user("@mallory:test").is_none());
}

#[tokio::test]
async fn admin_command_round_trip() {
    let matrix = RecordingMatrix::new();
    let (ctx, _dir) = test_context(matrix.clone());
    let base = serve(ctx.clone()).await;

    // establish the admin room first
    let events = json!([invite_event("!admin:test", "@alice:test")]);
    put_txn(&base, "t1", Some(HS_TOKEN), events).await;
    wait_for("admin room", || {
        ctx.store.user("@alice:test").and_then(|u| u.admin_room).is_some()
    })
    .await;

    let events = json!([{
        "event_id": "$cmd:test",
        "sender": "@alice:test",
        "room_id": "!admin:test",
        "type": "m.room.message",
        "content": { "msgtype": "m.text", "body": "addnetwork libera" }
    }]);
    assert_eq!(put_txn(&base, "t2", Some(HS_TOKEN), events).await, 200);

    wait_for("network created", || {
        ctx.store.network("@alice:test", "libera").is_some()
    })
    .await;
    wait_for("reply notice", || {
        matrix
            .messages()
            .iter()
            .any(|m| m.room_id == "!admin:test" && m.content.body.contains("libera"))
    })
    .await;
}
