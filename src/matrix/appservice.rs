//! Appservice gateway - the inbound HTTP surface the homeserver pushes
//! transactions to.
//!
//! The gateway stays a thin dispatcher: it authenticates the homeserver,
//! deduplicates transactions, and hands each event to exactly one owner -
//! a live session (by room), the admin interpreter (admin rooms), or the
//! invite handler (bot membership).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::put;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::commands;
use crate::context::BridgeContext;
use crate::matrix::types::{MatrixEvent, Transaction};
use crate::session::SessionCommand;

struct AppserviceState {
    ctx: Arc<BridgeContext>,
    seen_txns: Mutex<TxnDedupe>,
}

/// Bounded set of recently processed transaction IDs. The homeserver
/// retries transactions until acknowledged; replays must be idempotent.
struct TxnDedupe {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl TxnDedupe {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record a transaction ID; returns false when it was already seen.
    fn insert(&mut self, txn_id: &str) -> bool {
        if self.seen.contains(txn_id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(txn_id.to_owned());
        self.order.push_back(txn_id.to_owned());
        true
    }
}

/// Build the appservice router. Split from [`run`] so tests can drive it
/// without a socket.
pub fn router(ctx: Arc<BridgeContext>) -> Router {
    let state = Arc::new(AppserviceState {
        seen_txns: Mutex::new(TxnDedupe::new(ctx.config.tuning.txn_dedupe_len)),
        ctx,
    });
    Router::new()
        .route("/_matrix/app/v1/transactions/:txn_id", put(transactions))
        // pre-r0 homeservers push to the unprefixed path
        .route("/transactions/:txn_id", put(transactions))
        .with_state(state)
}

/// Bind the configured listen address and serve until the process exits.
pub async fn run(ctx: Arc<BridgeContext>) {
    let addr = ctx.config.listen;
    let app = router(ctx);

    info!(%addr, "appservice gateway listening");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "failed to bind appservice gateway");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "appservice gateway error");
    }
}

fn authorized(
    state: &AppserviceState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> bool {
    let expected = state.ctx.config.hs_token.as_str();
    if let Some(bearer) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return bearer == expected;
    }
    query.get("access_token").is_some_and(|t| t == expected)
}

async fn transactions(
    State(state): State<Arc<AppserviceState>>,
    Path(txn_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(txn): Json<Transaction>,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query) {
        warn!(%txn_id, "transaction with bad homeserver token");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "errcode": "M_FORBIDDEN" })),
        );
    }

    if !state.seen_txns.lock().insert(&txn_id) {
        debug!(%txn_id, "replayed transaction acknowledged without effect");
        return (StatusCode::OK, Json(json!({})));
    }

    debug!(%txn_id, events = txn.events.len(), "processing transaction");
    for event in txn.events {
        dispatch(&state.ctx, event).await;
    }
    (StatusCode::OK, Json(json!({})))
}

/// Route one event to its single owner.
async fn dispatch(ctx: &Arc<BridgeContext>, event: MatrixEvent) {
    let bot = ctx.config.bot_mxid();
    // our own echoes: the bot and every puppet it drives
    if event.sender == bot
        || event
            .sender
            .strip_prefix('@')
            .is_some_and(|rest| rest.starts_with(&ctx.config.puppet_prefix))
    {
        return;
    }

    // bot invited somewhere: admin room establishment
    if event.kind == "m.room.member"
        && event.state_key.as_deref() == Some(bot.as_str())
        && event.membership() == Some("invite")
    {
        handle_invite(ctx, &event).await;
        return;
    }

    // bridged room: the owning session consumes the event
    if let Some(tx) = ctx.registry.route(&event.room_id) {
        if tx
            .send(SessionCommand::Matrix(Box::new(event)))
            .await
            .is_err()
        {
            warn!("session went away while dispatching");
        }
        return;
    }

    // admin room: only its user may speak commands in it
    if event.kind == "m.room.message" {
        let is_admin_room = ctx
            .store
            .user(&event.sender)
            .and_then(|u| u.admin_room)
            .is_some_and(|room| room == event.room_id);
        if is_admin_room {
            handle_admin_line(ctx, event).await;
        } else {
            debug!(room = %event.room_id, "message in unmapped room ignored");
        }
    }
}

async fn handle_invite(ctx: &Arc<BridgeContext>, event: &MatrixEvent) {
    let inviter = event.sender.clone();
    let known = ctx.store.user(&inviter).is_some();
    // bootstrap: the very first inviter becomes the bridge owner
    let first_user = !known && ctx.store.user_count() == 0;

    if !known && !first_user {
        info!(%inviter, "rejecting invite from unauthorized user");
        if let Err(e) = ctx.matrix.join(&event.room_id, None).await {
            warn!(error = %e, "failed to join for rejection");
            return;
        }
        let _ = ctx
            .matrix
            .send_notice(&event.room_id, "you are not authorized to use this bridge")
            .await;
        let _ = ctx.matrix.leave(&event.room_id, None).await;
        return;
    }

    if let Err(e) = ctx.matrix.join(&event.room_id, None).await {
        warn!(error = %e, "failed to accept invite");
        return;
    }

    let result = ctx.store.update_user(&inviter, |user| {
        if first_user {
            user.owner = true;
        }
        if user.admin_room.is_none() {
            user.admin_room = Some(event.room_id.clone());
        }
    });
    if let Err(e) = result {
        warn!(error = %e, "failed to persist admin room");
        return;
    }

    let admin_room = ctx.store.user(&inviter).and_then(|u| u.admin_room);
    if admin_room.as_deref() == Some(event.room_id.as_str()) {
        info!(%inviter, room = %event.room_id, "admin room established");
        let _ = ctx
            .matrix
            .send_notice(
                &event.room_id,
                "this is now your admin room; say `help` to get started",
            )
            .await;
    }
}

async fn handle_admin_line(ctx: &Arc<BridgeContext>, event: MatrixEvent) {
    let Some(content) = event.message_content() else {
        return;
    };
    if content.msgtype != "m.text" {
        return;
    }
    let reply = match commands::parse(&content.body) {
        Ok(cmd) => commands::execute(ctx, &event.sender, cmd).await,
        Err(e) => e,
    };
    if let Err(e) = ctx.matrix.send_notice(&event.room_id, &reply).await {
        warn!(error = %e, "failed to send admin reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_is_bounded_and_exact() {
        let mut dedupe = TxnDedupe::new(3);
        assert!(dedupe.insert("a"));
        assert!(!dedupe.insert("a"));
        assert!(dedupe.insert("b"));
        assert!(dedupe.insert("c"));
        // inserting a fourth evicts the oldest
        assert!(dedupe.insert("d"));
        assert!(dedupe.insert("a"));
        assert!(!dedupe.insert("d"));
    }
}
