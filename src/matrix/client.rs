//! Matrix client-server API capability.
//!
//! [`MatrixApi`] is the seam the rest of the bridge talks through; the
//! reqwest-backed [`HttpMatrixClient`] implements it against a real
//! homeserver with appservice authentication and puppet impersonation.
//! [`SendQueue`] provides the bounded, ordered, retried delivery lane for
//! Matrix-bound events required by the error-handling design.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::matrix::types::MessageContent;

/// Matrix operations the bridge core needs. Object-safe so tests can
/// substitute a recording implementation.
#[async_trait]
pub trait MatrixApi: Send + Sync {
    /// Register a puppet (or bot) localpart; an already-taken localpart is
    /// not an error.
    async fn ensure_registered(&self, localpart: &str) -> Result<()>;

    /// Set a user's global displayname.
    async fn set_displayname(&self, user_id: &str, displayname: &str) -> Result<()>;

    /// Create a room, returning its room ID.
    async fn create_room(&self, name: &str, topic: Option<&str>, invite: &[String])
        -> Result<String>;

    /// Invite a user to a room (as the bridge bot).
    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()>;

    /// Join a room, optionally impersonating a puppet.
    async fn join(&self, room_id: &str, as_user: Option<&str>) -> Result<()>;

    /// Leave a room, optionally impersonating a puppet.
    async fn leave(&self, room_id: &str, as_user: Option<&str>) -> Result<()>;

    /// Send an `m.room.message` event, returning the event ID.
    async fn send_message(
        &self,
        room_id: &str,
        as_user: Option<&str>,
        content: MessageContent,
    ) -> Result<String>;

    /// Send a state event.
    async fn send_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> Result<()>;

    /// Convenience: bot notice into a room.
    async fn send_notice(&self, room_id: &str, text: &str) -> Result<()> {
        self.send_message(room_id, None, MessageContent::notice(text))
            .await
            .map(|_| ())
    }

    /// Convenience: set the room name.
    async fn set_room_name(&self, room_id: &str, name: &str) -> Result<()> {
        self.send_state(room_id, "m.room.name", "", json!({ "name": name }))
            .await
    }

    /// Convenience: set the room topic.
    async fn set_room_topic(&self, room_id: &str, topic: &str) -> Result<()> {
        self.send_state(room_id, "m.room.topic", "", json!({ "topic": topic }))
            .await
    }
}

/// reqwest-backed homeserver client.
pub struct HttpMatrixClient {
    http: reqwest::Client,
    base_url: String,
    as_token: String,
    txn_counter: AtomicU64,
}

impl HttpMatrixClient {
    pub fn new(base_url: &str, as_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            as_token: as_token.to_owned(),
            txn_counter: AtomicU64::new(0),
        }
    }

    fn next_txn_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "ironbridge-{}-{n}",
            std::process::id()
        )
    }

    /// One authenticated request with bounded retry on transport errors,
    /// 429 and 5xx. Client errors (4xx) are returned to the caller.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        as_user: Option<&str>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let mut delay = Duration::from_secs(1);

        for attempt in 0..3u32 {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.as_token);
            if let Some(user) = as_user {
                req = req.query(&[("user_id", user)]);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json().await.unwrap_or(Value::Null));
                    }
                    let text = resp.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        debug!(%url, %status, attempt, "homeserver busy, retrying");
                    } else {
                        return Err(BridgeError::Homeserver(format!("{status}: {text}")));
                    }
                }
                Err(e) if attempt + 1 < 3 => {
                    debug!(%url, error = %e, attempt, "homeserver request failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }

            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        Err(BridgeError::Homeserver(format!("{url}: retries exhausted")))
    }
}

#[async_trait]
impl MatrixApi for HttpMatrixClient {
    async fn ensure_registered(&self, localpart: &str) -> Result<()> {
        let body = json!({
            "type": "m.login.application_service",
            "username": localpart,
        });
        match self
            .request(
                reqwest::Method::POST,
                "/_matrix/client/v3/register",
                None,
                Some(&body),
            )
            .await
        {
            Ok(_) => Ok(()),
            // the puppet already exists, which is the steady state
            Err(BridgeError::Homeserver(msg)) if msg.contains("M_USER_IN_USE") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_displayname(&self, user_id: &str, displayname: &str) -> Result<()> {
        let path = format!("/_matrix/client/v3/profile/{user_id}/displayname");
        let body = json!({ "displayname": displayname });
        self.request(reqwest::Method::PUT, &path, Some(user_id), Some(&body))
            .await
            .map(|_| ())
    }

    async fn create_room(
        &self,
        name: &str,
        topic: Option<&str>,
        invite: &[String],
    ) -> Result<String> {
        let mut body = json!({
            "name": name,
            "invite": invite,
            "preset": "private_chat",
            "is_direct": false,
        });
        if let Some(topic) = topic {
            body["topic"] = json!(topic);
        }
        let resp = self
            .request(
                reqwest::Method::POST,
                "/_matrix/client/v3/createRoom",
                None,
                Some(&body),
            )
            .await?;
        resp.get("room_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| BridgeError::Homeserver("createRoom returned no room_id".into()))
    }

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        let path = format!("/_matrix/client/v3/rooms/{room_id}/invite");
        let body = json!({ "user_id": user_id });
        self.request(reqwest::Method::POST, &path, None, Some(&body))
            .await
            .map(|_| ())
    }

    async fn join(&self, room_id: &str, as_user: Option<&str>) -> Result<()> {
        let path = format!("/_matrix/client/v3/join/{room_id}");
        self.request(reqwest::Method::POST, &path, as_user, Some(&json!({})))
            .await
            .map(|_| ())
    }

    async fn leave(&self, room_id: &str, as_user: Option<&str>) -> Result<()> {
        let path = format!("/_matrix/client/v3/rooms/{room_id}/leave");
        self.request(reqwest::Method::POST, &path, as_user, Some(&json!({})))
            .await
            .map(|_| ())
    }

    async fn send_message(
        &self,
        room_id: &str,
        as_user: Option<&str>,
        content: MessageContent,
    ) -> Result<String> {
        let path = format!(
            "/_matrix/client/v3/rooms/{room_id}/send/m.room.message/{}",
            self.next_txn_id()
        );
        let body = serde_json::to_value(&content)
            .map_err(|e| BridgeError::Homeserver(e.to_string()))?;
        let resp = self
            .request(reqwest::Method::PUT, &path, as_user, Some(&body))
            .await?;
        Ok(resp
            .get("event_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned())
    }

    async fn send_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> Result<()> {
        let path = format!("/_matrix/client/v3/rooms/{room_id}/state/{event_type}/{state_key}");
        self.request(reqwest::Method::PUT, &path, None, Some(&content))
            .await
            .map(|_| ())
    }
}

/// One queued Matrix-bound send.
pub struct QueuedSend {
    pub room_id: String,
    pub as_user: Option<String>,
    pub content: MessageContent,
}

/// Bounded, ordered delivery queue for Matrix-bound events.
///
/// One queue per session. Submission order is preserved; on overflow the
/// oldest entry is dropped and the drop is reported so operators know the
/// Matrix side may have diverged from IRC.
pub struct SendQueue {
    inner: Arc<SendQueueInner>,
}

struct SendQueueInner {
    queue: Mutex<VecDeque<QueuedSend>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SendQueue {
    /// Create the queue and spawn its worker task. The worker drains what
    /// is left and exits once the handle is dropped.
    pub fn spawn(api: Arc<dyn MatrixApi>, capacity: usize) -> Self {
        let inner = Arc::new(SendQueueInner {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let worker = inner.clone();
        tokio::spawn(async move {
            loop {
                let next = worker.queue.lock().pop_front();
                match next {
                    Some(send) => {
                        if let Err(e) = api
                            .send_message(&send.room_id, send.as_user.as_deref(), send.content)
                            .await
                        {
                            warn!(room = %send.room_id, error = %e, "dropping Matrix-bound event");
                        }
                    }
                    None => {
                        if worker.closed.load(Ordering::Acquire) {
                            return;
                        }
                        worker.notify.notified().await;
                    }
                }
            }
        });

        Self { inner }
    }

    /// Enqueue a send, evicting the oldest entry when full.
    ///
    /// Returns `false` when an eviction happened, so the caller can surface
    /// the gap to the admin room.
    pub fn enqueue(&self, send: QueuedSend) -> bool {
        let mut queue = self.inner.queue.lock();
        let mut intact = true;
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            intact = false;
        }
        queue.push_back(send);
        drop(queue);
        self.inner.notify.notify_one();
        intact
    }

    /// Total number of events evicted due to overflow.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_ids_are_unique() {
        let client = HttpMatrixClient::new("http://localhost:8008/", "tok");
        let a = client.next_txn_id();
        let b = client.next_txn_id();
        assert_ne!(a, b);
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let client = HttpMatrixClient::new("http://hs.example/", "tok");
        assert_eq!(client.base_url, "http://hs.example");
    }

    struct NullApi;

    #[async_trait]
    impl MatrixApi for NullApi {
        async fn ensure_registered(&self, _localpart: &str) -> Result<()> {
            Ok(())
        }
        async fn set_displayname(&self, _user_id: &str, _displayname: &str) -> Result<()> {
            Ok(())
        }
        async fn create_room(
            &self,
            _name: &str,
            _topic: Option<&str>,
            _invite: &[String],
        ) -> Result<String> {
            Ok("!room:test".into())
        }
        async fn invite(&self, _room_id: &str, _user_id: &str) -> Result<()> {
            Ok(())
        }
        async fn join(&self, _room_id: &str, _as_user: Option<&str>) -> Result<()> {
            Ok(())
        }
        async fn leave(&self, _room_id: &str, _as_user: Option<&str>) -> Result<()> {
            Ok(())
        }
        async fn send_message(
            &self,
            _room_id: &str,
            _as_user: Option<&str>,
            _content: MessageContent,
        ) -> Result<String> {
            Ok("$event:test".into())
        }
        async fn send_state(
            &self,
            _room_id: &str,
            _event_type: &str,
            _state_key: &str,
            _content: Value,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_queue_worker_exits_with_its_handle() {
        let api: Arc<dyn MatrixApi> = Arc::new(NullApi);
        let weak = Arc::downgrade(&api);
        let queue = SendQueue::spawn(api.clone(), 4);
        queue.enqueue(QueuedSend {
            room_id: "!room:test".into(),
            as_user: None,
            content: MessageContent::text("bye"),
        });
        drop(queue);
        drop(api);

        // the worker drains the queue and releases its api reference
        for _ in 0..100 {
            if weak.upgrade().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue worker still holds the api after its handle was dropped");
    }
}
