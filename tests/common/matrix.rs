//! Recording Matrix API for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use ironbridge::error::Result;
use ironbridge::matrix::types::MessageContent;
use ironbridge::matrix::MatrixApi;

/// One `send_message` call as observed by the fake homeserver.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub room_id: String,
    pub as_user: Option<String>,
    pub content: MessageContent,
}

#[derive(Default)]
pub struct RecordingMatrix {
    calls: Mutex<Vec<String>>,
    messages: Mutex<Vec<SentMessage>>,
    rooms: Mutex<Vec<(String, String)>>,
    counter: AtomicUsize,
}

impl RecordingMatrix {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.messages.lock().clone()
    }

    /// Room ID created for a room whose name contains `fragment`.
    pub fn room_named(&self, fragment: &str) -> Option<String> {
        self.rooms
            .lock()
            .iter()
            .find(|(name, _)| name.contains(fragment))
            .map(|(_, id)| id.clone())
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl MatrixApi for RecordingMatrix {
    async fn ensure_registered(&self, localpart: &str) -> Result<()> {
        self.record(format!("register {localpart}"));
        Ok(())
    }

    async fn set_displayname(&self, user_id: &str, displayname: &str) -> Result<()> {
        self.record(format!("displayname {user_id} {displayname}"));
        Ok(())
    }

    async fn create_room(
        &self,
        name: &str,
        _topic: Option<&str>,
        invite: &[String],
    ) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let room_id = format!("!room{n}:test");
        self.record(format!("create {name} invite={}", invite.join(",")));
        self.rooms.lock().push((name.to_owned(), room_id.clone()));
        Ok(room_id)
    }

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.record(format!("invite {room_id} {user_id}"));
        Ok(())
    }

    async fn join(&self, room_id: &str, as_user: Option<&str>) -> Result<()> {
        self.record(format!("join {room_id} {}", as_user.unwrap_or("-")));
        Ok(())
    }

    async fn leave(&self, room_id: &str, as_user: Option<&str>) -> Result<()> {
        self.record(format!("leave {room_id} {}", as_user.unwrap_or("-")));
        Ok(())
    }

    async fn send_message(
        &self,
        room_id: &str,
        as_user: Option<&str>,
        content: MessageContent,
    ) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.messages.lock().push(SentMessage {
            room_id: room_id.to_owned(),
            as_user: as_user.map(str::to_owned),
            content,
        });
        Ok(format!("$event{n}:test"))
    }

    async fn send_state(
        &self,
        room_id: &str,
        event_type: &str,
        _state_key: &str,
        _content: Value,
    ) -> Result<()> {
        self.record(format!("state {room_id} {event_type}"));
        Ok(())
    }
}
