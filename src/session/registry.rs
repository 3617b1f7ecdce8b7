//! Session registry - enforces at most one live NetworkSession per
//! (bridge user, network) pair and routes Matrix rooms to sessions.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::session::SessionCommand;

/// Identity of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user: String,
    pub network: String,
}

/// Handle to a running session task.
pub struct SessionHandle {
    pub tx: mpsc::Sender<SessionCommand>,
}

/// Process-wide registry. Sessions register the Matrix rooms they own so
/// the appservice gateway can dispatch transactions without touching
/// session-private state.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, SessionHandle>,
    routes: DashMap<String, mpsc::Sender<SessionCommand>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a key for a new session. Returns `false` when one is already
    /// live, which makes activation idempotent at the caller.
    pub fn claim(&self, key: SessionKey, handle: SessionHandle) -> bool {
        match self.sessions.entry(key) {
            dashmap::Entry::Occupied(_) => false,
            dashmap::Entry::Vacant(entry) => {
                entry.insert(handle);
                true
            }
        }
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Sender for a live session, if any.
    pub fn session(&self, key: &SessionKey) -> Option<mpsc::Sender<SessionCommand>> {
        self.sessions.get(key).map(|h| h.tx.clone())
    }

    /// Drop a session registration (on deactivate or task exit).
    pub fn release(&self, key: &SessionKey) {
        self.sessions.remove(key);
        self.routes.retain(|_, tx| !tx.is_closed());
        debug!(user = %key.user, network = %key.network, "session released");
    }

    /// Sessions currently live, for shutdown fan-out.
    pub fn all_sessions(&self) -> Vec<(SessionKey, mpsc::Sender<SessionCommand>)> {
        self.sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().tx.clone()))
            .collect()
    }

    /// Route a Matrix room to the session that owns its mapping.
    pub fn register_room(&self, room_id: &str, tx: mpsc::Sender<SessionCommand>) {
        self.routes.insert(room_id.to_owned(), tx);
    }

    pub fn unregister_room(&self, room_id: &str) {
        self.routes.remove(room_id);
    }

    /// Session sender for a room, if the room is bridged.
    pub fn route(&self, room_id: &str) -> Option<mpsc::Sender<SessionCommand>> {
        self.routes.get(room_id).map(|tx| tx.clone())
    }
}
