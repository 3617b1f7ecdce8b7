//! Room Mapper - bidirectional IRC target ↔ Matrix room and IRC nick ↔
//! puppet association, scoped to one network session.
//!
//! All keys are case-folded with the server-advertised casemapping so that
//! `Foo[` and `foo{` (rfc1459) land on the same entity. Puppets carry an
//! explicit reference count of the channels that can currently see the
//! nickname; at zero the puppet is retired from mapped rooms.

use std::collections::HashMap;
use std::sync::Arc;

use iron_proto::Casemapping;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::matrix::MatrixApi;

/// One IRC target bridged to one Matrix room.
#[derive(Debug, Clone)]
pub struct RoomMapping {
    /// Display form of the target (channel name or peer nick).
    pub target: String,
    pub room_id: String,
    pub is_channel: bool,
}

#[derive(Debug)]
struct PuppetEntry {
    user_id: String,
    nick: String,
    refs: usize,
}

/// Per-session mapping state. Owned by the session task; no locking.
pub struct RoomMapper {
    api: Arc<dyn MatrixApi>,
    casemapping: Casemapping,
    network: String,
    owner_mxid: String,
    puppet_prefix: String,
    server_name: String,
    rooms: HashMap<String, RoomMapping>,
    room_index: HashMap<String, String>,
    puppets: HashMap<String, PuppetEntry>,
}

impl RoomMapper {
    pub fn new(
        api: Arc<dyn MatrixApi>,
        network: &str,
        owner_mxid: &str,
        puppet_prefix: &str,
        server_name: &str,
    ) -> Self {
        Self {
            api,
            casemapping: Casemapping::default(),
            network: network.to_owned(),
            owner_mxid: owner_mxid.to_owned(),
            puppet_prefix: puppet_prefix.to_owned(),
            server_name: server_name.to_owned(),
            rooms: HashMap::new(),
            room_index: HashMap::new(),
            puppets: HashMap::new(),
        }
    }

    /// Adopt the server-advertised casemapping, re-folding existing keys.
    pub fn set_casemapping(&mut self, casemapping: Casemapping) {
        if self.casemapping == casemapping {
            return;
        }
        self.casemapping = casemapping;
        self.rooms = self
            .rooms
            .drain()
            .map(|(_, m)| (casemapping.fold(&m.target), m))
            .collect();
        self.puppets = self
            .puppets
            .drain()
            .map(|(_, p)| (casemapping.fold(&p.nick), p))
            .collect();
    }

    pub fn casemapping(&self) -> Casemapping {
        self.casemapping
    }

    /// Resolve the room for an IRC target, creating it on first need.
    ///
    /// Idempotent: a known target returns the existing mapping untouched.
    #[instrument(skip(self), fields(network = %self.network))]
    pub async fn resolve_room_for_target(&mut self, target: &str) -> Result<RoomMapping> {
        let key = self.casemapping.fold(target);
        if let Some(mapping) = self.rooms.get(&key) {
            return Ok(mapping.clone());
        }

        let is_channel = target.starts_with(['#', '&']);
        let name = format!("{target} ({})", self.network);
        let room_id = self
            .api
            .create_room(&name, None, std::slice::from_ref(&self.owner_mxid))
            .await?;
        debug!(%target, %room_id, "created room for IRC target");

        let mapping = RoomMapping {
            target: target.to_owned(),
            room_id: room_id.clone(),
            is_channel,
        };
        self.rooms.insert(key.clone(), mapping.clone());
        self.room_index.insert(room_id, key);
        Ok(mapping)
    }

    /// Insert a mapping that already exists on the Matrix side.
    pub fn adopt_mapping(&mut self, mapping: RoomMapping) {
        let key = self.casemapping.fold(&mapping.target);
        self.room_index.insert(mapping.room_id.clone(), key.clone());
        self.rooms.insert(key, mapping);
    }

    /// Existing mapping for a target, if any.
    pub fn room_for_target(&self, target: &str) -> Option<&RoomMapping> {
        self.rooms.get(&self.casemapping.fold(target))
    }

    /// Reverse lookup from a Matrix room ID.
    pub fn target_for_room(&self, room_id: &str) -> Option<&RoomMapping> {
        self.rooms.get(self.room_index.get(room_id)?)
    }

    /// Drop a mapping (part, kick, unbridge). Returns the mapping if known.
    pub fn remove_target(&mut self, target: &str) -> Option<RoomMapping> {
        let mapping = self.rooms.remove(&self.casemapping.fold(target))?;
        self.room_index.remove(&mapping.room_id);
        Some(mapping)
    }

    /// All current mappings (for disconnect cleanup and routing setup).
    pub fn mappings(&self) -> impl Iterator<Item = &RoomMapping> {
        self.rooms.values()
    }

    /// Resolve the puppet identity for a nickname, creating it lazily.
    ///
    /// Idempotent: re-resolving a known nick returns the same identity and
    /// performs no Matrix calls.
    pub async fn resolve_puppet(&mut self, nick: &str) -> Result<String> {
        let key = self.casemapping.fold(nick);
        if let Some(puppet) = self.puppets.get(&key) {
            return Ok(puppet.user_id.clone());
        }

        let localpart = format!(
            "{}{}_{}",
            self.puppet_prefix,
            escape_localpart(&self.casemapping.fold(&self.network)),
            escape_localpart(&key)
        );
        let user_id = format!("@{localpart}:{}", self.server_name);

        self.api.ensure_registered(&localpart).await?;
        self.api.set_displayname(&user_id, nick).await?;
        debug!(%nick, %user_id, "created puppet");

        self.puppets.insert(
            key,
            PuppetEntry {
                user_id: user_id.clone(),
                nick: nick.to_owned(),
                refs: 0,
            },
        );
        Ok(user_id)
    }

    /// A nickname became visible in a channel: bump its reference count
    /// and join its puppet to the channel's room.
    pub async fn member_joined(&mut self, channel: &str, nick: &str) -> Result<()> {
        let user_id = self.resolve_puppet(nick).await?;
        let room_id = match self.room_for_target(channel) {
            Some(mapping) => mapping.room_id.clone(),
            None => return Ok(()),
        };

        if let Some(puppet) = self.puppets.get_mut(&self.casemapping.fold(nick)) {
            puppet.refs += 1;
        }
        self.api.invite(&room_id, &user_id).await.ok();
        self.api.join(&room_id, Some(&user_id)).await?;
        Ok(())
    }

    /// A nickname left a channel (PART/KICK/QUIT/disconnect). Decrements
    /// the reference count; at zero the puppet leaves and is retired.
    pub async fn member_left(&mut self, channel: &str, nick: &str) -> Result<()> {
        let key = self.casemapping.fold(nick);
        let Some(puppet) = self.puppets.get_mut(&key) else {
            return Ok(());
        };
        let user_id = puppet.user_id.clone();
        puppet.refs = puppet.refs.saturating_sub(1);
        let retire = puppet.refs == 0;

        if let Some(mapping) = self.room_for_target(channel) {
            let room_id = mapping.room_id.clone();
            self.api.leave(&room_id, Some(&user_id)).await.ok();
        }

        if retire {
            debug!(%nick, "retiring puppet with no remaining references");
            self.puppets.remove(&key);
        }
        Ok(())
    }

    /// A nickname changed: the puppet is renamed, not recreated.
    pub async fn nick_renamed(&mut self, old: &str, new: &str) -> Result<()> {
        let old_key = self.casemapping.fold(old);
        let new_key = self.casemapping.fold(new);
        let Some(mut puppet) = self.puppets.remove(&old_key) else {
            return Ok(());
        };

        let user_id = puppet.user_id.clone();
        puppet.nick = new.to_owned();
        self.puppets.insert(new_key, puppet);
        self.api.set_displayname(&user_id, new).await?;
        Ok(())
    }

    /// Current reference count, for tests and diagnostics.
    pub fn puppet_refs(&self, nick: &str) -> Option<usize> {
        self.puppets
            .get(&self.casemapping.fold(nick))
            .map(|p| p.refs)
    }

    /// Channels a nickname is known in cannot be derived here; callers
    /// (the session's channel state) drive per-channel membership events.
    pub fn known_puppet(&self, nick: &str) -> Option<&str> {
        self.puppets
            .get(&self.casemapping.fold(nick))
            .map(|p| p.user_id.as_str())
    }
}

/// Escape a string into the Matrix localpart grammar (`a-z0-9._=\-/`),
/// hex-escaping everything else as `=xx`.
fn escape_localpart(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' | '/' => out.push(c),
            c => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("={b:02x}"));
                }
            }
        }
    }
    out
}
