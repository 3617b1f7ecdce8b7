//! Protocol events produced by an IRC connection.
//!
//! Inbound wire lines are parsed once at the connection boundary into this
//! closed variant; everything downstream matches over it instead of
//! re-inspecting raw lines.

use iron_proto::{Ctcp, Isupport};

/// One member entry from a NAMES reply, prefix already split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamesEntry {
    pub nick: String,
    /// `@`, `+` or empty.
    pub prefix: String,
}

/// An event emitted by [`crate::irc::connection`].
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// Socket established and registration started.
    Connected { server: String },
    /// Socket gone; the stream ends after this event.
    Disconnected { reason: String },
    /// Registration completed (001). Carries the nickname the server
    /// acknowledged, which may differ from the one requested.
    Welcome { nick: String },
    /// Accumulated ISUPPORT state after a 005 reply.
    IsupportUpdated(Isupport),
    /// SASL outcome (903/904/905). The connection proceeds either way.
    AuthResult { ok: bool, detail: String },
    /// A numeric reply not interpreted by the connection layer.
    Numeric { code: u16, params: Vec<String> },
    /// PRIVMSG, with CTCP ACTION folded in as `action = true`.
    Message {
        from: String,
        target: String,
        text: String,
        action: bool,
    },
    Notice {
        from: String,
        target: String,
        text: String,
    },
    /// Non-ACTION CTCP request (VERSION, PING, ...).
    CtcpRequest { from: String, ctcp: Ctcp },
    /// CTCP reply embedded in a NOTICE.
    CtcpResponse { from: String, ctcp: Ctcp },
    Join {
        nick: String,
        channel: String,
    },
    Part {
        nick: String,
        channel: String,
        reason: Option<String>,
    },
    Kick {
        channel: String,
        nick: String,
        by: String,
        reason: Option<String>,
    },
    Quit {
        nick: String,
        reason: Option<String>,
    },
    NickChange {
        old: String,
        new: String,
    },
    ModeChange {
        target: String,
        modes: Vec<String>,
    },
    Topic {
        channel: String,
        topic: String,
        /// False for RPL_TOPIC on join, true for a live TOPIC change.
        changed: bool,
    },
    /// One RPL_NAMREPLY worth of members.
    Names {
        channel: String,
        members: Vec<NamesEntry>,
    },
    EndOfNames {
        channel: String,
    },
    Pong {
        token: String,
    },
}
