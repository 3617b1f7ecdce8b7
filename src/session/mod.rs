//! Network session - the per-(user, network) actor that owns one IRC
//! connection, its room mappings and its Matrix delivery queue.
//!
//! The session is a single task; all of its state is task-local and the
//! rest of the bridge talks to it through [`SessionCommand`]. Reconnection
//! policy lives here, not in the connection: the connection reports one
//! `Disconnected` and dies, the session decides whether and when to dial
//! again.

pub mod registry;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use iron_proto::{Ctcp, CtcpKind, Message};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{NetworkConfig, SaslMechanism};
use crate::context::BridgeContext;
use crate::irc::connection::{self, ConnectOpts, ConnectionHandle, SaslAuth};
use crate::irc::event::ProtocolEvent;
use crate::mapper::RoomMapper;
use crate::matrix::client::{QueuedSend, SendQueue};
use crate::matrix::types::MatrixEvent;
use crate::pipeline::{IrcPayloadKind, Pipeline, WireIdentity};
use crate::session::registry::{SessionHandle, SessionKey};

/// A connection that stayed up at least this long resets the backoff.
const STABLE_UPTIME: Duration = Duration::from_secs(300);

/// Longest hostname the server may hang on our hostmask; used to budget
/// outbound line length before we know the real one.
const MAX_HOSTNAME_LEN: usize = 63;

/// Commands a session accepts from the gateway and the admin interpreter.
#[derive(Debug)]
pub enum SessionCommand {
    /// A Matrix room event routed to this session.
    Matrix(Box<MatrixEvent>),
    Join {
        channel: String,
        key: Option<String>,
    },
    Part(String),
    SetNick(String),
    /// Pre-parsed raw line, CR/LF already rejected by the interpreter.
    Raw(String),
    /// Report the lifecycle state, for `networks` output.
    Status(oneshot::Sender<String>),
    /// Disconnect and end the task.
    Shutdown,
}

/// Lifecycle of a session, reported in `networks` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Connecting,
    Registering,
    Authenticating,
    Joining,
    Ready,
    Reconnecting,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Connecting => "connecting",
            Self::Registering => "registering",
            Self::Authenticating => "authenticating",
            Self::Joining => "joining",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Exponential backoff with jitter. `jitter` is uniform in `[0, 1)` and
/// scales the capped delay into `[0.5·d, 1.5·d]`, itself capped.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, cap: Duration, jitter: f64) -> Duration {
    let doubled = base.saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX));
    let capped = doubled.min(cap);
    capped.mul_f64(0.5 + jitter.clamp(0.0, 1.0)).min(cap)
}

/// Start a session for `(user, network)`. Fails when the network is
/// unknown, misconfigured, or already live.
pub fn activate(ctx: &Arc<BridgeContext>, user: &str, network: &str) -> Result<(), String> {
    let config = ctx
        .store
        .network(user, network)
        .ok_or_else(|| format!("no such network: {network}"))?;
    config.validate()?;

    let key = SessionKey {
        user: user.to_owned(),
        network: network.to_owned(),
    };
    let (tx, rx) = mpsc::channel(64);
    if !ctx.registry.claim(key.clone(), SessionHandle { tx }) {
        return Err(format!("already connected to {network}"));
    }

    let session = NetworkSession::new(ctx.clone(), key.clone(), config);
    tokio::spawn(async move {
        session.run(rx).await;
    });
    info!(%user, %network, "session activated");
    Ok(())
}

/// Per-channel membership as seen on the wire. Destroyed on disconnect;
/// room mappings survive it.
#[derive(Default)]
struct ChannelState {
    members: HashSet<String>,
}

struct NetworkSession {
    ctx: Arc<BridgeContext>,
    key: SessionKey,
    config: NetworkConfig,
    state: SessionState,
    mapper: RoomMapper,
    pipeline: Pipeline,
    send_queue: SendQueue,
    admin_room: Option<String>,

    conn: Option<ConnectionHandle>,
    events: Option<mpsc::Receiver<ProtocolEvent>>,
    current_nick: String,
    /// The configured nick; reclaimed when it comes free after a 433.
    desired_nick: String,
    username: String,
    /// Channels (and PM peers) folded by the active casemapping.
    channels: HashMap<String, ChannelState>,
    /// Channels still awaiting their JOIN (or a join failure) before Ready.
    pending_joins: HashSet<String>,
    /// Channels we were in when the connection dropped, for rejoin.
    rejoin: Vec<String>,

    /// Matrix events held while not Ready, oldest dropped on overflow.
    pending: VecDeque<MatrixEvent>,
    pending_overflowed: bool,

    attempt: u32,
    reconnect_at: Option<Instant>,
    connected_at: Option<Instant>,
    next_server: usize,
    shutting_down: bool,
}

async fn recv_event(events: &mut Option<mpsc::Receiver<ProtocolEvent>>) -> Option<ProtocolEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

enum Step {
    Cmd(Option<SessionCommand>),
    Irc(Option<ProtocolEvent>),
    ReconnectDue,
}

impl NetworkSession {
    fn new(ctx: Arc<BridgeContext>, key: SessionKey, config: NetworkConfig) -> Self {
        let localpart = mxid_localpart(&key.user);
        let nick = config.nick.clone().unwrap_or_else(|| localpart.clone());
        let username = config.username.clone().unwrap_or(localpart);
        let mapper = RoomMapper::new(
            ctx.matrix.clone(),
            &key.network,
            &key.user,
            &ctx.config.puppet_prefix,
            &ctx.config.server_name,
        );
        let pipeline = Pipeline::new(ctx.config.tuning.pending_edit_len);
        let send_queue = SendQueue::spawn(ctx.matrix.clone(), ctx.config.tuning.matrix_queue_len);
        let admin_room = ctx.store.user(&key.user).and_then(|u| u.admin_room);

        Self {
            ctx,
            key,
            config,
            state: SessionState::Inactive,
            mapper,
            pipeline,
            send_queue,
            admin_room,
            conn: None,
            events: None,
            current_nick: nick.clone(),
            desired_nick: nick,
            username,
            channels: HashMap::new(),
            pending_joins: HashSet::new(),
            rejoin: Vec::new(),
            pending: VecDeque::new(),
            pending_overflowed: false,
            attempt: 0,
            reconnect_at: None,
            connected_at: None,
            next_server: 0,
            shutting_down: false,
        }
    }

    #[instrument(skip(self, rx), fields(user = %self.key.user, network = %self.key.network))]
    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        self.start_connect().await;

        while !self.shutting_down {
            let step = tokio::select! {
                cmd = rx.recv() => Step::Cmd(cmd),
                ev = recv_event(&mut self.events) => Step::Irc(ev),
                _ = wait_until(self.reconnect_at) => Step::ReconnectDue,
            };

            match step {
                Step::Cmd(None) | Step::Cmd(Some(SessionCommand::Shutdown)) => {
                    self.shutting_down = true;
                    if let Some(conn) = self.conn.take() {
                        conn.close(Some("disconnecting".into())).await;
                        // drain until the task confirms the socket is gone
                        if let Some(mut events) = self.events.take() {
                            while let Some(ev) = events.recv().await {
                                if matches!(ev, ProtocolEvent::Disconnected { .. }) {
                                    break;
                                }
                            }
                        }
                    }
                    break;
                }
                Step::Cmd(Some(cmd)) => self.handle_command(cmd).await,
                Step::Irc(Some(ev)) => self.handle_irc(ev).await,
                Step::Irc(None) => {
                    // connection task died without a Disconnected event
                    self.handle_disconnect("connection task ended".into()).await;
                }
                Step::ReconnectDue => {
                    self.reconnect_at = None;
                    self.start_connect().await;
                }
            }
        }

        self.ctx.registry.release(&self.key);
        info!("session ended");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Matrix(ev) => self.handle_matrix_event(*ev).await,
            SessionCommand::Join { channel, key } => {
                let mut params = vec![channel.as_str()];
                if let Some(key) = &key {
                    params.push(key.as_str());
                }
                if self.send_line(Message::new("JOIN", params)).await {
                    self.pending_joins
                        .insert(self.mapper.casemapping().fold(&channel));
                } else {
                    self.notice(&format!("not connected; cannot join {channel}"))
                        .await;
                }
            }
            SessionCommand::Part(channel) => {
                if !self.send_line(Message::new("PART", vec![channel.as_str()])).await {
                    self.notice(&format!("not connected; cannot part {channel}"))
                        .await;
                }
            }
            SessionCommand::SetNick(nick) => {
                self.desired_nick = nick.clone();
                if self.conn.is_some() {
                    self.send_line(Message::new("NICK", vec![nick.as_str()])).await;
                } else {
                    // takes effect on the next connect
                    self.current_nick = nick.clone();
                    self.notice(&format!("nick will be {nick} on next connect"))
                        .await;
                }
            }
            SessionCommand::Raw(line) => match line.parse::<Message>() {
                Ok(msg) => {
                    if !self.send_line(msg).await {
                        self.notice("not connected").await;
                    }
                }
                Err(e) => self.notice(&format!("cannot parse line: {e}")).await,
            },
            SessionCommand::Status(reply) => {
                let _ = reply.send(self.state.as_str().to_owned());
            }
            SessionCommand::Shutdown => unreachable!("handled in run"),
        }
    }

    /// Send one IRC message if connected. Returns whether it was accepted.
    async fn send_line(&mut self, msg: Message) -> bool {
        match &self.conn {
            Some(conn) => conn.send(msg).await.is_ok(),
            None => false,
        }
    }

    async fn notice(&self, text: &str) {
        if let Some(room) = &self.admin_room {
            self.send_queue.enqueue(QueuedSend {
                room_id: room.clone(),
                as_user: None,
                content: crate::matrix::types::MessageContent::notice(format!(
                    "[{}] {text}",
                    self.key.network
                )),
            });
        } else {
            info!(%text, "admin notice (no admin room)");
        }
    }

    async fn start_connect(&mut self) {
        if self.shutting_down || self.conn.is_some() {
            return;
        }
        let server = self.config.servers[self.next_server % self.config.servers.len()].clone();
        self.next_server = self.next_server.wrapping_add(1);
        self.state = SessionState::Connecting;
        self.notice(&format!(
            "connecting to {}:{}{}",
            server.address,
            server.port,
            if server.tls { " (TLS)" } else { "" }
        ))
        .await;

        let sasl = match self.config.effective_sasl() {
            Some(SaslMechanism::Plain) => Some(SaslAuth::Plain {
                username: self.config.sasl_username.clone().unwrap_or_default(),
                password: self.config.sasl_password.clone().unwrap_or_default(),
            }),
            Some(SaslMechanism::External) => Some(SaslAuth::External),
            Some(SaslMechanism::None) | None => None,
        };
        let opts = ConnectOpts {
            server,
            nick: self.current_nick.clone(),
            username: self.username.clone(),
            realname: self
                .config
                .realname
                .clone()
                .unwrap_or_else(|| self.current_nick.clone()),
            pass: self.config.password.clone(),
            sasl,
            tls_cert: self.config.tls_cert.clone(),
            send_interval: Duration::from_millis(self.ctx.config.tuning.send_interval_ms),
        };

        match connection::connect(opts, self.ctx.identd.clone(), self.username.clone()).await {
            Ok((handle, events)) => {
                self.conn = Some(handle);
                self.events = Some(events);
            }
            Err(e) => {
                self.notice(&format!("connect failed ({}): {e}", e.error_code()))
                    .await;
                if e.is_retryable() {
                    self.schedule_reconnect().await;
                } else {
                    // bad certificate path, unparseable proxy url and the
                    // like: retrying cannot help, wait for a config change
                    self.notice("giving up; fix the network config and `connect` again")
                        .await;
                    self.shutting_down = true;
                }
            }
        }
    }

    async fn schedule_reconnect(&mut self) {
        if self.shutting_down {
            return;
        }
        let tuning = &self.ctx.config.tuning;
        let delay = backoff_delay(
            self.attempt,
            Duration::from_secs(tuning.base_backoff_secs),
            Duration::from_secs(tuning.max_backoff_secs),
            rand::random::<f64>(),
        );
        self.attempt = self.attempt.saturating_add(1);
        self.state = SessionState::Reconnecting;
        self.reconnect_at = Some(Instant::now() + delay);
        self.notice(&format!("reconnecting in {}s", delay.as_secs()))
            .await;
    }

    async fn handle_disconnect(&mut self, reason: String) {
        self.conn = None;
        self.events = None;

        // channel membership does not survive the socket; mappings do
        self.rejoin = self
            .channels
            .keys()
            .filter(|k| k.starts_with(['#', '&']))
            .cloned()
            .collect();
        let channels = std::mem::take(&mut self.channels);
        for (channel, state) in channels {
            for nick in state.members {
                if let Err(e) = self.mapper.member_left(&channel, &nick).await {
                    warn!(%channel, %nick, error = %e, "failed to retire member");
                }
            }
        }
        self.pending_joins.clear();

        let stable = self
            .connected_at
            .take()
            .is_some_and(|t| t.elapsed() >= STABLE_UPTIME);
        if stable {
            self.attempt = 0;
        }

        self.notice(&format!("disconnected: {reason}")).await;
        if self.shutting_down {
            self.state = SessionState::Inactive;
        } else {
            self.schedule_reconnect().await;
        }
    }

    async fn handle_irc(&mut self, ev: ProtocolEvent) {
        match ev {
            ProtocolEvent::Connected { server } => {
                debug!(%server, "transport up");
                self.state = if self.config.effective_sasl().is_some() {
                    SessionState::Authenticating
                } else {
                    SessionState::Registering
                };
            }
            ProtocolEvent::Disconnected { reason } => {
                self.handle_disconnect(reason).await;
            }
            ProtocolEvent::Welcome { nick } => {
                self.current_nick = nick;
                self.connected_at = Some(Instant::now());
                self.notice(&format!("connected as {}", self.current_nick))
                    .await;
                self.run_autocmd().await;
                self.begin_joins().await;
            }
            ProtocolEvent::IsupportUpdated(isupport) => {
                self.mapper.set_casemapping(isupport.casemapping());
            }
            ProtocolEvent::AuthResult { ok, detail } => {
                if ok {
                    self.state = SessionState::Registering;
                    self.notice(&format!("authentication succeeded: {detail}"))
                        .await;
                } else {
                    self.notice(&format!("authentication failed: {detail}"))
                        .await;
                }
            }
            ProtocolEvent::Numeric { code, params } => {
                self.handle_numeric(code, params).await;
            }
            ProtocolEvent::Message {
                from,
                target,
                text,
                action,
            } => {
                let kind = if action {
                    IrcPayloadKind::Action
                } else {
                    IrcPayloadKind::Privmsg
                };
                self.deliver_irc_message(&from, &target, &text, kind).await;
            }
            ProtocolEvent::Notice { from, target, text } => {
                // server notices and pre-registration noise go to the admin room
                if from.contains('.') || !self.is_known_target(&target) {
                    self.notice(&format!("{from}: {text}")).await;
                } else {
                    self.deliver_irc_message(&from, &target, &text, IrcPayloadKind::Notice)
                        .await;
                }
            }
            ProtocolEvent::CtcpRequest { from, ctcp } => {
                if !matches!(ctcp.kind, CtcpKind::Action) {
                    self.notice(&format!("CTCP {} request from {from}", ctcp.kind.as_str()))
                        .await;
                }
            }
            ProtocolEvent::CtcpResponse { from, ctcp } => {
                let detail = ctcp.params.as_deref().unwrap_or("");
                self.notice(&format!("CTCP {} reply from {from}: {detail}", ctcp.kind.as_str()))
                    .await;
            }
            ProtocolEvent::Join { nick, channel } => {
                self.handle_join(nick, channel).await;
            }
            ProtocolEvent::Part {
                nick,
                channel,
                reason: _,
            } => {
                self.handle_leave(&nick, &channel).await;
            }
            ProtocolEvent::Kick {
                channel,
                nick,
                by,
                reason,
            } => {
                let us = self.is_self(&nick);
                if us {
                    self.notice(&format!(
                        "kicked from {channel} by {by}: {}",
                        reason.as_deref().unwrap_or("")
                    ))
                    .await;
                }
                self.handle_leave(&nick, &channel).await;
            }
            ProtocolEvent::Quit { nick, reason: _ } => {
                if self.is_self(&nick) {
                    return;
                }
                self.try_reclaim_nick(&nick).await;
                let folded = self.mapper.casemapping().fold(&nick);
                let affected: Vec<String> = self
                    .channels
                    .iter()
                    .filter(|(_, state)| state.members.contains(&folded))
                    .map(|(name, _)| name.clone())
                    .collect();
                for channel in affected {
                    self.handle_leave(&nick, &channel).await;
                }
            }
            ProtocolEvent::NickChange { old, new } => {
                if self.is_self(&old) {
                    self.notice(&format!("nick changed to {new}")).await;
                    self.current_nick = new;
                    return;
                }
                let old_folded = self.mapper.casemapping().fold(&old);
                let new_folded = self.mapper.casemapping().fold(&new);
                for state in self.channels.values_mut() {
                    if state.members.remove(&old_folded) {
                        state.members.insert(new_folded.clone());
                    }
                }
                if let Err(e) = self.mapper.nick_renamed(&old, &new).await {
                    warn!(%old, %new, error = %e, "failed to rename puppet");
                }
                self.try_reclaim_nick(&old).await;
            }
            ProtocolEvent::ModeChange { target, modes } => {
                debug!(%target, ?modes, "mode change");
            }
            ProtocolEvent::Topic {
                channel,
                topic,
                changed: _,
            } => {
                if let Some(mapping) = self.mapper.room_for_target(&channel) {
                    let room_id = mapping.room_id.clone();
                    if let Err(e) = self.ctx.matrix.set_room_topic(&room_id, &topic).await {
                        warn!(%channel, error = %e, "failed to set topic");
                    }
                }
            }
            ProtocolEvent::Names { channel, members } => {
                let cm = self.mapper.casemapping();
                let self_folded = cm.fold(&self.current_nick);
                let state = self.channels.entry(cm.fold(&channel)).or_default();
                let mut added = Vec::new();
                for member in members {
                    let member_folded = cm.fold(&member.nick);
                    // a case-variant echo of our own nick is still us
                    if member_folded == self_folded {
                        continue;
                    }
                    if state.members.insert(member_folded) {
                        added.push(member.nick);
                    }
                }
                for nick in added {
                    if let Err(e) = self.mapper.member_joined(&channel, &nick).await {
                        warn!(%channel, %nick, error = %e, "failed to admit member");
                    }
                }
            }
            ProtocolEvent::EndOfNames { channel } => {
                debug!(%channel, "names synced");
            }
            ProtocolEvent::Pong { .. } => {}
        }
    }

    fn is_self(&self, nick: &str) -> bool {
        self.mapper.casemapping().eq(nick, &self.current_nick)
    }

    /// A nick we wanted but lost to a 433 just came free; take it back.
    async fn try_reclaim_nick(&mut self, vacated: &str) {
        let cm = self.mapper.casemapping();
        if !cm.eq(vacated, &self.desired_nick) || cm.eq(&self.current_nick, &self.desired_nick) {
            return;
        }
        debug!(nick = %self.desired_nick, "configured nick came free, reclaiming");
        let desired = self.desired_nick.clone();
        self.send_line(Message::new("NICK", vec![desired.as_str()])).await;
    }

    fn is_known_target(&self, target: &str) -> bool {
        self.mapper.room_for_target(target).is_some()
            || self.mapper.casemapping().eq(target, &self.current_nick)
    }

    async fn run_autocmd(&mut self) {
        let Some(autocmd) = self.config.autocmd.clone() else {
            return;
        };
        for raw in autocmd.split(';') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match raw.parse::<Message>() {
                Ok(msg) => {
                    self.send_line(msg).await;
                }
                Err(e) => self.notice(&format!("bad autocmd line {raw:?}: {e}")).await,
            }
        }
    }

    async fn begin_joins(&mut self) {
        self.state = SessionState::Joining;
        let mut targets: Vec<String> = self.config.autojoin.clone();
        targets.extend(std::mem::take(&mut self.rejoin));

        self.pending_joins.clear();
        for channel in targets {
            let folded = self.mapper.casemapping().fold(&channel);
            if self.pending_joins.insert(folded)
                && !self.send_line(Message::new("JOIN", vec![channel.as_str()])).await
            {
                break;
            }
        }
        self.maybe_ready().await;
    }

    async fn maybe_ready(&mut self) {
        if self.state != SessionState::Joining || !self.pending_joins.is_empty() {
            return;
        }
        self.state = SessionState::Ready;
        info!("session ready");
        // a clean flush ends the reported gap; the next overflow is a new one
        self.pending_overflowed = false;
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            debug!(count = pending.len(), "flushing held Matrix events");
        }
        for ev in pending {
            self.handle_matrix_event(ev).await;
        }
    }

    async fn handle_join(&mut self, nick: String, channel: String) {
        let folded = self.mapper.casemapping().fold(&channel);
        if self.is_self(&nick) {
            self.channels.entry(folded.clone()).or_default();
            match self.mapper.resolve_room_for_target(&channel).await {
                Ok(mapping) => {
                    if let Some(tx) = self.ctx.registry.session(&self.key) {
                        self.ctx.registry.register_room(&mapping.room_id, tx);
                    }
                }
                Err(e) => {
                    self.notice(&format!("cannot create room for {channel}: {e}"))
                        .await;
                }
            }
            self.pending_joins.remove(&folded);
            self.maybe_ready().await;
            return;
        }

        let member_folded = self.mapper.casemapping().fold(&nick);
        let state = self.channels.entry(folded).or_default();
        if state.members.insert(member_folded) {
            if let Err(e) = self.mapper.member_joined(&channel, &nick).await {
                warn!(%channel, %nick, error = %e, "failed to admit member");
            }
        }
    }

    async fn handle_leave(&mut self, nick: &str, channel: &str) {
        let folded = self.mapper.casemapping().fold(channel);
        if self.is_self(nick) {
            if let Some(state) = self.channels.remove(&folded) {
                for member in state.members {
                    if let Err(e) = self.mapper.member_left(channel, &member).await {
                        warn!(%channel, nick = %member, error = %e, "failed to retire member");
                    }
                }
            }
            if let Some(mapping) = self.mapper.remove_target(channel) {
                self.ctx.registry.unregister_room(&mapping.room_id);
            }
            self.pending_joins.remove(&folded);
            self.maybe_ready().await;
            return;
        }

        let member_folded = self.mapper.casemapping().fold(nick);
        if let Some(state) = self.channels.get_mut(&folded) {
            if state.members.remove(&member_folded) {
                if let Err(e) = self.mapper.member_left(channel, nick).await {
                    warn!(%channel, %nick, error = %e, "failed to retire member");
                }
            }
        }
    }

    async fn handle_numeric(&mut self, code: u16, params: Vec<String>) {
        match code {
            // join failures: banned, full, invite-only, bad key, no such channel
            403 | 405 | 471 | 473 | 474 | 475 => {
                if let Some(channel) = params.get(1) {
                    let folded = self.mapper.casemapping().fold(channel);
                    if self.pending_joins.remove(&folded) {
                        self.notice(&format!(
                            "cannot join {channel}: {}",
                            params.last().map(String::as_str).unwrap_or("")
                        ))
                        .await;
                        self.maybe_ready().await;
                    }
                }
            }
            400..=599 => {
                self.notice(&format!("server error {code}: {}", params.join(" ")))
                    .await;
            }
            _ => {}
        }
    }

    /// Bridge one inbound IRC message into Matrix via the send queue.
    async fn deliver_irc_message(
        &mut self,
        from: &str,
        target: &str,
        text: &str,
        kind: IrcPayloadKind,
    ) {
        let is_pm = self.mapper.casemapping().eq(target, &self.current_nick);
        let room_target = if is_pm { from } else { target };

        let mapping = match self.mapper.resolve_room_for_target(room_target).await {
            Ok(m) => m,
            Err(e) => {
                warn!(%room_target, error = %e, "cannot resolve room");
                return;
            }
        };

        if is_pm {
            // PM rooms track the peer like a one-member channel so the
            // puppet joins exactly once
            let folded_peer = self.mapper.casemapping().fold(from);
            let state = self
                .channels
                .entry(self.mapper.casemapping().fold(room_target))
                .or_default();
            if state.members.insert(folded_peer) {
                if let Err(e) = self.mapper.member_joined(room_target, from).await {
                    warn!(%from, error = %e, "failed to admit PM peer");
                }
                if let Some(tx) = self.ctx.registry.session(&self.key) {
                    self.ctx.registry.register_room(&mapping.room_id, tx);
                }
            }
        }

        let puppet = match self.mapper.resolve_puppet(from).await {
            Ok(p) => p,
            Err(e) => {
                warn!(%from, error = %e, "cannot resolve puppet");
                return;
            }
        };

        let intact = self.send_queue.enqueue(QueuedSend {
            room_id: mapping.room_id,
            as_user: Some(puppet),
            content: Pipeline::irc_to_matrix(text, kind),
        });
        if !intact && !self.pending_overflowed {
            self.pending_overflowed = true;
            self.notice("Matrix send queue overflowed; some messages were dropped")
                .await;
        }
    }

    /// Bridge one Matrix room event out to IRC, or hold it until Ready.
    async fn handle_matrix_event(&mut self, ev: MatrixEvent) {
        // the owner abandoning a bridged room parts the IRC side of it
        if ev.kind == "m.room.member"
            && ev.membership() == Some("leave")
            && ev.sender == self.key.user
            && ev.state_key.as_deref() == Some(ev.sender.as_str())
        {
            let mapping = self.mapper.target_for_room(&ev.room_id).cloned();
            if let Some(mapping) = mapping {
                if mapping.is_channel {
                    self.send_line(Message::new("PART", vec![mapping.target.as_str()]))
                        .await;
                }
                if let Some(removed) = self.mapper.remove_target(&mapping.target) {
                    self.ctx.registry.unregister_room(&removed.room_id);
                }
                self.channels
                    .remove(&self.mapper.casemapping().fold(&mapping.target));
            }
            return;
        }
        if ev.kind != "m.room.message" {
            return;
        }
        if self.state != SessionState::Ready || self.conn.is_none() {
            if self.pending.len() >= self.ctx.config.tuning.pending_queue_len {
                self.pending.pop_front();
                if !self.pending_overflowed {
                    self.pending_overflowed = true;
                    self.notice("held message queue overflowed; oldest messages dropped")
                        .await;
                }
            }
            self.pending.push_back(ev);
            return;
        }

        let Some(target) = self
            .mapper
            .target_for_room(&ev.room_id)
            .map(|m| m.target.clone())
        else {
            debug!(room = %ev.room_id, "event for unmapped room");
            return;
        };
        let Some(content) = ev.message_content() else {
            return;
        };

        let identity = WireIdentity {
            nick: self.current_nick.clone(),
            user: self.username.clone(),
            host: "x".repeat(MAX_HOSTNAME_LEN),
        };
        let plan = self
            .pipeline
            .plan_matrix_message(&identity, &target, &ev.event_id, &content);

        for line in plan.lines {
            let msg = match plan.kind {
                IrcPayloadKind::Privmsg => Message::privmsg(&target, line),
                IrcPayloadKind::Notice => Message::notice(&target, line),
                IrcPayloadKind::Action => {
                    Message::privmsg(&target, Ctcp::action(line).to_string())
                }
            };
            if !self.send_line(msg).await {
                self.notice("connection lost while sending; message not delivered")
                    .await;
                break;
            }
        }
    }
}

fn mxid_localpart(mxid: &str) -> String {
    mxid.trim_start_matches('@')
        .split(':')
        .next()
        .unwrap_or(mxid)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        // jitter 0.5 gives exactly the capped base delay
        let d: Vec<u64> = (0..8)
            .map(|a| backoff_delay(a, base, cap, 0.5).as_secs())
            .collect();
        assert_eq!(d, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn backoff_jitter_bounds() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        let d = backoff_delay(3, base, cap, 0.5);
        assert_eq!(backoff_delay(3, base, cap, 0.0), d / 2);
        let high = backoff_delay(3, base, cap, 0.9999999);
        assert!(high > d && high <= d.mul_f64(1.5));
        // jitter never exceeds the cap
        assert!(backoff_delay(10, base, cap, 0.9999999) <= cap);
    }

    #[test]
    fn backoff_monotone_for_fixed_jitter() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        let mut prev = Duration::ZERO;
        for attempt in 0..20 {
            let d = backoff_delay(attempt, base, cap, 0.25);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[test]
    fn localpart_extraction() {
        assert_eq!(mxid_localpart("@alice:example.org"), "alice");
        assert_eq!(mxid_localpart("bogus"), "bogus");
    }
}
