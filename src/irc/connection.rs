//! IRC Connection - owns one socket to one IRC server for one identity.
//!
//! `connect` establishes the transport (TCP, optionally through SOCKS5,
//! optionally TLS with CertFP), then runs a unified task:
//!
//! ```text
//!    ┌──────────────────────────────────────────────┐
//!    │             Connection Task                  │
//!    │  FramedRead ──▶ tokio::select! ◀── mpsc cmds │
//!    │                    │                         │
//!    │   registration / SASL / PING state           │
//!    │                    │                         │
//!    │              FramedWrite (throttled)         │
//!    └──────────────────────────────────────────────┘
//! ```
//!
//! The task parses every inbound line into a [`ProtocolEvent`] exactly once
//! and never reconnects by itself; reconnection policy lives in the session.

use std::io::{BufReader, Cursor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use iron_proto::{sasl, Ctcp, CtcpKind, Isupport, LineCodec, Message};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::config::ServerEntry;
use crate::error::{BridgeError, Result};
use crate::identd::IdentTable;
use crate::irc::event::{NamesEntry, ProtocolEvent};
use crate::irc::socks::{self, ProxyConfig};

/// Data received more than this long ago means the server is gone.
const PING_TIMEOUT: Duration = Duration::from_secs(300);
/// How often the liveness check runs.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(60);
/// Bounded retries for 433 during registration before giving up.
const MAX_NICK_RETRIES: u32 = 5;

const VERSION_REPLY: &str = concat!("ironbridge ", env!("CARGO_PKG_VERSION"));

/// SASL credentials resolved from the network config.
#[derive(Debug, Clone)]
pub enum SaslAuth {
    Plain { username: String, password: String },
    External,
}

/// Everything needed to establish and register one connection.
#[derive(Debug, Clone)]
pub struct ConnectOpts {
    pub server: ServerEntry,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub pass: Option<String>,
    pub sasl: Option<SaslAuth>,
    /// PEM bundle with client certificate and key for CertFP.
    pub tls_cert: Option<PathBuf>,
    /// Minimum interval between outbound lines (flood protection).
    pub send_interval: Duration,
}

enum Outbound {
    Line(Message),
    Quit(Option<String>),
}

/// Command-send half of a connection. Dropping it quits the connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Queue a command for sending. Fails once the connection is gone.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send(Outbound::Line(msg))
            .await
            .map_err(|_| BridgeError::Transient(std::io::Error::other("connection closed")))
    }

    /// Send QUIT and close the socket.
    pub async fn close(&self, reason: Option<String>) {
        let _ = self.tx.send(Outbound::Quit(reason)).await;
    }
}

/// Establish the transport and spawn the connection task.
///
/// Events begin with `Connected` and end with exactly one `Disconnected`.
pub async fn connect(
    opts: ConnectOpts,
    identd: IdentTable,
    ident: String,
) -> Result<(ConnectionHandle, mpsc::Receiver<ProtocolEvent>)> {
    let server = opts.server.clone();

    let tcp = match &server.proxy {
        Some(url) => {
            let proxy = ProxyConfig::parse(url)?;
            socks::connect(&proxy, &server.address, server.port).await?
        }
        None => TcpStream::connect((server.address.as_str(), server.port)).await?,
    };

    let local_port = tcp.local_addr().map(|a| a.port()).ok();

    let (event_tx, event_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let handle = ConnectionHandle { tx: cmd_tx };

    if server.tls || server.tls_insecure {
        let connector = tls_connector(&opts)?;
        let name = ServerName::try_from(server.address.clone())
            .map_err(|_| BridgeError::Config(format!("invalid TLS name: {}", server.address)))?;
        let stream = connector.connect(name, tcp).await?;
        if let Some(port) = local_port {
            identd.insert(port, ident);
        }
        let _ = event_tx
            .send(ProtocolEvent::Connected {
                server: format!("{}:{}", server.address, server.port),
            })
            .await;
        tokio::spawn(run_io(stream, opts, event_tx, cmd_rx, identd, local_port));
    } else {
        if let Some(port) = local_port {
            identd.insert(port, ident);
        }
        let _ = event_tx
            .send(ProtocolEvent::Connected {
                server: format!("{}:{}", server.address, server.port),
            })
            .await;
        tokio::spawn(run_io(tcp, opts, event_tx, cmd_rx, identd, local_port));
    }

    Ok((handle, event_rx))
}

fn tls_connector(opts: &ConnectOpts) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);

    let mut config = match &opts.tls_cert {
        Some(path) => {
            let pem = std::fs::read(path)
                .map_err(|e| BridgeError::Config(format!("cannot read client cert: {e}")))?;
            let mut reader = BufReader::new(Cursor::new(&pem));
            let certs = rustls_pemfile::certs(&mut reader)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| BridgeError::Config(format!("bad client cert: {e}")))?;
            let mut reader = BufReader::new(Cursor::new(&pem));
            let key = rustls_pemfile::private_key(&mut reader)
                .map_err(|e| BridgeError::Config(format!("bad client key: {e}")))?
                .ok_or_else(|| BridgeError::Config("client cert PEM has no key".into()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| BridgeError::Config(format!("client cert rejected: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };

    if opts.server.tls_insecure {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(insecure::NoVerify::new()));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

mod insecure {
    //! Certificate verifier that accepts anything, for `tls_insecure`
    //! networks with self-signed or broken chains.

    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerify(CryptoProvider);

    impl NoVerify {
        pub fn new() -> Self {
            Self(ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            tokio_rustls::rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            tokio_rustls::rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[derive(PartialEq)]
enum RegPhase {
    /// CAP LS sent, waiting for the server's capability list.
    CapLs,
    /// CAP REQ :sasl sent, waiting for ACK/NAK.
    SaslRequested,
    /// AUTHENTICATE exchange in flight.
    Authenticating,
    /// CAP END sent, waiting for 001.
    AwaitWelcome,
    Registered,
}

struct ConnState {
    opts: ConnectOpts,
    phase: RegPhase,
    current_nick: String,
    nick_retries: u32,
    isupport: Isupport,
    last_data: Instant,
    ping_sent: bool,
}

async fn run_io<S>(
    stream: S,
    opts: ConnectOpts,
    events: mpsc::Sender<ProtocolEvent>,
    mut commands: mpsc::Receiver<Outbound>,
    identd: IdentTable,
    local_port: Option<u16>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, LineCodec::new());
    let mut writer = FramedWrite::new(write_half, LineCodec::new());

    let mut state = ConnState {
        current_nick: opts.nick.clone(),
        phase: RegPhase::CapLs,
        nick_retries: 0,
        isupport: Isupport::new(),
        last_data: Instant::now(),
        ping_sent: false,
        opts,
    };

    let reason = drive(&mut state, &mut reader, &mut writer, &events, &mut commands).await;

    if let Some(port) = local_port {
        identd.remove(&port);
    }
    let _ = events.send(ProtocolEvent::Disconnected { reason }).await;
}

/// The unified read/command loop. Returns the disconnect reason.
async fn drive<S>(
    state: &mut ConnState,
    reader: &mut FramedRead<tokio::io::ReadHalf<S>, LineCodec>,
    writer: &mut FramedWrite<tokio::io::WriteHalf<S>, LineCodec>,
    events: &mpsc::Sender<ProtocolEvent>,
    commands: &mut mpsc::Receiver<Outbound>,
) -> String
where
    S: AsyncRead + AsyncWrite,
{
    // registration opener
    let mut opening = vec!["CAP LS 302".to_owned()];
    if let Some(pass) = &state.opts.pass {
        opening.push(format!("PASS :{pass}"));
    }
    opening.push(format!("NICK {}", state.opts.nick));
    opening.push(format!(
        "USER {} 0 * :{}",
        state.opts.username, state.opts.realname
    ));
    for line in opening {
        if let Err(e) = writer.send(line).await {
            return format!("write failed: {e}");
        }
    }

    let mut next_send = Instant::now();
    // at most one line waits out the throttle; reads keep flowing meanwhile
    let mut queued: Option<Message> = None;
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = reader.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return format!("read error: {e}"),
                    None => return "connection closed by server".to_owned(),
                };
                state.last_data = Instant::now();
                state.ping_sent = false;

                if line.is_empty() {
                    continue;
                }
                let msg: Message = match line.parse() {
                    Ok(msg) => msg,
                    Err(e) => {
                        // one malformed line is logged; the session resets us
                        // only if the server keeps violating the protocol
                        warn!(error = %e, "dropping malformed IRC line");
                        continue;
                    }
                };

                match handle_line(state, msg, writer, events).await {
                    Ok(true) => {}
                    Ok(false) => return "server requested disconnect".to_owned(),
                    Err(e) => return format!("write failed: {e}"),
                }
            }
            cmd = commands.recv(), if queued.is_none() => {
                match cmd {
                    Some(Outbound::Line(msg)) => queued = Some(msg),
                    Some(Outbound::Quit(reason)) => {
                        let reason = reason.unwrap_or_else(|| "bridge closing".to_owned());
                        let _ = writer.send(format!("QUIT :{reason}")).await;
                        return "quit".to_owned();
                    }
                    None => {
                        let _ = writer.send("QUIT :bridge closing".to_owned()).await;
                        return "quit".to_owned();
                    }
                }
            }
            // flood protection: minimum inter-send interval, applied without
            // blocking the read side so PING replies are never held up
            _ = tokio::time::sleep_until(next_send), if queued.is_some() => {
                if let Some(msg) = queued.take() {
                    next_send = Instant::now() + state.opts.send_interval;
                    if let Err(e) = writer.send(msg.to_string()).await {
                        return format!("write failed: {e}");
                    }
                }
            }
            _ = liveness.tick() => {
                let idle = state.last_data.elapsed();
                if idle >= PING_TIMEOUT {
                    return "ping timeout".to_owned();
                }
                if idle >= PING_TIMEOUT / 3 && !state.ping_sent {
                    state.ping_sent = true;
                    if let Err(e) = writer.send("PING :ironbridge".to_owned()).await {
                        return format!("write failed: {e}");
                    }
                }
            }
        }
    }
}

/// Interpret one inbound message. `Ok(false)` terminates the connection.
async fn handle_line<W>(
    state: &mut ConnState,
    msg: Message,
    writer: &mut FramedWrite<W, LineCodec>,
    events: &mpsc::Sender<ProtocolEvent>,
) -> std::result::Result<bool, iron_proto::ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let nick_of = |m: &Message| m.source_nickname().unwrap_or("").to_owned();

    match msg.command.as_str() {
        "PING" => {
            let token = msg.trailing().unwrap_or("");
            writer.send(format!("PONG :{token}")).await?;
        }
        "PONG" => {
            emit(events, ProtocolEvent::Pong {
                token: msg.trailing().unwrap_or("").to_owned(),
            }).await;
        }
        "CAP" => handle_cap(state, &msg, writer, events).await?,
        "AUTHENTICATE" => {
            if msg.params.first().map(String::as_str) == Some("+") {
                let payload = match &state.opts.sasl {
                    Some(SaslAuth::Plain { username, password }) => {
                        sasl::encode_plain(username, password)
                    }
                    Some(SaslAuth::External) => String::new(),
                    None => String::new(),
                };
                for chunk in sasl::chunk_authenticate(&payload) {
                    writer.send(format!("AUTHENTICATE {chunk}")).await?;
                }
            }
        }
        "PRIVMSG" | "NOTICE" => handle_privmsg(state, &msg, writer, events).await?,
        "JOIN" => {
            emit(events, ProtocolEvent::Join {
                nick: nick_of(&msg),
                channel: msg.target().unwrap_or("").to_owned(),
            }).await;
        }
        "PART" => {
            emit(events, ProtocolEvent::Part {
                nick: nick_of(&msg),
                channel: msg.target().unwrap_or("").to_owned(),
                reason: msg.params.get(1).cloned(),
            }).await;
        }
        "KICK" => {
            emit(events, ProtocolEvent::Kick {
                channel: msg.target().unwrap_or("").to_owned(),
                nick: msg.params.get(1).cloned().unwrap_or_default(),
                by: nick_of(&msg),
                reason: msg.params.get(2).cloned(),
            }).await;
        }
        "QUIT" => {
            emit(events, ProtocolEvent::Quit {
                nick: nick_of(&msg),
                reason: msg.trailing().map(str::to_owned),
            }).await;
        }
        "NICK" => {
            let old = nick_of(&msg);
            let new = msg.trailing().unwrap_or("").to_owned();
            if state.current_nick == old {
                state.current_nick = new.clone();
            }
            emit(events, ProtocolEvent::NickChange { old, new }).await;
        }
        "MODE" => {
            emit(events, ProtocolEvent::ModeChange {
                target: msg.target().unwrap_or("").to_owned(),
                modes: msg.params.iter().skip(1).cloned().collect(),
            }).await;
        }
        "TOPIC" => {
            emit(events, ProtocolEvent::Topic {
                channel: msg.target().unwrap_or("").to_owned(),
                topic: msg.trailing().unwrap_or("").to_owned(),
                changed: true,
            }).await;
        }
        "ERROR" => {
            debug!(reason = msg.trailing().unwrap_or(""), "server sent ERROR");
            return Ok(false);
        }
        _ if msg.is_numeric() => {
            let code: u16 = msg.command.parse().unwrap_or(0);
            handle_numeric(state, code, &msg, writer, events).await?;
        }
        other => {
            debug!(command = other, "unhandled IRC command");
        }
    }

    Ok(true)
}

async fn handle_cap<W>(
    state: &mut ConnState,
    msg: &Message,
    writer: &mut FramedWrite<W, LineCodec>,
    events: &mpsc::Sender<ProtocolEvent>,
) -> std::result::Result<(), iron_proto::ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    // CAP <client> <subcommand> [...]
    let sub = msg.params.get(1).map(String::as_str).unwrap_or("");
    match sub {
        "LS" => {
            if state.phase != RegPhase::CapLs {
                return Ok(());
            }
            // multiline LS carries a `*` continuation marker
            if msg.params.get(2).map(String::as_str) == Some("*") {
                return Ok(());
            }
            let caps = msg.trailing().unwrap_or("");
            let server_has_sasl = caps.split(' ').any(|c| c.split('=').next() == Some("sasl"));
            if state.opts.sasl.is_some() && server_has_sasl {
                state.phase = RegPhase::SaslRequested;
                writer.send("CAP REQ :sasl".to_owned()).await?;
            } else {
                if state.opts.sasl.is_some() {
                    emit(events, ProtocolEvent::AuthResult {
                        ok: false,
                        detail: "server does not support SASL".to_owned(),
                    }).await;
                }
                state.phase = RegPhase::AwaitWelcome;
                writer.send("CAP END".to_owned()).await?;
            }
        }
        "ACK" => {
            if state.phase == RegPhase::SaslRequested {
                state.phase = RegPhase::Authenticating;
                let mech = match &state.opts.sasl {
                    Some(SaslAuth::External) => "EXTERNAL",
                    _ => "PLAIN",
                };
                writer.send(format!("AUTHENTICATE {mech}")).await?;
            }
        }
        "NAK" => {
            if state.phase == RegPhase::SaslRequested {
                emit(events, ProtocolEvent::AuthResult {
                    ok: false,
                    detail: "server refused the sasl capability".to_owned(),
                }).await;
                state.phase = RegPhase::AwaitWelcome;
                writer.send("CAP END".to_owned()).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

async fn handle_privmsg<W>(
    state: &mut ConnState,
    msg: &Message,
    writer: &mut FramedWrite<W, LineCodec>,
    events: &mpsc::Sender<ProtocolEvent>,
) -> std::result::Result<(), iron_proto::ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let from = msg.source_nickname().unwrap_or("").to_owned();
    let target = msg.target().unwrap_or("").to_owned();
    let text = msg.params.get(1).cloned().unwrap_or_default();
    let is_notice = msg.command == "NOTICE";

    match Ctcp::parse(&text) {
        Some(ctcp) if ctcp.kind == CtcpKind::Action => {
            emit(events, ProtocolEvent::Message {
                from,
                target,
                text: ctcp.params.unwrap_or_default(),
                action: true,
            }).await;
        }
        Some(ctcp) if is_notice => {
            emit(events, ProtocolEvent::CtcpResponse { from, ctcp }).await;
        }
        Some(ctcp) => {
            // answer the easy queries here, surface everything to the session
            match &ctcp.kind {
                CtcpKind::Version => {
                    let reply = Ctcp {
                        kind: CtcpKind::Version,
                        params: Some(VERSION_REPLY.to_owned()),
                    };
                    writer.send(format!("NOTICE {from} :{reply}")).await?;
                }
                CtcpKind::Ping => {
                    writer.send(format!("NOTICE {from} :{ctcp}")).await?;
                }
                _ => {}
            }
            emit(events, ProtocolEvent::CtcpRequest { from, ctcp }).await;
        }
        None if is_notice => {
            emit(events, ProtocolEvent::Notice { from, target, text }).await;
        }
        None => {
            emit(events, ProtocolEvent::Message {
                from,
                target,
                text,
                action: false,
            }).await;
        }
    }
    Ok(())
}

async fn handle_numeric<W>(
    state: &mut ConnState,
    code: u16,
    msg: &Message,
    writer: &mut FramedWrite<W, LineCodec>,
    events: &mpsc::Sender<ProtocolEvent>,
) -> std::result::Result<(), iron_proto::ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    match code {
        1 => {
            state.phase = RegPhase::Registered;
            let nick = msg.target().unwrap_or(&state.opts.nick).to_owned();
            state.current_nick = nick.clone();
            info!(%nick, "registered with IRC server");
            emit(events, ProtocolEvent::Welcome { nick }).await;
        }
        5 => {
            // RPL_ISUPPORT: drop client nick and trailing explanation
            let tokens: Vec<String> = msg
                .params
                .iter()
                .skip(1)
                .take(msg.params.len().saturating_sub(2))
                .cloned()
                .collect();
            state.isupport.update(&tokens);
            emit(events, ProtocolEvent::IsupportUpdated(state.isupport.clone())).await;
        }
        332 => {
            emit(events, ProtocolEvent::Topic {
                channel: msg.params.get(1).cloned().unwrap_or_default(),
                topic: msg.trailing().unwrap_or("").to_owned(),
                changed: false,
            }).await;
        }
        353 => {
            // RPL_NAMREPLY: <client> <symbol> <channel> :prefix-decorated nicks
            let channel = msg.params.get(2).cloned().unwrap_or_default();
            let members = msg
                .trailing()
                .unwrap_or("")
                .split(' ')
                .filter(|n| !n.is_empty())
                .map(|n| {
                    let prefix: String =
                        n.chars().take_while(|c| "@+%&~!".contains(*c)).collect();
                    NamesEntry {
                        nick: n[prefix.len()..].to_owned(),
                        prefix,
                    }
                })
                .collect();
            emit(events, ProtocolEvent::Names { channel, members }).await;
        }
        366 => {
            emit(events, ProtocolEvent::EndOfNames {
                channel: msg.params.get(1).cloned().unwrap_or_default(),
            }).await;
        }
        433 if state.phase != RegPhase::Registered => {
            // nickname in use during registration: retry with a suffix
            state.nick_retries += 1;
            if state.nick_retries > MAX_NICK_RETRIES {
                let n: u16 = rand::random();
                state.current_nick = format!("{}{n}", state.opts.nick);
            } else {
                state.current_nick.push('_');
            }
            let nick = state.current_nick.clone();
            debug!(%nick, "nickname in use, retrying");
            writer.send(format!("NICK {nick}")).await?;
        }
        903 => {
            emit(events, ProtocolEvent::AuthResult {
                ok: true,
                detail: msg.trailing().unwrap_or("SASL successful").to_owned(),
            }).await;
            if state.phase == RegPhase::Authenticating {
                state.phase = RegPhase::AwaitWelcome;
                writer.send("CAP END".to_owned()).await?;
            }
        }
        902 | 904..=908 => {
            emit(events, ProtocolEvent::AuthResult {
                ok: false,
                detail: msg.trailing().unwrap_or("SASL failed").to_owned(),
            }).await;
            if state.phase == RegPhase::Authenticating {
                state.phase = RegPhase::AwaitWelcome;
                writer.send("CAP END".to_owned()).await?;
            }
        }
        _ => {
            emit(events, ProtocolEvent::Numeric {
                code,
                params: msg.params.clone(),
            }).await;
        }
    }
    Ok(())
}

async fn emit(events: &mpsc::Sender<ProtocolEvent>, event: ProtocolEvent) {
    // session gone means nothing left to notify; the loop exits on its own
    let _ = events.send(event).await;
}
