//! Admin command interpreter.
//!
//! Commands arrive as plain text in a user's admin room; the interpreter
//! parses them into [`AdminCommand`], mutates the persistent store, and
//! drives sessions through the registry. Every reply is a notice back
//! into the admin room, produced here as a string so the gateway stays a
//! thin dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{NetworkConfig, SaslMechanism, ServerEntry};
use crate::context::BridgeContext;
use crate::session::registry::SessionKey;
use crate::session::{self, SessionCommand};

const HELP: &str = "\
commands:
  networks                                  list networks and their state
  addnetwork <name>                         create a network
  delnetwork <name>                         delete a network (must be disconnected)
  addserver <network> <host> <port> [--tls] [--tls-insecure] [--proxy <socks5-url>]
  delserver <network> <host> [port]         remove a server
  nick <network> <nick>                     set the nick
  sasl <network> [--username <u>] [--password <p>] [--mechanism plain|external|none]
  certfp <network> <pem-path>               use a client certificate (SASL EXTERNAL)
  autocmd <network> [line; line; ...]       raw lines to send after connect (empty clears)
  connect <network>                         connect and enable autoconnect
  disconnect <network>                      disconnect and disable autoconnect
  join <network> <channel> [key]            join a channel (persisted)
  part <network> <channel>                  part a channel (persisted)
  raw <network> <line>                      send a raw IRC line
  help                                      this text";

/// One parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Help,
    Networks,
    AddNetwork {
        name: String,
    },
    DelNetwork {
        name: String,
    },
    AddServer {
        network: String,
        server: ServerEntry,
    },
    DelServer {
        network: String,
        address: String,
        port: Option<u16>,
    },
    Nick {
        network: String,
        nick: String,
    },
    Sasl {
        network: String,
        username: Option<String>,
        password: Option<String>,
        mechanism: Option<SaslMechanism>,
    },
    Certfp {
        network: String,
        path: String,
    },
    Autocmd {
        network: String,
        line: Option<String>,
    },
    Connect {
        network: String,
    },
    Disconnect {
        network: String,
    },
    Join {
        network: String,
        channel: String,
        key: Option<String>,
    },
    Part {
        network: String,
        channel: String,
    },
    Raw {
        network: String,
        line: String,
    },
}

/// Parse one admin room line. Unknown verbs and malformed argument lists
/// are reported with usage, never guessed at.
pub fn parse(line: &str) -> Result<AdminCommand, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or("").to_ascii_lowercase();
    let rest: Vec<&str> = words.collect();

    let usage = |text: &str| Err(format!("usage: {text}"));

    match verb.as_str() {
        "" | "help" => Ok(AdminCommand::Help),
        "networks" => Ok(AdminCommand::Networks),
        "addnetwork" => match rest.as_slice() {
            [name] => Ok(AdminCommand::AddNetwork {
                name: (*name).to_owned(),
            }),
            _ => usage("addnetwork <name>"),
        },
        "delnetwork" => match rest.as_slice() {
            [name] => Ok(AdminCommand::DelNetwork {
                name: (*name).to_owned(),
            }),
            _ => usage("delnetwork <name>"),
        },
        "addserver" => parse_addserver(&rest),
        "delserver" => match rest.as_slice() {
            [network, address] => Ok(AdminCommand::DelServer {
                network: (*network).to_owned(),
                address: (*address).to_owned(),
                port: None,
            }),
            [network, address, port] => Ok(AdminCommand::DelServer {
                network: (*network).to_owned(),
                address: (*address).to_owned(),
                port: Some(parse_port(port)?),
            }),
            _ => usage("delserver <network> <host> [port]"),
        },
        "nick" => match rest.as_slice() {
            [network, nick] => Ok(AdminCommand::Nick {
                network: (*network).to_owned(),
                nick: (*nick).to_owned(),
            }),
            _ => usage("nick <network> <nick>"),
        },
        "sasl" => parse_sasl(&rest),
        "certfp" => match rest.as_slice() {
            [network, path] => Ok(AdminCommand::Certfp {
                network: (*network).to_owned(),
                path: (*path).to_owned(),
            }),
            _ => usage("certfp <network> <pem-path>"),
        },
        "autocmd" => match rest.split_first() {
            Some((network, [])) => Ok(AdminCommand::Autocmd {
                network: (*network).to_owned(),
                line: None,
            }),
            Some((network, rest)) => Ok(AdminCommand::Autocmd {
                network: (*network).to_owned(),
                line: Some(rest.join(" ")),
            }),
            None => usage("autocmd <network> [line; line; ...]"),
        },
        "connect" => match rest.as_slice() {
            [network] => Ok(AdminCommand::Connect {
                network: (*network).to_owned(),
            }),
            _ => usage("connect <network>"),
        },
        "disconnect" => match rest.as_slice() {
            [network] => Ok(AdminCommand::Disconnect {
                network: (*network).to_owned(),
            }),
            _ => usage("disconnect <network>"),
        },
        "join" => match rest.as_slice() {
            [network, channel] => Ok(AdminCommand::Join {
                network: (*network).to_owned(),
                channel: (*channel).to_owned(),
                key: None,
            }),
            [network, channel, key] => Ok(AdminCommand::Join {
                network: (*network).to_owned(),
                channel: (*channel).to_owned(),
                key: Some((*key).to_owned()),
            }),
            _ => usage("join <network> <channel> [key]"),
        },
        "part" => match rest.as_slice() {
            [network, channel] => Ok(AdminCommand::Part {
                network: (*network).to_owned(),
                channel: (*channel).to_owned(),
            }),
            _ => usage("part <network> <channel>"),
        },
        "raw" => match rest.split_first() {
            Some((network, line)) if !line.is_empty() => {
                let line = line.join(" ");
                if line.contains(['\r', '\n']) {
                    return Err("raw line must not contain CR or LF".into());
                }
                Ok(AdminCommand::Raw {
                    network: (*network).to_owned(),
                    line,
                })
            }
            _ => usage("raw <network> <line>"),
        },
        other => Err(format!("unknown command: {other}\n{HELP}")),
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse::<u16>().map_err(|_| format!("bad port: {s}"))
}

fn parse_addserver(rest: &[&str]) -> Result<AdminCommand, String> {
    let mut args = rest.iter();
    let (Some(network), Some(address), Some(port)) = (args.next(), args.next(), args.next())
    else {
        return Err(
            "usage: addserver <network> <host> <port> [--tls] [--tls-insecure] [--proxy <url>]"
                .into(),
        );
    };
    let mut server = ServerEntry {
        address: (*address).to_owned(),
        port: parse_port(port)?,
        tls: false,
        tls_insecure: false,
        proxy: None,
    };
    while let Some(flag) = args.next() {
        match *flag {
            "--tls" => server.tls = true,
            "--tls-insecure" => {
                server.tls = true;
                server.tls_insecure = true;
            }
            "--proxy" => {
                let url = args.next().ok_or("--proxy requires a url")?;
                server.proxy = Some((*url).to_owned());
            }
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    Ok(AdminCommand::AddServer {
        network: (*network).to_owned(),
        server,
    })
}

fn parse_sasl(rest: &[&str]) -> Result<AdminCommand, String> {
    let mut args = rest.iter();
    let Some(network) = args.next() else {
        return Err(
            "usage: sasl <network> [--username <u>] [--password <p>] [--mechanism <m>]".into(),
        );
    };
    let mut username = None;
    let mut password = None;
    let mut mechanism = None;
    while let Some(flag) = args.next() {
        let value = args
            .next()
            .ok_or_else(|| format!("{flag} requires a value"))?;
        match *flag {
            "--username" => username = Some((*value).to_owned()),
            "--password" => password = Some((*value).to_owned()),
            "--mechanism" => {
                mechanism = Some(match value.to_ascii_lowercase().as_str() {
                    "plain" => SaslMechanism::Plain,
                    "external" => SaslMechanism::External,
                    "none" => SaslMechanism::None,
                    other => return Err(format!("unknown mechanism: {other}")),
                })
            }
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    Ok(AdminCommand::Sasl {
        network: (*network).to_owned(),
        username,
        password,
        mechanism,
    })
}

/// Execute a parsed command on behalf of `user`, returning the reply text.
pub async fn execute(ctx: &Arc<BridgeContext>, user: &str, cmd: AdminCommand) -> String {
    match run(ctx, user, cmd).await {
        Ok(reply) => reply,
        Err(e) => e,
    }
}

async fn run(ctx: &Arc<BridgeContext>, user: &str, cmd: AdminCommand) -> Result<String, String> {
    match cmd {
        AdminCommand::Help => Ok(HELP.to_owned()),
        AdminCommand::Networks => {
            let user_config = ctx.store.user(user).unwrap_or_default();
            if user_config.networks.is_empty() {
                return Ok("no networks configured; see `help`".into());
            }
            let mut lines = Vec::new();
            for (name, network) in &user_config.networks {
                let key = SessionKey {
                    user: user.to_owned(),
                    network: name.clone(),
                };
                let state = match ctx.registry.session(&key) {
                    Some(tx) => query_state(&tx).await,
                    None => "inactive".to_owned(),
                };
                let servers: Vec<String> = network
                    .servers
                    .iter()
                    .map(|s| format!("{}:{}{}", s.address, s.port, if s.tls { "+tls" } else { "" }))
                    .collect();
                lines.push(format!("{name} [{state}] servers: {}", servers.join(", ")));
            }
            Ok(lines.join("\n"))
        }
        AdminCommand::AddNetwork { name } => {
            if name.contains([' ', '/', ':']) {
                return Err(format!("bad network name: {name}"));
            }
            if ctx.store.network(user, &name).is_some() {
                return Err(format!("network {name} already exists"));
            }
            ctx.store
                .update_user(user, |u| {
                    u.networks.entry(name.clone()).or_default();
                })
                .map_err(|e| e.to_string())?;
            Ok(format!("network {name} created; now `addserver {name} <host> <port>`"))
        }
        AdminCommand::DelNetwork { name } => {
            let key = SessionKey {
                user: user.to_owned(),
                network: name.clone(),
            };
            if ctx.registry.is_active(&key) {
                return Err(format!("{name} is connected; `disconnect {name}` first"));
            }
            ctx.store.network(user, &name).ok_or("no such network")?;
            ctx.store
                .update_user(user, |u| {
                    u.networks.remove(&name);
                })
                .map_err(|e| e.to_string())?;
            Ok(format!("network {name} deleted"))
        }
        AdminCommand::AddServer { network, server } => {
            let described = format!("{}:{}", server.address, server.port);
            update(ctx, user, &network, |n| {
                if n.servers
                    .iter()
                    .any(|s| s.address == server.address && s.port == server.port)
                {
                    return Err("server already present".into());
                }
                n.servers.push(server.clone());
                Ok(())
            })?;
            Ok(format!("added server {described} to {network}"))
        }
        AdminCommand::DelServer {
            network,
            address,
            port,
        } => {
            update(ctx, user, &network, |n| {
                let before = n.servers.len();
                n.servers
                    .retain(|s| !(s.address == address && port.is_none_or(|p| s.port == p)));
                if n.servers.len() == before {
                    return Err("no matching server".into());
                }
                Ok(())
            })?;
            Ok(format!("removed {address} from {network}"))
        }
        AdminCommand::Nick { network, nick } => {
            update(ctx, user, &network, |n| {
                n.nick = Some(nick.clone());
                Ok(())
            })?;
            send_if_active(ctx, user, &network, SessionCommand::SetNick(nick.clone())).await;
            Ok(format!("nick for {network} set to {nick}"))
        }
        AdminCommand::Sasl {
            network,
            username,
            password,
            mechanism,
        } => {
            update(ctx, user, &network, |n| {
                if let Some(u) = &username {
                    n.sasl_username = Some(u.clone());
                }
                if let Some(p) = &password {
                    n.sasl_password = Some(p.clone());
                }
                if mechanism.is_some() {
                    n.sasl_mechanism = mechanism;
                }
                Ok(())
            })?;
            Ok(format!("SASL settings for {network} updated (takes effect on next connect)"))
        }
        AdminCommand::Certfp { network, path } => {
            update(ctx, user, &network, |n| {
                n.tls_cert = Some(path.clone().into());
                Ok(())
            })?;
            Ok(format!("client certificate for {network} set (takes effect on next connect)"))
        }
        AdminCommand::Autocmd { network, line } => {
            let reply = match &line {
                Some(l) => format!("autocmd for {network} set to {l:?}"),
                None => format!("autocmd for {network} cleared"),
            };
            update(ctx, user, &network, |n| {
                n.autocmd = line.clone();
                Ok(())
            })?;
            Ok(reply)
        }
        AdminCommand::Connect { network } => {
            update(ctx, user, &network, |n| {
                n.autoconnect = true;
                Ok(())
            })?;
            session::activate(ctx, user, &network)?;
            Ok(format!("connecting to {network}"))
        }
        AdminCommand::Disconnect { network } => {
            update(ctx, user, &network, |n| {
                n.autoconnect = false;
                Ok(())
            })?;
            let key = SessionKey {
                user: user.to_owned(),
                network: network.clone(),
            };
            match ctx.registry.session(&key) {
                Some(tx) => {
                    let _ = tx.send(SessionCommand::Shutdown).await;
                    Ok(format!("disconnecting from {network}"))
                }
                None => Ok(format!("{network} is not connected")),
            }
        }
        AdminCommand::Join {
            network,
            channel,
            key,
        } => {
            if !channel.starts_with(['#', '&']) {
                return Err(format!("not a channel name: {channel}"));
            }
            update(ctx, user, &network, |n| {
                if !n.autojoin.iter().any(|c| c.eq_ignore_ascii_case(&channel)) {
                    n.autojoin.push(channel.clone());
                }
                Ok(())
            })?;
            let cmd = SessionCommand::Join {
                channel: channel.clone(),
                key,
            };
            send_if_active(ctx, user, &network, cmd).await;
            Ok(format!("joining {channel} on {network}"))
        }
        AdminCommand::Part { network, channel } => {
            update(ctx, user, &network, |n| {
                n.autojoin.retain(|c| !c.eq_ignore_ascii_case(&channel));
                Ok(())
            })?;
            send_if_active(ctx, user, &network, SessionCommand::Part(channel.clone())).await;
            Ok(format!("parting {channel} on {network}"))
        }
        AdminCommand::Raw { network, line } => {
            let key = SessionKey {
                user: user.to_owned(),
                network: network.clone(),
            };
            match ctx.registry.session(&key) {
                Some(tx) => {
                    let _ = tx.send(SessionCommand::Raw(line)).await;
                    Ok("sent".into())
                }
                None => Err(format!("{network} is not connected")),
            }
        }
    }
}

/// Mutate one existing network config in the store.
fn update<F>(ctx: &BridgeContext, user: &str, network: &str, f: F) -> Result<(), String>
where
    F: FnOnce(&mut NetworkConfig) -> Result<(), String>,
{
    if ctx.store.network(user, network).is_none() {
        return Err(format!("no such network: {network}"));
    }
    let mut result = Ok(());
    ctx.store
        .update_user(user, |u| {
            let entry = u.networks.entry(network.to_owned()).or_default();
            result = f(entry);
        })
        .map_err(|e| e.to_string())?;
    result?;
    info!(%user, %network, "network config updated");
    Ok(())
}

async fn send_if_active(ctx: &BridgeContext, user: &str, network: &str, cmd: SessionCommand) {
    let key = SessionKey {
        user: user.to_owned(),
        network: network.to_owned(),
    };
    if let Some(tx) = ctx.registry.session(&key) {
        let _ = tx.send(cmd).await;
    }
}

async fn query_state(tx: &tokio::sync::mpsc::Sender<SessionCommand>) -> String {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    if tx.send(SessionCommand::Status(reply_tx)).await.is_err() {
        return "inactive".to_owned();
    }
    match tokio::time::timeout(Duration::from_secs(2), reply_rx).await {
        Ok(Ok(state)) => state,
        _ => "unresponsive".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addserver_flags() {
        let cmd = parse("addserver libera irc.libera.chat 6697 --tls --proxy socks5://localhost:1080")
            .unwrap();
        match cmd {
            AdminCommand::AddServer { network, server } => {
                assert_eq!(network, "libera");
                assert_eq!(server.address, "irc.libera.chat");
                assert_eq!(server.port, 6697);
                assert!(server.tls);
                assert!(!server.tls_insecure);
                assert_eq!(server.proxy.as_deref(), Some("socks5://localhost:1080"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_verb_includes_help() {
        let err = parse("bogus").unwrap_err();
        assert!(err.contains("unknown command: bogus"));
        assert!(err.contains("addnetwork"));
    }

    #[test]
    fn empty_line_is_help() {
        assert_eq!(parse("   "), Ok(AdminCommand::Help));
    }

    #[test]
    fn raw_never_carries_line_breaks() {
        // whitespace splitting collapses any embedded CR/LF, so a crafted
        // command cannot smuggle a second IRC line through
        match parse("raw libera PRIVMSG #x :a\r\nQUIT :bye").unwrap() {
            AdminCommand::Raw { line, .. } => {
                assert!(!line.contains(['\r', '\n']));
                assert_eq!(line, "PRIVMSG #x :a QUIT :bye");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn sasl_mechanism_parsing() {
        let cmd = parse("sasl libera --mechanism external").unwrap();
        assert_eq!(
            cmd,
            AdminCommand::Sasl {
                network: "libera".into(),
                username: None,
                password: None,
                mechanism: Some(SaslMechanism::External),
            }
        );
        assert!(parse("sasl libera --mechanism scram").is_err());
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(parse("addserver libera irc.libera.chat believeme").is_err());
    }
}
