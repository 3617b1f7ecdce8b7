//! Scripted in-process IRC server.
//!
//! Accepts exactly one client per accept loop iteration, exposes received
//! lines to the test, and sends whatever the test scripts back. Higher
//! level helpers drive the standard registration exchange.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use iron_proto::LineCodec;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

pub struct MockIrcServer {
    addr: SocketAddr,
    incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<String>,
}

impl MockIrcServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (in_tx, incoming) = mpsc::channel::<String>(256);
        let (outgoing, mut out_rx) = mpsc::channel::<String>(256);

        tokio::spawn(async move {
            // serve sequential connections so reconnect tests work
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (read, write) = stream.into_split();
                let mut reader = FramedRead::new(read, LineCodec::new());
                let mut writer = FramedWrite::new(write, LineCodec::new());
                loop {
                    tokio::select! {
                        line = reader.next() => {
                            match line {
                                Some(Ok(line)) => {
                                    if in_tx.send(line).await.is_err() {
                                        return;
                                    }
                                }
                                _ => break,
                            }
                        }
                        out = out_rx.recv() => {
                            match out {
                                Some(line) => {
                                    if writer.send(line).await.is_err() {
                                        break;
                                    }
                                }
                                None => return,
                            }
                        }
                    }
                }
            }
        });

        Self {
            addr,
            incoming,
            outgoing,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one raw line to the connected client.
    pub async fn send(&self, line: &str) {
        self.outgoing
            .send(line.to_owned())
            .await
            .expect("mock server send");
    }

    /// Wait for a line starting with `prefix`, discarding everything else.
    pub async fn expect(&mut self, prefix: &str) -> String {
        let deadline = Duration::from_secs(5);
        loop {
            let line = tokio::time::timeout(deadline, self.incoming.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for line starting {prefix:?}"))
                .expect("client closed while waiting");
            if line.starts_with(prefix) {
                return line;
            }
        }
    }

    /// Drive CAP/NICK/USER registration and greet the client as `nick`.
    pub async fn register(&mut self, nick: &str) {
        self.expect("CAP LS").await;
        self.expect("NICK").await;
        self.expect("USER").await;
        self.send("CAP * LS :multi-prefix server-time").await;
        self.expect("CAP END").await;
        self.send(&format!(":irc.test 001 {nick} :Welcome to TestNet"))
            .await;
        self.send(&format!(
            ":irc.test 005 {nick} CASEMAPPING=ascii NETWORK=TestNet :are supported by this server"
        ))
        .await;
    }

    /// Acknowledge the client's JOIN and serve NAMES for `members`.
    pub async fn join(&mut self, nick: &str, channel: &str, members: &[&str]) {
        self.expect(&format!("JOIN {channel}")).await;
        self.send(&format!(":{nick}!{nick}@host JOIN {channel}")).await;
        self.send(&format!(
            ":irc.test 353 {nick} = {channel} :{}",
            members.join(" ")
        ))
        .await;
        self.send(&format!(
            ":irc.test 366 {nick} {channel} :End of /NAMES list."
        ))
        .await;
    }
}
