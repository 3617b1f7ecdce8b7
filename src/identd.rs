//! Ident protocol responder (RFC 1413).
//!
//! IRC servers look up the identity behind an outbound connection by
//! asking our ident port about the (local, remote) port pair. Connections
//! register their local ephemeral port here while they are alive; the
//! responder answers queries from that table and `NO-USER` otherwise.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Shared (local port → ident) registration table.
pub type IdentTable = Arc<DashMap<u16, String>>;

pub fn new_table() -> IdentTable {
    Arc::new(DashMap::new())
}

/// Bind the ident listener and serve queries until the process exits.
pub async fn run(table: IdentTable, port: u16) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(port, error = %e, "failed to bind identd listener");
            return;
        }
    };
    info!(port, "identd listening");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "identd query");
                let table = table.clone();
                tokio::spawn(async move {
                    let _ = handle(stream, table).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "identd accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle(stream: TcpStream, table: IdentTable) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let read = tokio::time::timeout(Duration::from_secs(10), reader.read_line(&mut line)).await;
    if !matches!(read, Ok(Ok(n)) if n > 0) {
        return Ok(());
    }

    let response = match parse_query(&line) {
        Some((sport, dport)) => match table.get(&sport) {
            Some(ident) => format!("{sport}, {dport} : USERID : UNIX : {}\r\n", ident.value()),
            None => format!("{sport}, {dport} : ERROR : NO-USER\r\n"),
        },
        None => return Ok(()),
    };

    write_half.write_all(response.as_bytes()).await?;
    write_half.shutdown().await
}

/// Parse `"<src-port> , <dst-port>"`.
fn parse_query(line: &str) -> Option<(u16, u16)> {
    let (src, dst) = line.split_once(',')?;
    let sport: u16 = src.trim().parse().ok()?;
    let dport: u16 = dst.trim().trim_end_matches(['\r', '\n']).parse().ok()?;
    Some((sport, dport))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_query() {
        assert_eq!(parse_query("45123, 6667\r\n"), Some((45123, 6667)));
        assert_eq!(parse_query("45123 ,6667"), Some((45123, 6667)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_query("hello"), None);
        assert_eq!(parse_query("70000, 6667"), None);
    }

    #[tokio::test]
    async fn responds_from_table() {
        let table = new_table();
        table.insert(40000, "alice".to_owned());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_table = table.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle(stream, server_table).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"40000, 6667\r\n").await.unwrap();
        let mut buf = String::new();
        let (read_half, _) = client.split();
        BufReader::new(read_half).read_line(&mut buf).await.unwrap();
        assert_eq!(buf, "40000, 6667 : USERID : UNIX : alice\r\n");
    }
}
