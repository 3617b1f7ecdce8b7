//! Integration test common infrastructure.
//!
//! Provides a scripted in-process IRC server, a recording Matrix API, and
//! helpers for building a bridge context against both.
#![allow(dead_code)]

pub mod matrix;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use ironbridge::config::{Config, NetworkConfig, ServerEntry, Store, Tuning};
use ironbridge::context::BridgeContext;

#[allow(unused_imports)]
pub use matrix::RecordingMatrix;
#[allow(unused_imports)]
pub use server::MockIrcServer;

/// Bridge context wired to a recording Matrix API and a throwaway store.
/// The tempdir must outlive the context, so it is returned alongside.
pub fn test_context(
    matrix: Arc<RecordingMatrix>,
) -> (Arc<BridgeContext>, tempfile::TempDir) {
    test_context_tuned(matrix, |_| {})
}

/// [`test_context`] with the tuning knobs adjusted first.
pub fn test_context_tuned<F>(
    matrix: Arc<RecordingMatrix>,
    adjust: F,
) -> (Arc<BridgeContext>, tempfile::TempDir)
where
    F: FnOnce(&mut Tuning),
{
    let dir = tempfile::tempdir().expect("tempdir");
    let store_path = dir.path().join("store.toml");

    let mut config = Config {
        homeserver: "http://localhost:8008".into(),
        server_name: "test".into(),
        as_token: "as-token".into(),
        hs_token: "hs-token".into(),
        sender_localpart: "ironbridge".into(),
        puppet_prefix: "irc_".into(),
        listen: "127.0.0.1:0".parse().expect("addr"),
        identd_port: None,
        store_path: store_path.clone(),
        tuning: Tuning {
            // no outbound throttle in tests
            send_interval_ms: 0,
            base_backoff_secs: 1,
            ..Tuning::default()
        },
    };
    adjust(&mut config.tuning);
    let store = Store::load(&store_path).expect("store");
    let ctx = BridgeContext::new(config, store, matrix);
    (ctx, dir)
}

/// Register a user with one network pointing at the mock server.
pub fn add_network(ctx: &BridgeContext, user: &str, network: &str, server: &MockIrcServer) {
    let addr = server.addr();
    ctx.store
        .update_user(user, |u| {
            u.networks.insert(
                network.to_owned(),
                NetworkConfig {
                    servers: vec![ServerEntry {
                        address: addr.ip().to_string(),
                        port: addr.port(),
                        tls: false,
                        tls_insecure: false,
                        proxy: None,
                    }],
                    nick: Some("alice".into()),
                    autojoin: vec!["#test".into()],
                    ..NetworkConfig::default()
                },
            );
        })
        .expect("store write");
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_for<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
