//! Bridge configuration and the persisted user/network store.
//!
//! Two layers: [`Config`] is the operator-provided TOML loaded once at
//! startup (homeserver coordinates, listen addresses, tuning knobs), and
//! [`Store`] is the mutable record of bridge users and their network
//! definitions, rewritten atomically on every mutation.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize store: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Operator configuration, loaded from TOML at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Homeserver client-server API base URL (e.g., "http://localhost:8008").
    pub homeserver: String,
    /// The homeserver's server name used in Matrix IDs.
    pub server_name: String,
    /// Appservice token the bridge uses towards the homeserver.
    pub as_token: String,
    /// Token the homeserver uses towards the bridge; checked on every transaction.
    pub hs_token: String,
    /// Localpart of the bridge bot user.
    #[serde(default = "default_sender_localpart")]
    pub sender_localpart: String,
    /// Prefix for puppet localparts (`@<prefix><network>_<nick>:<server_name>`).
    #[serde(default = "default_puppet_prefix")]
    pub puppet_prefix: String,
    /// Appservice listen address.
    #[serde(default = "default_listen")]
    pub listen: std::net::SocketAddr,
    /// Optional identd listen port.
    pub identd_port: Option<u16>,
    /// Path of the persisted user/network store.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Operationally tuned values (queue bounds, backoff caps).
    #[serde(default)]
    pub tuning: Tuning,
}

fn default_sender_localpart() -> String {
    "ironbridge".to_owned()
}

fn default_puppet_prefix() -> String {
    "irc_".to_owned()
}

fn default_listen() -> std::net::SocketAddr {
    ([127, 0, 0, 1], 9898).into()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("ironbridge-store.toml")
}

/// Tunable bounds. Defaults are conservative; see DESIGN.md.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// First reconnect delay in seconds; doubles per consecutive failure.
    pub base_backoff_secs: u64,
    /// Reconnect delay cap in seconds.
    pub max_backoff_secs: u64,
    /// Bounded queue of Matrix events held while a session is not Ready.
    pub pending_queue_len: usize,
    /// Bounded queue of Matrix-bound sends awaiting homeserver recovery.
    pub matrix_queue_len: usize,
    /// Appservice transaction IDs remembered for dedupe.
    pub txn_dedupe_len: usize,
    /// Tracked Matrix event IDs for edit-as-correction.
    pub pending_edit_len: usize,
    /// Minimum interval between outbound IRC sends, in milliseconds.
    pub send_interval_ms: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            base_backoff_secs: 5,
            max_backoff_secs: 300,
            pending_queue_len: 256,
            matrix_queue_len: 256,
            txn_dedupe_len: 64,
            pending_edit_len: 128,
            send_interval_ms: 500,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Fully-qualified Matrix ID of the bridge bot.
    pub fn bot_mxid(&self) -> String {
        format!("@{}:{}", self.sender_localpart, self.server_name)
    }
}

/// A Matrix user authorized to use the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeUser {
    /// Bridge owner; may manage other users.
    #[serde(default)]
    pub owner: bool,
    /// The user's admin/control room, once established.
    pub admin_room: Option<String>,
    /// Per-network configuration, keyed by network name.
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
}

/// One IRC server endpoint of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Accept any TLS certificate. Needed by some networks with broken chains.
    #[serde(default)]
    pub tls_insecure: bool,
    /// Optional SOCKS5 proxy URL (`socks5://[user:pass@]host:port`).
    pub proxy: Option<String>,
}

/// SASL mechanism selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaslMechanism {
    Plain,
    External,
    None,
}

/// Per-user, per-network settings. Mutated only through admin commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    pub nick: Option<String>,
    pub username: Option<String>,
    pub realname: Option<String>,
    /// Server password (PASS).
    pub password: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// Explicit mechanism override; derived from credentials when absent.
    pub sasl_mechanism: Option<SaslMechanism>,
    /// PEM file with client certificate + key for CertFP.
    pub tls_cert: Option<PathBuf>,
    /// Command sent after welcome, e.g. "NICKSERV IDENTIFY password".
    pub autocmd: Option<String>,
    #[serde(default)]
    pub autojoin: Vec<String>,
    /// Reconnect automatically when the server drops us.
    #[serde(default = "default_true")]
    pub autoconnect: bool,
}

fn default_true() -> bool {
    true
}

impl NetworkConfig {
    /// Effective SASL mechanism from override and configured credentials.
    pub fn effective_sasl(&self) -> Option<SaslMechanism> {
        let implied = if self.sasl_username.is_some() && self.sasl_password.is_some() {
            Some(SaslMechanism::Plain)
        } else if self.tls_cert.is_some() {
            Some(SaslMechanism::External)
        } else {
            None
        };
        match self.sasl_mechanism {
            Some(SaslMechanism::None) => None,
            Some(m) => Some(m),
            None => implied,
        }
    }

    /// Reject activation of configs that cannot possibly connect.
    pub fn validate(&self) -> Result<(), String> {
        if self.servers.is_empty() {
            return Err("network has no servers configured".to_owned());
        }
        if self.nick.as_deref().is_some_and(str::is_empty) {
            return Err("configured nick is empty".to_owned());
        }
        if self.sasl_mechanism == Some(SaslMechanism::Plain)
            && (self.sasl_username.is_none() || self.sasl_password.is_none())
        {
            return Err("SASL PLAIN requires username and password".to_owned());
        }
        if self.sasl_mechanism == Some(SaslMechanism::External) && self.tls_cert.is_none() {
            return Err("SASL EXTERNAL requires a client certificate".to_owned());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    users: BTreeMap<String, BridgeUser>,
}

/// Process-wide persisted store with single-writer mutation.
///
/// Reads clone immutable snapshots; every mutation rewrites the backing
/// file through a temp file + rename so a crash never leaves a torn store.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    data: Arc<RwLock<StoreData>>,
}

impl Store {
    /// Load the store, or start empty if the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_owned(),
            data: Arc::new(RwLock::new(data)),
        })
    }

    /// Snapshot of one user's record.
    pub fn user(&self, mxid: &str) -> Option<BridgeUser> {
        self.data.read().users.get(mxid).cloned()
    }

    /// Number of registered users; zero means the bridge is unclaimed.
    pub fn user_count(&self) -> usize {
        self.data.read().users.len()
    }

    /// Snapshot of one network config.
    pub fn network(&self, mxid: &str, network: &str) -> Option<NetworkConfig> {
        self.data
            .read()
            .users
            .get(mxid)?
            .networks
            .get(network)
            .cloned()
    }

    /// All (user, network) pairs, for activation at startup.
    pub fn all_networks(&self) -> Vec<(String, String)> {
        let data = self.data.read();
        data.users
            .iter()
            .flat_map(|(mxid, user)| {
                user.networks
                    .keys()
                    .map(move |n| (mxid.clone(), n.clone()))
            })
            .collect()
    }

    /// Mutate one user record under the write lock and persist the result.
    pub fn update_user<F>(&self, mxid: &str, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut BridgeUser),
    {
        let mut data = self.data.write();
        f(data.users.entry(mxid.to_owned()).or_default());
        self.persist(&data)
    }

    /// Remove a user entirely (unregister).
    pub fn remove_user(&self, mxid: &str) -> Result<(), ConfigError> {
        let mut data = self.data.write();
        data.users.remove(mxid);
        self.persist(&data)
    }

    fn persist(&self, data: &StoreData) -> Result<(), ConfigError> {
        let serialized = toml::to_string_pretty(data)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(serialized.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            homeserver = "http://localhost:8008"
            server_name = "example.org"
            as_token = "as"
            hs_token = "hs"
            "#,
        )
        .unwrap();
        assert_eq!(config.sender_localpart, "ironbridge");
        assert_eq!(config.tuning.max_backoff_secs, 300);
        assert_eq!(config.bot_mxid(), "@ironbridge:example.org");
    }

    #[test]
    fn effective_sasl_derivation() {
        let mut net = NetworkConfig::default();
        assert_eq!(net.effective_sasl(), None);

        net.sasl_username = Some("u".into());
        net.sasl_password = Some("p".into());
        assert_eq!(net.effective_sasl(), Some(SaslMechanism::Plain));

        net.sasl_mechanism = Some(SaslMechanism::None);
        assert_eq!(net.effective_sasl(), None);

        net.sasl_mechanism = Some(SaslMechanism::External);
        assert_eq!(net.effective_sasl(), Some(SaslMechanism::External));
    }

    #[test]
    fn validation_rejects_empty_network() {
        let net = NetworkConfig::default();
        assert!(net.validate().is_err());
    }

    #[test]
    fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");

        let store = Store::load(&path).unwrap();
        store
            .update_user("@alice:example.org", |user| {
                user.networks.insert(
                    "libera".into(),
                    NetworkConfig {
                        nick: Some("alice".into()),
                        servers: vec![ServerEntry {
                            address: "irc.libera.chat".into(),
                            port: 6697,
                            tls: true,
                            tls_insecure: false,
                            proxy: None,
                        }],
                        ..Default::default()
                    },
                );
            })
            .unwrap();

        let reloaded = Store::load(&path).unwrap();
        let net = reloaded.network("@alice:example.org", "libera").unwrap();
        assert_eq!(net.nick.as_deref(), Some("alice"));
        assert_eq!(
            reloaded.all_networks(),
            vec![("@alice:example.org".to_owned(), "libera".to_owned())]
        );
    }
}
