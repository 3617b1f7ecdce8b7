//! Unified error handling for ironbridge.
//!
//! The taxonomy follows how failures are treated operationally: transient
//! network trouble is retried, protocol violations reset the connection,
//! auth failures degrade the session, configuration errors are rejected
//! synchronously, and homeserver trouble is retried with a bounded queue.
//! No variant is allowed to take the process down.

use thiserror::Error;

/// Bridge-wide error type.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Socket/DNS level failure; retried with backoff, never fatal.
    #[error("transient network error: {0}")]
    Transient(#[from] std::io::Error),

    /// Malformed IRC traffic or an impossible numeric sequence; the
    /// connection is reset and the session reconnects.
    #[error("protocol violation: {0}")]
    Protocol(#[from] iron_proto::ProtocolError),

    /// SASL/CertFP rejected; the session proceeds unauthenticated.
    #[error("authentication failure: {0}")]
    Auth(String),

    /// Missing or contradictory configuration; rejected synchronously.
    #[error("configuration error: {0}")]
    Config(String),

    /// Matrix client-server API failure; retried up to the queue bound.
    #[error("homeserver unavailable: {0}")]
    Homeserver(String),
}

impl BridgeError {
    /// Static code for log labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Protocol(_) => "protocol",
            Self::Auth(_) => "auth",
            Self::Config(_) => "config",
            Self::Homeserver(_) => "homeserver",
        }
    }

    /// Whether the failure should be retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Protocol(_) | Self::Homeserver(_)
        )
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::Homeserver(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_per_class() {
        assert!(BridgeError::Transient(std::io::Error::other("dns")).is_retryable());
        assert!(BridgeError::Homeserver("502".into()).is_retryable());
        assert!(!BridgeError::Auth("904".into()).is_retryable());
        assert!(!BridgeError::Config("no servers".into()).is_retryable());
    }
}
