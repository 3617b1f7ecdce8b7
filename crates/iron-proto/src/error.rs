//! Protocol-level errors.

use thiserror::Error;

/// Errors raised while decoding or encoding IRC lines.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty message")]
    EmptyMessage,

    #[error("message has no command")]
    MissingCommand,

    #[error("line exceeds {limit} bytes (got {actual})")]
    MessageTooLong { actual: usize, limit: usize },

    #[error("invalid message: {0:?}")]
    InvalidMessage(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
