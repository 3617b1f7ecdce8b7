//! iron-proto - client-side IRC protocol support for ironbridge.
//!
//! This crate covers the wire-level concerns of speaking IRC as a client:
//! message parsing and serialization, the line codec, CTCP framing,
//! server casemapping rules, mIRC formatting codes, RPL_ISUPPORT tokens
//! and SASL payload encoding. It owns no sockets and no policy; the
//! bridge proper layers connection and session logic on top.

pub mod casemap;
pub mod ctcp;
pub mod error;
pub mod format;
pub mod isupport;
pub mod line;
pub mod message;
pub mod prefix;
pub mod sasl;

pub use casemap::Casemapping;
pub use ctcp::{Ctcp, CtcpKind};
pub use error::ProtocolError;
pub use isupport::Isupport;
pub use line::LineCodec;
pub use message::Message;
pub use prefix::Prefix;

/// The traditional IRC line length limit, including trailing CRLF.
pub const MAX_LINE_LEN: usize = 512;
