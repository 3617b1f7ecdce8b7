//! IRC-facing surface: the per-identity connection task and the closed
//! event variant it produces.

pub mod connection;
pub mod event;
pub mod socks;

pub use connection::{ConnectOpts, ConnectionHandle};
pub use event::ProtocolEvent;
