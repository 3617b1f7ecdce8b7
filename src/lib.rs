//! ironbridge - bouncer-style Matrix to IRC appservice bridge.
//!
//! The binary in `main.rs` wires these modules together; they are exposed
//! as a library so integration tests can drive sessions against mock
//! servers without a homeserver.

pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod identd;
pub mod irc;
pub mod mapper;
pub mod matrix;
pub mod pipeline;
pub mod session;
