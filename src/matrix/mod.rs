//! Matrix-facing surface: the appservice gateway (inbound transactions)
//! and the client-server API capability (outbound calls).

pub mod appservice;
pub mod client;
pub mod types;

pub use client::{HttpMatrixClient, MatrixApi};
pub use types::{MatrixEvent, MessageContent, Transaction};
