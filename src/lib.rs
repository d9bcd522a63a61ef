//! Event-driven broadcast chat server.
//!
//! One thread owns a readiness multiplexer and the set of live connections;
//! every chunk of text a client sends is relayed verbatim to all other
//! connected clients. Raw UTF-8 bytes on the wire, no framing, no history,
//! no identity.

pub mod client;
pub mod error;
pub mod registry;
pub mod server;

pub use error::Error;
pub use registry::PeerRegistry;
pub use server::ChatServer;

/// Port the server binary listens on.
pub const CHAT_PORT: u16 = 9999;

/// Notice written to a newly accepted peer only; never broadcast.
pub const WELCOME: &str = "Welcome! You have joined the chat room.\n";

/// Scratch capacity for a single read call within a drain cycle.
pub(crate) const READ_CHUNK: usize = 1024;
