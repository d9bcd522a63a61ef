//! Error types for the chat relay.

use std::net::SocketAddr;

use thiserror::Error;

/// Failure taxonomy for the server and client.
///
/// Only `Bind` is fatal, and only during startup. Everything else is scoped
/// to one peer or one loop iteration and is logged rather than propagated.
#[derive(Error, Debug)]
pub enum Error {
    /// The listening socket could not be set up.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The blocking readiness wait itself failed. The loop retries.
    #[error("readiness wait failed: {0}")]
    Multiplex(#[source] std::io::Error),

    /// Read or write failure on a single peer's transport.
    #[error("peer i/o failed: {0}")]
    PeerIo(#[from] std::io::Error),

    /// A peer sent bytes that do not decode as UTF-8.
    #[error("peer sent malformed utf-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),
}
