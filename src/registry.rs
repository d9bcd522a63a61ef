//! Live-connection registry and broadcast relay.
//!
//! The registry owns every accepted stream from the moment the listener
//! hands it over until teardown. The multiplexer registration list and the
//! broadcast fan-out list are the same map.

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use crate::READ_CHUNK;

/// Token reserved for the listening socket.
pub const LISTENER: Token = Token(0);

const PEER_TOKEN_START: usize = 1;

/// One accepted connection.
///
/// Owned exclusively by the registry; dispatch paths only ever see a
/// transient borrow.
pub struct Peer {
    pub(crate) stream: TcpStream,
    pub(crate) addr: SocketAddr,
    pub(crate) scratch: [u8; READ_CHUNK],
}

impl Peer {
    pub(crate) fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            scratch: [0; READ_CHUNK],
        }
    }
}

/// The set of all currently connected peers, keyed by poll token.
pub struct PeerRegistry {
    peers: HashMap<Token, Peer>,
    next_token: usize,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            next_token: PEER_TOKEN_START,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.peers.contains_key(&token)
    }

    /// Stores a freshly accepted peer and registers it with the multiplexer
    /// for readable events. Exactly one entry is added per call.
    pub fn register(&mut self, registry: &Registry, mut peer: Peer) -> std::io::Result<Token> {
        let token = self.allocate_token();
        registry.register(&mut peer.stream, token, Interest::READABLE)?;
        self.peers.insert(token, peer);
        Ok(token)
    }

    /// Removes a peer from the fan-out set and the multiplexer. Dropping the
    /// returned peer closes its transport.
    pub fn deregister(&mut self, registry: &Registry, token: Token) -> Option<Peer> {
        let mut peer = self.peers.remove(&token)?;
        if let Err(err) = registry.deregister(&mut peer.stream) {
            warn!(id = token.0, ?err, "failed to deregister peer");
        }
        Some(peer)
    }

    pub(crate) fn get_mut(&mut self, token: Token) -> Option<&mut Peer> {
        self.peers.get_mut(&token)
    }

    /// Snapshot of every registered token, safe to hold across teardowns.
    pub fn tokens(&self) -> Vec<Token> {
        self.peers.keys().copied().collect()
    }

    /// Relays one decoded chunk to every peer except its origin.
    ///
    /// Writes are best-effort and non-blocking: a full kernel buffer drops
    /// the chunk for that peer and a short write is not resumed. A hard
    /// write failure tears down only the failing peer; the remaining
    /// targets still receive the chunk, and the sender is unaffected.
    pub fn broadcast(&mut self, registry: &Registry, origin: Token, chunk: &str) {
        // Targets are collected up front: teardown below must not mutate
        // the map while it is being iterated.
        let targets = self.tokens();
        for token in targets {
            if token == origin {
                continue;
            }
            let Some(peer) = self.peers.get_mut(&token) else {
                continue;
            };
            let outcome = loop {
                match peer.stream.write(chunk.as_bytes()) {
                    Ok(_) => break Ok(()),
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        debug!(id = token.0, addr = %peer.addr, "peer buffer full, chunk dropped");
                        break Ok(());
                    }
                    Err(err) => break Err(err),
                }
            };
            if let Err(err) = outcome {
                warn!(id = token.0, %err, "write failed, closing peer");
                self.deregister(registry, token);
            }
        }
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self
                .next_token
                .checked_add(1)
                .unwrap_or(PEER_TOKEN_START);
            if token != LISTENER && !self.peers.contains_key(&token) {
                return token;
            }
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
