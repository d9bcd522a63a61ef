//! The accept/read/broadcast event loop.
//!
//! Single-threaded and cooperative: the only suspension point is the
//! blocking readiness wait. All socket I/O is non-blocking, and broadcast
//! fan-out for one chunk completes before the next ready event is
//! dispatched.

use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, trace, warn};

use crate::WELCOME;
use crate::error::Error;
use crate::registry::{LISTENER, Peer, PeerRegistry};

const EVENT_CAPACITY: usize = 1024;

/// Outcome of one drain cycle on a peer.
enum Drain {
    /// Everything currently buffered, decoded as one chunk. May be empty.
    Chunk(String),
    /// The peer closed its end; nothing read this cycle propagates.
    Disconnected,
}

/// Broadcast chat server bound to one listening socket.
pub struct ChatServer {
    poll: Poll,
    listener: TcpListener,
    registry: PeerRegistry,
    local_addr: SocketAddr,
}

impl ChatServer {
    /// Binds the listening socket and registers it for accept readiness.
    pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let bind_err = |source| Error::Bind { addr, source };
        let poll = Poll::new().map_err(bind_err)?;
        let mut listener = TcpListener::bind(addr).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(bind_err)?;
        Ok(Self {
            poll,
            listener,
            registry: PeerRegistry::new(),
            local_addr,
        })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Runs until the process is killed. After a successful bind, no error
    /// is fatal: multiplexer faults retry the wait, peer faults tear down
    /// that peer.
    pub fn run(mut self) {
        info!(addr = %self.local_addr, "server started");
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                let err = Error::Multiplex(err);
                error!(%err, "retrying readiness wait");
                continue;
            }
            // A zero-sized ready set is spurious: re-wait, do nothing.
            if events.is_empty() {
                continue;
            }
            trace!(ready = events.iter().count(), "dispatching ready set");
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_peers(),
                    token if event.is_readable() => self.read_peer(token),
                    token => trace!(id = token.0, "ignoring non-readable event"),
                }
            }
            // The ready set must be emptied before the next wait; stale
            // entries would be re-dispatched as phantom events.
            events.clear();
        }
    }

    /// Drains the accept backlog. Called only when the multiplexer reported
    /// the listener ready; a single event may cover several pending
    /// connections.
    fn accept_peers(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.admit_peer(stream, addr),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(?err, "transient accept error");
                    continue;
                }
                Err(err) => {
                    error!(?err, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit_peer(&mut self, stream: TcpStream, addr: SocketAddr) {
        let token = match self.registry.register(self.poll.registry(), Peer::new(stream, addr)) {
            Ok(token) => token,
            Err(err) => {
                warn!(%addr, ?err, "failed to register peer");
                return;
            }
        };
        info!(id = token.0, %addr, "peer connected");
        // The joining notice goes to the new peer alone, never into the room.
        if let Err(err) = self.welcome(token) {
            warn!(id = token.0, %addr, %err, "welcome write failed, closing peer");
            self.registry.deregister(self.poll.registry(), token);
        }
    }

    fn welcome(&mut self, token: Token) -> Result<(), Error> {
        let Some(peer) = self.registry.get_mut(token) else {
            return Ok(());
        };
        loop {
            match peer.stream.write(WELCOME.as_bytes()) {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // Best-effort, like every other write to a peer.
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(Error::PeerIo(err)),
            }
        }
    }

    /// Handles one readable event: drain, broadcast a non-empty chunk, then
    /// renew readable interest.
    fn read_peer(&mut self, token: Token) {
        let outcome = match self.registry.get_mut(token) {
            Some(peer) => drain(peer),
            // Torn down earlier in this dispatch pass.
            None => return,
        };
        match outcome {
            Ok(Drain::Chunk(chunk)) => {
                if !chunk.is_empty() {
                    debug!(id = token.0, len = chunk.len(), "relaying chunk");
                    self.registry.broadcast(self.poll.registry(), token, &chunk);
                }
                self.rearm(token);
            }
            Ok(Drain::Disconnected) => {
                info!(id = token.0, "peer disconnected");
                self.registry.deregister(self.poll.registry(), token);
            }
            Err(err) => {
                warn!(id = token.0, %err, "peer read failed, closing");
                self.registry.deregister(self.poll.registry(), token);
            }
        }
    }

    /// Renews readable interest after a drain. Some multiplexers deliver
    /// one-shot notifications, so the renewal is unconditional.
    fn rearm(&mut self, token: Token) {
        let registry = self.poll.registry();
        if let Some(peer) = self.registry.get_mut(token) {
            if let Err(err) = registry.reregister(&mut peer.stream, token, Interest::READABLE) {
                warn!(id = token.0, ?err, "failed to re-arm peer, closing");
                self.registry.deregister(registry, token);
            }
        }
    }
}

/// Empties everything the transport currently has buffered for one peer and
/// decodes it as a single UTF-8 chunk.
///
/// "Nothing left to read right now" is not a message boundary: whatever one
/// cycle accumulates is one broadcastable unit, whether the sender's logical
/// message spans several cycles or several messages land in one.
fn drain(peer: &mut Peer) -> Result<Drain, Error> {
    let mut accumulated = Vec::new();
    loop {
        match peer.stream.read(&mut peer.scratch) {
            // Orderly close. Bytes read earlier in this cycle are discarded.
            Ok(0) => return Ok(Drain::Disconnected),
            Ok(n) => accumulated.extend_from_slice(&peer.scratch[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::PeerIo(err)),
        }
    }
    Ok(Drain::Chunk(String::from_utf8(accumulated)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::thread::sleep;
    use std::time::Duration;

    fn peer_pair() -> (Peer, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        (Peer::new(TcpStream::from_std(accepted), addr), client)
    }

    #[test]
    fn drain_concatenates_partial_reads() {
        let (mut peer, mut client) = peer_pair();
        client.write_all(b"hel").unwrap();
        client.write_all(b"lo").unwrap();
        sleep(Duration::from_millis(50));

        match drain(&mut peer).unwrap() {
            Drain::Chunk(chunk) => assert_eq!(chunk, "hello"),
            Drain::Disconnected => panic!("unexpected disconnect"),
        }
    }

    #[test]
    fn drain_spans_multiple_scratch_fills() {
        let (mut peer, mut client) = peer_pair();
        let big = "a".repeat(3000);
        client.write_all(big.as_bytes()).unwrap();
        sleep(Duration::from_millis(100));

        match drain(&mut peer).unwrap() {
            Drain::Chunk(chunk) => assert_eq!(chunk, big),
            Drain::Disconnected => panic!("unexpected disconnect"),
        }
    }

    #[test]
    fn drain_leaks_nothing_between_cycles() {
        let (mut peer, mut client) = peer_pair();
        client.write_all(b"first message").unwrap();
        sleep(Duration::from_millis(50));
        match drain(&mut peer).unwrap() {
            Drain::Chunk(chunk) => assert_eq!(chunk, "first message"),
            Drain::Disconnected => panic!("unexpected disconnect"),
        }

        client.write_all(b"x").unwrap();
        sleep(Duration::from_millis(50));
        match drain(&mut peer).unwrap() {
            Drain::Chunk(chunk) => assert_eq!(chunk, "x"),
            Drain::Disconnected => panic!("unexpected disconnect"),
        }
    }

    #[test]
    fn drain_with_no_data_yields_empty_chunk() {
        let (mut peer, _client) = peer_pair();
        match drain(&mut peer).unwrap() {
            Drain::Chunk(chunk) => assert!(chunk.is_empty()),
            Drain::Disconnected => panic!("unexpected disconnect"),
        }
    }

    #[test]
    fn drain_reports_orderly_close_and_discards_partial_data() {
        let (mut peer, mut client) = peer_pair();
        client.write_all(b"partial").unwrap();
        drop(client);
        sleep(Duration::from_millis(50));

        assert!(matches!(drain(&mut peer), Ok(Drain::Disconnected)));
    }

    #[test]
    fn drain_rejects_malformed_utf8() {
        let (mut peer, mut client) = peer_pair();
        client.write_all(&[0xff, 0xfe, 0xfd]).unwrap();
        sleep(Duration::from_millis(50));

        assert!(matches!(drain(&mut peer), Err(Error::Decode(_))));
    }

    #[test]
    fn accept_registers_and_welcomes_the_new_peer_only() {
        let mut server = ChatServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut client = StdStream::connect(server.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        sleep(Duration::from_millis(50));

        server.accept_peers();
        assert_eq!(server.peer_count(), 1);

        let mut buf = [0u8; 128];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], WELCOME.as_bytes());

        // A second join greets the newcomer, not the room.
        let mut late = StdStream::connect(server.local_addr()).unwrap();
        late.set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        sleep(Duration::from_millis(50));
        server.accept_peers();
        assert_eq!(server.peer_count(), 2);

        let n = late.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], WELCOME.as_bytes());
        assert!(client.read(&mut buf).is_err(), "welcome was broadcast");
    }
}
