//! Secure datagram socket.
//!
//! Binds a UDP transport, a record-layer engine, a peer-session table, a
//! security store and an inbound queue together. Sends run on the caller's
//! thread and retry while the engine reports a handshake in progress.
//! Receives are driven by one background thread per socket that feeds
//! datagrams to the engine; decrypted data comes back through the read
//! callback and is queued for the application.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use sealgram_common::{Error, Result};
use tracing::{debug, error, info, trace, warn};

use crate::config::{AddressFamily, SocketConfig};
use crate::engine::{
    AlertDescription, AppHandle, Callbacks, CredentialKind, Engine, WriteStatus,
};
use crate::queue::ConcurrentQueue;
use crate::registry::{self, SocketContext};
use crate::security::SecurityStore;
use crate::session_table::PeerSessionTable;
use crate::transport::{self, Transport};

/// Decrypted application data and the peer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Bytes,
    pub peer: SocketAddr,
}

impl Datagram {
    fn truncated(mut self, max_len: Option<usize>) -> Self {
        if let Some(max) = max_len {
            self.payload.truncate(max);
        }
        self
    }
}

/// Lifecycle of a socket. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No local address and no default destination.
    Unbound,
    /// Default destination set; not yet bound.
    Connected,
    /// Bound locally with the receiver running.
    Bound,
    Closed,
}

struct Inner {
    state: SocketState,
    default_peer: Option<SocketAddr>,
    receiver: Option<JoinHandle<()>>,
}

/// Datagram socket whose traffic is protected by an [`Engine`].
pub struct SecureDatagramSocket<E: Engine> {
    handle: AppHandle,
    config: SocketConfig,
    context: Arc<SocketContext>,
    engine: Arc<E>,
    sessions: Arc<PeerSessionTable<E>>,
    inner: Mutex<Inner>,
    running: Arc<AtomicBool>,
}

impl<E: Engine> SecureDatagramSocket<E> {
    /// Create an unbound socket.
    pub fn new(config: SocketConfig) -> Result<Self> {
        let transport = Arc::new(Transport::new(config.family, config.receive_poll())?);
        let context = Arc::new(SocketContext {
            transport,
            queue: Arc::new(ConcurrentQueue::new()),
            security: Arc::new(RwLock::new(SecurityStore::new())),
        });

        let handle = AppHandle::next();
        registry::register(handle, context.clone());

        let engine = match E::create_context(handle) {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                registry::unregister(handle);
                return Err(Error::engine(e));
            }
        };
        engine.set_callbacks(Callbacks {
            write: write_callback::<E>,
            read: read_callback::<E>,
            key_lookup: key_lookup_callback::<E>,
        });

        let sessions = match PeerSessionTable::new(engine.clone(), config.eviction_timeout()) {
            Ok(table) => Arc::new(table),
            Err(e) => {
                engine.destroy_context();
                registry::unregister(handle);
                return Err(e);
            }
        };

        debug!(handle = %handle, family = ?config.family, "socket created");
        Ok(Self {
            handle,
            config,
            context,
            engine,
            sessions,
            inner: Mutex::new(Inner {
                state: SocketState::Unbound,
                default_peer: None,
                receiver: None,
            }),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create an unbound socket with default settings for `family`.
    pub fn with_family(family: AddressFamily) -> Result<Self> {
        Self::new(SocketConfig::default().with_family(family))
    }

    /// Bind to `host:port` and start receiving.
    pub fn bind(&self, host: &str, port: u16) -> Result<()> {
        let addr = self.resolve(host, port)?;
        self.bind_addr(addr)
    }

    pub fn bind_addr(&self, addr: SocketAddr) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == SocketState::Closed {
            return Err(Error::Closed);
        }
        self.context.transport.bind(addr)?;
        self.start_receiver(&mut inner)
    }

    /// Set the default destination used by [`send`](Self::send).
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        let addr = self.resolve(host, port)?;
        self.connect_addr(addr)
    }

    pub fn connect_addr(&self, addr: SocketAddr) -> Result<()> {
        if !self.config.family.matches(&addr) {
            return Err(Error::unsupported_family(addr));
        }
        let mut inner = self.inner.lock();
        if inner.state == SocketState::Closed {
            return Err(Error::Closed);
        }
        inner.default_peer = Some(addr);
        if inner.state == SocketState::Unbound {
            inner.state = SocketState::Connected;
        }
        debug!(handle = %self.handle, peer = %addr, "default destination set");
        Ok(())
    }

    /// Send to the default destination.
    pub fn send(&self, payload: &[u8]) -> Result<usize> {
        let dest = self.inner.lock().default_peer;
        match dest {
            Some(dest) => self.send_to_addr(payload, dest),
            None => Err(Error::DestinationRequired),
        }
    }

    pub fn send_to(&self, payload: &[u8], host: &str, port: u16) -> Result<usize> {
        let addr = self.resolve(host, port)?;
        self.send_to_addr(payload, addr)
    }

    /// Protect and send `payload` to `dest`, waiting for the handshake if
    /// one is needed. Returns the number of plaintext bytes sent.
    pub fn send_to_addr(&self, payload: &[u8], dest: SocketAddr) -> Result<usize> {
        if !self.config.family.matches(&dest) {
            return Err(Error::unsupported_family(dest));
        }
        {
            let mut inner = self.inner.lock();
            match inner.state {
                SocketState::Closed => return Err(Error::Closed),
                SocketState::Bound => {}
                SocketState::Unbound | SocketState::Connected => {
                    self.context
                        .transport
                        .bind(self.config.family.unspecified(0))?;
                    self.start_receiver(&mut inner)?;
                }
            }
        }

        let started = Instant::now();
        let backoff = self.config.send_backoff();
        loop {
            let status = self
                .sessions
                .with_session(dest, |engine, session| engine.write_record(session, payload))?;

            match status {
                WriteStatus::Accepted(n) => {
                    trace!(peer = %dest, bytes = n, "record sent");
                    return Ok(n);
                }
                WriteStatus::InProgress => {
                    if let Some(limit) = self.config.handshake_timeout() {
                        if started.elapsed() >= limit {
                            warn!(peer = %dest, "handshake timed out");
                            return Err(Error::HandshakeTimeout(dest));
                        }
                    }
                    if self.is_closed() {
                        return Err(Error::Closed);
                    }
                    thread::sleep(backoff);
                }
                WriteStatus::IoFailure => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        format!("engine failed to transmit record to {dest}"),
                    )));
                }
                WriteStatus::Refused(alert) => {
                    warn!(peer = %dest, alert = %alert, "handshake refused");
                    return Err(Error::ConnectionRefused {
                        peer: dest,
                        reason: alert.to_string(),
                    });
                }
            }
        }
    }

    /// Take the oldest received datagram, blocking until one arrives.
    /// The payload is cut to `max_len` bytes when given.
    pub fn recv_from(&self, max_len: Option<usize>) -> Result<Datagram> {
        self.ensure_open()?;
        Ok(self.context.queue.pop().truncated(max_len))
    }

    /// Non-blocking [`recv_from`](Self::recv_from). Fails with `WouldBlock`.
    pub fn try_recv_from(&self, max_len: Option<usize>) -> Result<Datagram> {
        self.ensure_open()?;
        Ok(self.context.queue.try_pop()?.truncated(max_len))
    }

    /// Like [`recv_from`](Self::recv_from) but leaves the datagram queued.
    pub fn peek_from(&self, max_len: Option<usize>) -> Result<Datagram> {
        self.ensure_open()?;
        Ok(self.context.queue.peek().truncated(max_len))
    }

    pub fn try_peek_from(&self, max_len: Option<usize>) -> Result<Datagram> {
        self.ensure_open()?;
        Ok(self.context.queue.try_peek()?.truncated(max_len))
    }

    pub fn add_identity(&self, identity: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Result<()> {
        self.context.security.write().add_identity(identity, key)
    }

    pub fn add_key(&self, key: impl Into<Vec<u8>>) -> Result<()> {
        self.context.security.write().add_key(key)
    }

    pub fn set_default_identity(&self, identity: &[u8]) -> Result<()> {
        self.context.security.write().set_default_identity(identity)
    }

    pub fn set_default_key(&self, key: &[u8]) -> Result<()> {
        self.context.security.write().set_default_key(key)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.context.transport.local_addr()
    }

    /// Default destination set by `connect`.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().default_peer
    }

    /// Number of live peer sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Datagrams waiting to be received.
    pub fn pending(&self) -> usize {
        self.context.queue.len()
    }

    pub fn handle(&self) -> AppHandle {
        self.handle
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SocketState::Closed
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Shut the socket down. Safe to call more than once.
    ///
    /// The receiver and sweep threads are stopped before any session is
    /// destroyed, and the handle stays registered until both are gone so
    /// closing alerts can still be sent.
    pub fn close(&self) {
        let receiver = {
            let mut inner = self.inner.lock();
            if inner.state == SocketState::Closed {
                return;
            }
            inner.state = SocketState::Closed;
            inner.receiver.take()
        };

        self.running.store(false, Ordering::Release);
        if let Some(handle) = receiver {
            if handle.join().is_err() {
                error!(handle = %self.handle, "receiver thread panicked");
            }
        }

        self.sessions.evict_all();
        self.engine.destroy_context();
        self.context.transport.close();
        registry::unregister(self.handle);
        info!(handle = %self.handle, "socket closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Resolve `host:port` to an address of this socket's family.
    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let candidates: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::resolution(format!("{host}:{port}: {e}")))?
            .collect();

        if let Some(addr) = candidates.iter().find(|a| self.config.family.matches(a)) {
            return Ok(*addr);
        }
        match candidates.first() {
            Some(other) => Err(Error::unsupported_family(other)),
            None => Err(Error::resolution(format!("{host}:{port}: no addresses"))),
        }
    }

    /// Start the receiver thread once. Caller holds the state lock.
    fn start_receiver(&self, inner: &mut Inner) -> Result<()> {
        if inner.receiver.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::Release);
        let worker = Receiver {
            handle: self.handle,
            transport: self.context.transport.clone(),
            sessions: self.sessions.clone(),
            running: self.running.clone(),
            max_datagram_size: self.config.max_datagram_size,
        };
        let thread = thread::Builder::new()
            .name(format!("sealgram-recv-{}", self.handle))
            .spawn(move || worker.run());

        match thread {
            Ok(thread) => {
                inner.receiver = Some(thread);
                inner.state = SocketState::Bound;
                debug!(handle = %self.handle, "receiver started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }
}

impl<E: Engine> Drop for SecureDatagramSocket<E> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<E: Engine> std::fmt::Debug for SecureDatagramSocket<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureDatagramSocket")
            .field("handle", &self.handle)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Receiver<E: Engine> {
    handle: AppHandle,
    transport: Arc<Transport>,
    sessions: Arc<PeerSessionTable<E>>,
    running: Arc<AtomicBool>,
    max_datagram_size: usize,
}

impl<E: Engine> Receiver<E> {
    fn run(self) {
        let mut buf = vec![0u8; self.max_datagram_size];
        while self.running.load(Ordering::Acquire) {
            let (n, peer) = match self.transport.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if transport::is_timeout(&e) => continue,
                Err(e) => {
                    if self.transport.is_closed() {
                        break;
                    }
                    // ICMP errors from earlier sends surface here on some platforms.
                    debug!(handle = %self.handle, error = %e, "receive failed");
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
            };

            let data = &buf[..n];
            match self
                .sessions
                .with_session(peer, |engine, session| engine.handle_incoming(session, data))
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(handle = %self.handle, peer = %peer, error = %e, "engine rejected datagram"),
                Err(Error::Closed) => break,
                Err(e) => warn!(handle = %self.handle, peer = %peer, error = %e, "dropping datagram"),
            }
        }
        trace!(handle = %self.handle, "receiver stopped");
    }
}

fn write_callback<E: Engine>(app: AppHandle, session: &E::Session, data: &[u8]) -> io::Result<usize> {
    let context = registry::lookup(app).map_err(|e| {
        error!(handle = %app, error = %e, "write callback for unregistered socket");
        io::Error::new(io::ErrorKind::NotFound, e.to_string())
    })?;
    context.transport.send_to(data, E::session_address(session))
}

fn read_callback<E: Engine>(app: AppHandle, session: &E::Session, data: &[u8]) {
    match registry::lookup(app) {
        Ok(context) => context.queue.push(Datagram {
            payload: Bytes::copy_from_slice(data),
            peer: E::session_address(session),
        }),
        Err(e) => error!(handle = %app, error = %e, "read callback for unregistered socket"),
    }
}

fn key_lookup_callback<E: Engine>(
    app: AppHandle,
    _session: &E::Session,
    kind: CredentialKind,
    hint: Option<&[u8]>,
    out: &mut [u8],
) -> std::result::Result<usize, AlertDescription> {
    let context = registry::lookup(app).map_err(|e| {
        error!(handle = %app, error = %e, "key lookup for unregistered socket");
        AlertDescription::InternalError
    })?;
    let store = context.security.read();
    store.lookup_credential(kind, hint, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngine;

    fn config() -> SocketConfig {
        SocketConfig::default()
            .with_send_backoff(Duration::from_millis(5))
            .with_receive_poll(Duration::from_millis(20))
    }

    fn socket() -> SecureDatagramSocket<MockEngine> {
        SecureDatagramSocket::new(config()).unwrap()
    }

    fn bound() -> (SecureDatagramSocket<MockEngine>, SocketAddr) {
        let s = socket();
        s.bind("127.0.0.1", 0).unwrap();
        let addr = s.local_addr().unwrap();
        (s, addr)
    }

    fn recv_within(s: &SecureDatagramSocket<MockEngine>, wait: Duration) -> Option<Datagram> {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            match s.try_recv_from(None) {
                Ok(d) => return Some(d),
                Err(Error::WouldBlock) => thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        None
    }

    #[test]
    fn test_send_and_receive() {
        let (server, server_addr) = bound();
        let client = socket();

        assert_eq!(client.send_to_addr(b"foobar", server_addr).unwrap(), 6);
        let datagram = server.recv_from(None).unwrap();
        assert_eq!(&datagram.payload[..], b"foobar");
        assert_eq!(datagram.peer.port(), client.local_addr().unwrap().port());
        assert_eq!(client.state(), SocketState::Bound);
    }

    #[test]
    fn test_connect_then_send() {
        let (server, server_addr) = bound();
        let client = socket();
        client.connect("127.0.0.1", server_addr.port()).unwrap();
        assert_eq!(client.state(), SocketState::Connected);
        assert_eq!(client.peer_addr(), Some(server_addr));

        client.send(b"hello").unwrap();
        let datagram = recv_within(&server, Duration::from_secs(5)).unwrap();
        assert_eq!(&datagram.payload[..], b"hello");
    }

    #[test]
    fn test_peek_then_pop() {
        let (server, server_addr) = bound();
        let client = socket();
        client.send_to_addr(b"peekaboo", server_addr).unwrap();

        let peeked = server.peek_from(Some(4)).unwrap();
        assert_eq!(&peeked.payload[..], b"peek");
        assert_eq!(server.pending(), 1);

        let popped = server.recv_from(None).unwrap();
        assert_eq!(&popped.payload[..], b"peekaboo");
        assert_eq!(popped.peer, peeked.peer);
        assert!(matches!(server.try_peek_from(None), Err(Error::WouldBlock)));
    }

    #[test]
    fn test_send_without_destination() {
        let client = socket();
        assert!(matches!(client.send(b"x"), Err(Error::DestinationRequired)));
    }

    #[test]
    fn test_try_recv_empty() {
        let (server, _) = bound();
        assert!(matches!(server.try_recv_from(None), Err(Error::WouldBlock)));
    }

    #[test]
    fn test_family_mismatch() {
        let client = socket();
        assert!(matches!(
            client.connect("::1", 2342),
            Err(Error::UnsupportedFamily(_))
        ));
        assert!(matches!(
            client.send_to_addr(b"x", "[::1]:2342".parse().unwrap()),
            Err(Error::UnsupportedFamily(_))
        ));
    }

    #[test]
    fn test_refused_handshake() {
        let (_server, server_addr) = bound();
        let client = socket();
        client.engine.refuse.store(true, Ordering::SeqCst);

        match client.send_to_addr(b"x", server_addr) {
            Err(Error::ConnectionRefused { peer, reason }) => {
                assert_eq!(peer, server_addr);
                assert_eq!(reason, "handshake_failure");
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_timeout() {
        let (_server, server_addr) = bound();
        let client: SecureDatagramSocket<MockEngine> = SecureDatagramSocket::new(
            config().with_handshake_timeout(Some(Duration::from_millis(50))),
        )
        .unwrap();
        client.engine.stall.store(true, Ordering::SeqCst);

        assert!(matches!(
            client.send_to_addr(b"x", server_addr),
            Err(Error::HandshakeTimeout(_))
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (server, _) = bound();
        let handle = server.handle();
        assert!(registry::contains(handle));

        server.close();
        server.close();

        assert!(server.is_closed());
        assert!(!registry::contains(handle));
        assert_eq!(server.engine.contexts_destroyed.load(Ordering::SeqCst), 1);
        assert!(matches!(server.recv_from(None), Err(Error::Closed)));
        assert!(matches!(server.bind_addr("127.0.0.1:0".parse().unwrap()), Err(Error::Closed)));
    }

    #[test]
    fn test_close_destroys_sessions() {
        let (server, server_addr) = bound();
        let client = socket();
        client.send_to_addr(b"x", server_addr).unwrap();
        assert_eq!(client.session_count(), 1);

        client.close();
        assert_eq!(client.engine.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(client.session_count(), 0);
        drop(server);
    }

    #[test]
    fn test_unbound_close() {
        let s = socket();
        s.close();
        assert!(s.is_closed());
    }
}
