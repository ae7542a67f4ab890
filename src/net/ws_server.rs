use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::net::connection::{Connection, ConnectionId, ConnectionState};
use crate::net::framing::{self, Opcode};
use crate::net::handshake::{self, HandshakeRequest};
use crate::net::registry::ConnectionRegistry;
use crate::net::tcp_opt;
use crate::sink::EventSink;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

/// Most bytes read while waiting for the opening HTTP request.
pub const HEADER_READ_LIMIT: usize = 2048;
/// Size of a single read on an open connection.
pub const PAYLOAD_READ_LIMIT: usize = 4096;
/// Undecoded bytes a connection may buffer before it is dropped.
const MAX_INBOUND: usize = framing::MAX_FRAME_LEN as usize + framing::MAX_HEADER_LEN + 4;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Stops a running [`Server`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake event loop: {}", e);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Single-threaded WebSocket server.
///
/// Owns the listener and every client socket, waits on readiness with
/// `mio`, and drives accept -> handshake -> read -> decode -> dispatch.
pub struct Server<S> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: HashMap<ConnectionId, Connection>,
    registry: ConnectionRegistry,
    next_id: usize,
    sink: S,
    scratch: Box<[u8; PAYLOAD_READ_LIMIT]>,
    /// Open connections whose last read filled the buffer. `mio` will not
    /// report them again until they are drained, so they are read on the
    /// next iteration without waiting.
    backlog: BTreeSet<ConnectionId>,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    poll_timeout: Option<Duration>,
    handshake_timeout: Duration,
}

impl<S: EventSink> Server<S> {
    /// Binds the listening socket. Every failure here is a startup failure.
    pub fn bind(config: &ServerConfig, sink: S) -> Result<Self> {
        let addr = config.socket_addr()?;
        let startup = |source: io::Error| Error::Startup {
            addr: addr.to_string(),
            source,
        };

        let mut listener =
            TcpListener::from_std(tcp_opt::create_listener(addr).map_err(startup)?);
        let local_addr = listener.local_addr().map_err(startup)?;

        let poll = Poll::new().map_err(startup)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(startup)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(startup)?);

        info!("listening on {} ({})", local_addr, config);

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            local_addr,
            connections: HashMap::new(),
            registry: ConnectionRegistry::new(),
            next_id: FIRST_CONNECTION,
            sink,
            scratch: Box::new([0u8; PAYLOAD_READ_LIMIT]),
            backlog: BTreeSet::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
            poll_timeout: Some(DEFAULT_POLL_TIMEOUT),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// Upper bound on a single readiness wait. `None` waits indefinitely;
    /// shutdown still interrupts it through the waker.
    pub fn with_poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// How long an accepted socket may take to send a complete opening
    /// request before it is dropped.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Open connections in the order they completed the handshake.
    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.registry.iter()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Sockets currently owned, including ones still in the handshake.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sends `text` to `id` as a single text frame.
    pub fn send(&mut self, id: ConnectionId, text: &str) -> Result<()> {
        self.connections
            .get_mut(&id)
            .ok_or(Error::UnknownConnection(id))?
            .send(text)
    }

    /// Closes `id`. Returns `false` if no such connection exists.
    pub fn close(&mut self, id: ConnectionId) -> bool {
        if !self.connections.contains_key(&id) {
            return false;
        }
        self.release(id);
        true
    }

    /// Runs until a [`ShutdownHandle`] fires, then closes every connection.
    pub fn run(&mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::Acquire) {
            self.run_once(self.poll_timeout)?;
        }
        info!("shutting down, {} open connections", self.registry.len());
        self.close_all();
        Ok(())
    }

    /// One loop iteration: wait for readiness, then service what is ready.
    ///
    /// Each ready connection gets at most one read per iteration.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout = self.wait_timeout(timeout);
        let carried = std::mem::take(&mut self.backlog);

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                (event.token(), readable, event.is_writable())
            })
            .collect();

        let mut serviced = BTreeSet::new();
        for (token, readable, writable) in ready {
            match token {
                LISTENER => self.accept_pending(),
                WAKER => {}
                token => {
                    let id = ConnectionId::new(token.0);
                    if writable {
                        self.flush(id);
                    }
                    if readable && serviced.insert(id) {
                        self.service(id);
                    }
                }
            }
        }

        for id in carried {
            if !serviced.contains(&id) {
                self.service(id);
            }
        }

        self.expire_handshakes();
        Ok(())
    }

    fn wait_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        if !self.backlog.is_empty() {
            return Some(Duration::ZERO);
        }
        // Something is still handshaking, wake up in time to expire it.
        if self.connections.len() > self.registry.len() {
            let cap = self.handshake_timeout;
            return Some(requested.map_or(cap, |t| t.min(cap)));
        }
        requested
    }

    /// Drops accepted sockets that never completed their opening request.
    fn expire_handshakes(&mut self) {
        let now = Instant::now();
        let expired: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| conn.state() == ConnectionState::Accepted)
            .filter(|conn| now.duration_since(conn.accepted_at()) >= self.handshake_timeout)
            .map(Connection::id)
            .collect();

        for id in expired {
            debug!("{}: handshake timed out", id);
            self.release(id);
        }
    }

    /// Closes every connection, reporting `on_close` for the open ones.
    pub fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.release(id);
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let (mut socket, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return;
                }
            };

            if let Err(e) = tcp_opt::apply_optimizations(&socket) {
                debug!("could not tune socket from {}: {}", peer, e);
            }

            let id = ConnectionId::new(self.next_id);
            self.next_id += 1;

            if let Err(e) = self.poll.registry().register(
                &mut socket,
                id.token(),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!("could not register {} from {}: {}", id, peer, e);
                continue;
            }

            debug!("accepted {} from {}", id, peer);
            self.connections.insert(id, Connection::new(id, socket, peer));

            // The request often arrives together with the connection.
            self.advance_handshake(id);
        }
    }

    fn service(&mut self, id: ConnectionId) {
        let state = match self.connections.get(&id) {
            Some(conn) => conn.state(),
            None => return,
        };

        match state {
            ConnectionState::Accepted => self.advance_handshake(id),
            ConnectionState::Open => self.read_frames(id),
            ConnectionState::Closed => self.release(id),
        }
    }

    fn flush(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let Err(e) = conn.flush() {
            debug!("{}: write failed: {}", id, e);
            self.release(id);
        }
    }

    /// Reads the opening request and, once it is complete, answers it.
    fn advance_handshake(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        while handshake::head_len(&conn.inbound).is_none()
            && conn.inbound.len() < HEADER_READ_LIMIT
        {
            let room = HEADER_READ_LIMIT - conn.inbound.len();
            match conn.read(&mut self.scratch[..room]) {
                Ok(0) => {
                    debug!("{}: closed before the handshake", id);
                    self.release(id);
                    return;
                }
                Ok(n) => conn.inbound.extend_from_slice(&self.scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("{}: handshake read failed: {}", id, e);
                    self.release(id);
                    return;
                }
            }
        }

        let head_len = handshake::head_len(&conn.inbound).unwrap_or(conn.inbound.len());
        let head: Vec<u8> = conn.inbound.drain(..head_len).collect();

        let request = match HandshakeRequest::parse(&head) {
            Ok(request) => request,
            Err(e) => {
                warn!("{}: rejecting handshake from {}: {}", id, conn.peer_addr(), e);
                self.release(id);
                return;
            }
        };

        if let Err(e) = conn.write_or_queue(request.response().as_bytes()) {
            warn!("{}: handshake response failed: {}", id, e);
            self.sink.on_error(conn, request.headers());
            self.release(id);
            return;
        }

        conn.mark_open();
        self.registry.insert(id);
        info!("{}: open ({})", id, conn.peer_addr());
        self.sink.on_open(conn, request.headers());

        // Frames may have arrived in the same read as the request.
        if !self.reap_if_closed(id) {
            self.dispatch_frames(id);
        }
    }

    /// Does one read on `id` and dispatches every complete frame buffered.
    fn read_frames(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        let n = match conn.read(&mut self.scratch[..]) {
            Ok(0) => {
                debug!("{}: end of stream", id);
                self.release(id);
                return;
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                debug!("{}: read failed: {}", id, e);
                self.release(id);
                return;
            }
        };

        if n == PAYLOAD_READ_LIMIT {
            self.backlog.insert(id);
        }

        let chunk = &self.scratch[..n];
        trace!("{}: read {} bytes [{}]", id, n, hex::encode(&chunk[..n.min(16)]));

        if conn.inbound.is_empty() && chunk.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        if conn.inbound.len() + n > MAX_INBOUND {
            warn!("{}: inbound buffer overflow", id);
            self.release(id);
            return;
        }
        conn.inbound.extend_from_slice(chunk);

        self.dispatch_frames(id);
    }

    /// Returns `false` once the connection is gone.
    fn dispatch_frames(&mut self, id: ConnectionId) -> bool {
        loop {
            let Some(conn) = self.connections.get_mut(&id) else {
                return false;
            };

            let (used, frame) = match framing::decode_frame(&conn.inbound) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return true,
                Err(e) => {
                    warn!("{}: dropping connection: {}", id, e);
                    self.release(id);
                    return false;
                }
            };
            conn.inbound.drain(..used);

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    let text = String::from_utf8_lossy(&frame.payload);
                    self.sink.on_message(conn, &text);
                }
                Opcode::Close => {
                    debug!("{}: close frame received", id);
                    self.release(id);
                    return false;
                }
                other => debug!("{}: ignoring {:?} frame", id, other),
            }

            if self.reap_if_closed(id) {
                return false;
            }
        }
    }

    /// Releases `id` if a callback closed it. Returns `true` if it did.
    fn reap_if_closed(&mut self, id: ConnectionId) -> bool {
        let closed = matches!(
            self.connections.get(&id).map(Connection::state),
            Some(ConnectionState::Closed)
        );
        if closed {
            self.release(id);
        }
        closed
    }

    /// Removes the connection, deregisters and closes its socket, and
    /// reports `on_close` if it had been registered as open.
    fn release(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        self.backlog.remove(&id);

        if let Err(e) = self.poll.registry().deregister(conn.socket()) {
            debug!("{}: deregister: {}", id, e);
        }
        conn.close();

        if self.registry.remove(id) {
            info!("{}: closed", id);
            self.sink.on_close(&conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{Shutdown, TcpStream};

    use super::*;
    use crate::net::handshake::Headers;

    #[derive(Default)]
    struct Calls {
        opened: Vec<ConnectionId>,
        errors: Vec<ConnectionId>,
        closed: Vec<ConnectionId>,
    }

    impl EventSink for Calls {
        fn on_open(&mut self, conn: &mut Connection, _headers: &Headers) {
            self.opened.push(conn.id());
        }

        fn on_error(&mut self, conn: &mut Connection, headers: &Headers) {
            assert!(headers.contains("sec-websocket-key"));
            self.errors.push(conn.id());
        }

        fn on_close(&mut self, conn: &Connection) {
            self.closed.push(conn.id());
        }
    }

    fn pump_until(server: &mut Server<Calls>, done: impl Fn(&Server<Calls>) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(server) {
            assert!(Instant::now() < deadline, "timed out waiting for the server");
            server.run_once(Some(Duration::from_millis(10))).unwrap();
        }
    }

    #[test]
    fn failed_upgrade_response_reports_on_error_and_never_registers() {
        let config = ServerConfig::new("127.0.0.1", 0);
        let mut server = Server::bind(&config, Calls::default()).unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();

        // Only part of the head, so the connection waits in `Accepted`.
        client.write_all(b"GET /chat HTTP/1.1\r\n").unwrap();
        pump_until(&mut server, |s| s.connection_count() == 1);

        let id = *server.connections.keys().next().unwrap();
        assert_eq!(server.connections[&id].state(), ConnectionState::Accepted);
        server
            .connections
            .get_mut(&id)
            .unwrap()
            .socket()
            .shutdown(Shutdown::Write)
            .unwrap();

        client
            .write_all(b"Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n")
            .unwrap();
        pump_until(&mut server, |s| !s.sink().errors.is_empty());

        assert_eq!(server.sink().errors, vec![id]);
        assert!(server.sink().opened.is_empty());
        assert!(server.sink().closed.is_empty());
        assert!(server.registry.is_empty());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn full_reads_are_carried_to_the_next_iteration() {
        let config = ServerConfig::new("127.0.0.1", 0);
        let mut server = Server::bind(&config, Calls::default()).unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\r\n")
            .unwrap();
        pump_until(&mut server, |s| s.registry.len() == 1);
        let id = server.registry.snapshot()[0];

        // Three buffers' worth of one frame still in flight.
        let frame = framing::encode_masked(&vec![b'a'; 3 * PAYLOAD_READ_LIMIT], [1, 2, 3, 4]);
        client.write_all(&frame).unwrap();
        pump_until(&mut server, |s| s.backlog.contains(&id));

        assert_eq!(server.wait_timeout(None), Some(Duration::ZERO));
        let before = server.connections[&id].inbound.len();
        server.run_once(None).unwrap();
        assert!(server.connections[&id].inbound.len() > before);
    }
}
