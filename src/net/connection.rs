use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Instant;

use log::debug;
use mio::net::TcpStream;
use mio::Token;

use crate::error::{Error, Result};
use crate::net::framing;

/// Outbound bytes a single connection may have queued before sends fail.
pub const MAX_OUTBOUND: usize = 8 * 1024 * 1024;

/// Stable identity of a connection. Never reused while the server lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, handshake not finished yet.
    Accepted,
    Open,
    Closed,
}

/// One accepted client socket.
///
/// Owned by the server; the socket is released when the value is dropped.
/// No internal locking, all state belongs to the event loop thread.
pub struct Connection {
    id: ConnectionId,
    socket: TcpStream,
    peer: SocketAddr,
    state: ConnectionState,
    accepted_at: Instant,
    pub(crate) inbound: Vec<u8>,
    outbound: Vec<u8>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, socket: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            socket,
            peer,
            state: ConnectionState::Accepted,
            accepted_at: Instant::now(),
            inbound: Vec::new(),
            outbound: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Bytes accepted by `send` but not yet taken by the kernel.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Encodes `text` as a single text frame and hands it to the socket.
    ///
    /// Whatever the socket does not take immediately is queued and flushed
    /// on the next writable event. Fails on a hard write error, when the
    /// queue would exceed [`MAX_OUTBOUND`], or if the connection is not open.
    pub fn send(&mut self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotOpen(self.id));
        }
        let frame = framing::encode_text(text);
        self.write_or_queue(&frame)?;
        Ok(())
    }

    /// Marks the connection closed and shuts the socket down. The server
    /// drops it (and reports `on_close`) once control returns to the loop.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!("{}: shutdown: {}", self.id, e);
        }
    }

    pub(crate) fn mark_open(&mut self) {
        self.state = ConnectionState::Open;
    }

    pub(crate) fn socket(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Reads into `buf`, retrying on `Interrupted`. `Ok(0)` is end of stream.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.socket.read(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Writes as much of `bytes` as the socket accepts and queues the rest.
    pub(crate) fn write_or_queue(&mut self, bytes: &[u8]) -> io::Result<()> {
        if !self.outbound.is_empty() {
            return self.enqueue(bytes);
        }

        let written = self.write_some(bytes)?;
        self.enqueue(&bytes[written..])
    }

    /// Pushes queued bytes to the socket until it would block.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        if self.outbound.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut self.outbound);
        let written = self.write_some(&pending);
        self.outbound = pending;

        let written = written?;
        self.outbound.drain(..written);
        Ok(())
    }

    fn write_some(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match self.socket.write(&bytes[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn enqueue(&mut self, rest: &[u8]) -> io::Result<()> {
        if rest.is_empty() {
            return Ok(());
        }
        if self.outbound.len() + rest.len() > MAX_OUTBOUND {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("outbound queue for {} is full", self.id),
            ));
        }
        self.outbound.extend_from_slice(rest);
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}
