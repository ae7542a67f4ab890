//! Minimal single-threaded WebSocket server.
//!
//! One `mio` event loop accepts TCP connections, performs the RFC 6455
//! opening handshake, decodes client frames and hands messages to an
//! [`EventSink`]. No worker threads.

pub mod config;
pub mod error;
pub mod net;
pub mod sink;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use net::connection::{Connection, ConnectionId, ConnectionState};
pub use net::handshake::{HandshakeRequest, Headers};
pub use net::registry::ConnectionRegistry;
pub use net::ws_server::{Server, ShutdownHandle};
pub use sink::{EventSink, NoopSink};
