use std::io;

use thiserror::Error;

use crate::net::connection::ConnectionId;
use crate::net::framing::FrameError;
use crate::net::handshake::HandshakeError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not resolve listen address {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start listener on {addr}: {source}")]
    Startup {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
