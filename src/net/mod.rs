pub mod connection;
pub mod framing;
pub mod handshake;
pub mod registry;
pub mod tcp_opt;
pub mod ws_server;
