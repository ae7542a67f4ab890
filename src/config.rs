use std::env;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

pub const HOST_VAR: &str = "CLANK_HOST";
pub const PORT_VAR: &str = "CLANK_PORT";

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 80;

/// Where the server listens. Read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loads `.env` (if any) and reads `CLANK_HOST` / `CLANK_PORT`.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_vars(env::var(HOST_VAR).ok(), env::var(PORT_VAR).ok())
    }

    fn from_vars(host: Option<String>, port: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = host.filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_owned();
        }
        if let Some(port) = port {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{PORT_VAR}={port:?} is not a valid port")))?;
        }

        Ok(config)
    }

    /// Resolves `host:port`, taking the first address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let resolve_err = |source| Error::Resolve {
            addr: self.to_string(),
            source,
        };

        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(resolve_err)?
            .next()
            .ok_or_else(|| {
                resolve_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no addresses returned",
                ))
            })
    }
}

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
