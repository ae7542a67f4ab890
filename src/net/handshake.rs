use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::digest;
use thiserror::Error;

/// Magic value appended to the client key before hashing (RFC 6455).
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
pub const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";
pub const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";

const DEFAULT_PROTOCOL: &str = "13";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake request has no Sec-WebSocket-Key header")]
    MissingKey,
}

/// Header map with case-insensitive names. Names are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any earlier value under the same name.
    pub fn insert(&mut self, name: &str, value: &str) {
        self.entries
            .insert(name.to_ascii_lowercase(), value.to_owned());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The opening HTTP request of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    request_line: Option<String>,
    headers: Headers,
}

impl HandshakeRequest {
    /// Parses the raw request head.
    ///
    /// Lines are split on `\n` (a trailing `\r` is dropped). A line starting
    /// with `GET` is the request line; every other line is split on its first
    /// colon into a name/value pair, and pairs with an empty side are skipped.
    pub fn parse(raw: &[u8]) -> Result<Self, HandshakeError> {
        let text = String::from_utf8_lossy(raw);
        let mut request_line = None;
        let mut headers = Headers::new();

        for line in text.split('\n').map(|line| line.trim_end_matches('\r')) {
            if line.starts_with("GET") {
                request_line = Some(line.to_owned());
                continue;
            }

            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            // A blank value counts as absent, so `Sec-WebSocket-Key:` alone is missing.
            if !name.is_empty() && !value.is_empty() {
                headers.insert(name, value);
            }
        }

        if !headers.contains(SEC_WEBSOCKET_KEY) {
            return Err(HandshakeError::MissingKey);
        }

        Ok(Self {
            request_line,
            headers,
        })
    }

    pub fn request_line(&self) -> Option<&str> {
        self.request_line.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn key(&self) -> &str {
        self.headers.get(SEC_WEBSOCKET_KEY).unwrap_or_default()
    }

    /// Builds the `101 Switching Protocols` reply for this request.
    pub fn response(&self) -> String {
        let protocol = self
            .headers
            .get(SEC_WEBSOCKET_PROTOCOL)
            .or_else(|| self.headers.get(SEC_WEBSOCKET_VERSION))
            .unwrap_or(DEFAULT_PROTOCOL);

        let lines = [
            "HTTP/1.1 101 Switching Protocols".to_owned(),
            "Upgrade: websocket".to_owned(),
            "Connection: Upgrade".to_owned(),
            format!("Sec-WebSocket-Accept: {}", accept_key(self.key())),
            format!("Sec-WebSocket-Protocol: {protocol}"),
            "Sec-WebSocket-Extensions: ".to_owned(),
        ];

        let mut response = lines.join("\r\n");
        response.push_str("\r\n\r\n");
        response
    }
}

/// `base64(SHA1(client_key + GUID))`
pub fn accept_key(client_key: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(client_key.as_bytes());
    ctx.update(GUID.as_bytes());
    STANDARD.encode(ctx.finish())
}

/// Index just past the blank line that ends a request head, if present.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
