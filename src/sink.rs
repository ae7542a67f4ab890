use crate::net::connection::Connection;
use crate::net::handshake::Headers;

/// Application hooks invoked by the server loop.
///
/// Every method defaults to doing nothing. Callbacks run on the loop thread,
/// so a slow callback stalls every other connection.
pub trait EventSink {
    /// The handshake succeeded and `conn` is now registered.
    fn on_open(&mut self, _conn: &mut Connection, _headers: &Headers) {}

    /// A text (or binary, lossily converted) frame arrived.
    fn on_message(&mut self, _conn: &mut Connection, _text: &str) {}

    /// The upgrade response could not be sent. `conn` is dropped afterwards
    /// and never registered.
    fn on_error(&mut self, _conn: &mut Connection, _headers: &Headers) {}

    /// `conn` left the registry. Fires exactly once per opened connection.
    fn on_close(&mut self, _conn: &Connection) {}
}

/// Sink that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn on_open(&mut self, conn: &mut Connection, headers: &Headers) {
        (**self).on_open(conn, headers)
    }

    fn on_message(&mut self, conn: &mut Connection, text: &str) {
        (**self).on_message(conn, text)
    }

    fn on_error(&mut self, conn: &mut Connection, headers: &Headers) {
        (**self).on_error(conn, headers)
    }

    fn on_close(&mut self, conn: &Connection) {
        (**self).on_close(conn)
    }
}
