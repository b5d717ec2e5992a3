//! Response sink port.
//!
//! A sink is the engine's handle on one suspended client response. The
//! transport owns the connection and its idle expiry; the engine only writes
//! to it and asks whether it is still alive.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Headers added to every response produced by the engine.
pub const CORS_HEADERS: &[(&str, &str)] = &[
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "POST, GET, HEAD"),
];

/// Status line and headers of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP status code (200 or 206).
    pub status: u16,
    /// Headers in output order.
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Port for writing to one client response.
///
/// Exactly one of `start` + `complete`, `redirect`, `send_error` or
/// `disconnect` ends a response. Implementations must tolerate calls after
/// the client went away by returning errors or doing nothing.
#[async_trait]
pub trait ResponseSink: Send {
    /// Send the status line and headers.
    async fn start(&mut self, head: ResponseHead) -> io::Result<()>;

    /// Send one body chunk.
    async fn write(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Finish the response normally.
    async fn complete(&mut self);

    /// Answer with a redirect (no head may have been sent).
    async fn redirect(&mut self, location: &str);

    /// Answer with an error status (no head may have been sent).
    async fn send_error(&mut self, status: u16, message: &str);

    /// Abort the connection after a head was sent.
    fn disconnect(&mut self);

    /// Whether the client is still connected and not expired.
    fn is_connected(&self) -> bool;

    /// Set the idle timeout after which the transport may expire the client.
    fn set_timeout(&mut self, timeout: Duration);

    /// Restart the idle timeout.
    fn reset_timeout(&mut self);
}
