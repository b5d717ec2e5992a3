//! Origin fetcher port.
//!
//! The engine asks the origin for a resource, optionally resuming from a byte
//! offset, and pulls the body chunk by chunk. Status handling is left to the
//! engine: a fetcher returns every HTTP response it receives, and only
//! transport failures (connect, timeout, reset) surface as [`OriginError`].

use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport-level failure talking to the origin.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OriginError {
    /// Could not establish a connection.
    #[error("Connect to {url} failed: {message}")]
    Connect { url: String, message: String },

    /// The origin did not answer in time.
    #[error("Request to {url} timed out: {message}")]
    Timeout { url: String, message: String },

    /// Any other transport failure.
    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },
}

impl OriginError {
    /// Stable name of the variant, used in events.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "Connect",
            Self::Timeout { .. } => "Timeout",
            Self::Transport { .. } => "Transport",
        }
    }

    /// Convert into an I/O error so the engine's retry logic treats it uniformly.
    #[must_use]
    pub fn into_io(self) -> io::Error {
        let kind = match self {
            Self::Connect { .. } => io::ErrorKind::ConnectionRefused,
            Self::Timeout { .. } => io::ErrorKind::TimedOut,
            Self::Transport { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }
}

/// Streaming body of an origin response.
#[async_trait]
pub trait OriginBody: Send {
    /// Next chunk of the body, `Ok(None)` at the end.
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>>;
}

/// An origin response with its body still unread.
pub struct OriginResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Body stream.
    pub body: Box<dyn OriginBody>,
}

impl OriginResponse {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the status is one the engine can stream from (200 or 206).
    #[must_use]
    pub const fn is_streamable(&self) -> bool {
        matches!(self.status, 200 | 206)
    }
}

impl fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Port for fetching resources from the origin.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Issue a GET for `url`.
    ///
    /// When `resume_from > 0` the request carries `Range: bytes=<resume_from>-`.
    async fn fetch(&self, url: &str, resume_from: u64) -> Result<OriginResponse, OriginError>;
}
