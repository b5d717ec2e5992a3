//! Share error types.
//!
//! These errors are serializable and carry strings instead of
//! `std::io::Error`, so they can travel inside events and status snapshots.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::KeyError;
use crate::metadata::MetadataError;

/// Longest message kept from an origin error body or I/O error.
pub const MAX_MESSAGE_CHARS: usize = 2047;

/// Error taxonomy shared by the engine and its adapters.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShareError {
    /// The origin answered with a status other than 200/206. Terminal.
    #[error("Origin rejected request (HTTP {status}): {message}")]
    OriginRejected {
        /// HTTP status returned by the origin.
        status: u16,
        /// Origin error body, truncated.
        message: String,
    },

    /// The downloaded bytes do not hash to the trusted ETag. Terminal.
    #[error("ETag[{etag}] and MD5[{md5}] not match")]
    IntegrityMismatch {
        /// Expected digest from the ETag.
        etag: String,
        /// Digest of the downloaded file.
        md5: String,
    },

    /// A read or write failed after progress was made; the leader resumes.
    #[error("Transient I/O error at byte {offset} ({kind}): {message}")]
    TransientIo {
        /// Published position when the error happened.
        offset: u64,
        /// I/O error kind.
        kind: String,
        /// Error message.
        message: String,
    },

    /// A read or write failed without any progress. Terminal.
    #[error("I/O error without progress ({kind}): {message}")]
    TransientIoExhausted {
        /// I/O error kind.
        kind: String,
        /// Error message.
        message: String,
    },

    /// The client went away while being served.
    #[error("Client disconnected")]
    ClientDisconnected,

    /// No sidecar exists for a committed file.
    #[error("Metadata not found: {path}")]
    MetadataNotFound {
        /// Sidecar path.
        path: String,
    },

    /// The request URL cannot be turned into a resource key.
    #[error("Invalid resource: {message}")]
    InvalidKey {
        /// Why the URL was rejected.
        message: String,
    },

    /// The service shut down while the download was running.
    #[error("Download cancelled")]
    Cancelled,

    /// Local filesystem failure outside the streaming loop.
    #[error("I/O error ({kind}): {message}")]
    Io {
        /// I/O error kind.
        kind: String,
        /// Error message.
        message: String,
    },
}

impl ShareError {
    /// Create an origin rejection, truncating the message.
    pub fn origin_rejected(status: u16, message: impl Into<String>) -> Self {
        Self::OriginRejected {
            status,
            message: truncate_message(message.into()),
        }
    }

    /// Create an integrity mismatch.
    pub fn integrity_mismatch(etag: impl Into<String>, md5: impl Into<String>) -> Self {
        Self::IntegrityMismatch {
            etag: etag.into(),
            md5: md5.into(),
        }
    }

    /// A resumable I/O failure at `offset`.
    #[must_use]
    pub fn transient(offset: u64, err: &std::io::Error) -> Self {
        Self::TransientIo {
            offset,
            kind: format!("{:?}", err.kind()),
            message: truncate_message(err.to_string()),
        }
    }

    /// An I/O failure that made no progress.
    #[must_use]
    pub fn exhausted(err: &std::io::Error) -> Self {
        Self::TransientIoExhausted {
            kind: format!("{:?}", err.kind()),
            message: truncate_message(err.to_string()),
        }
    }

    /// Capture a `std::io::Error`.
    #[must_use]
    pub fn from_io_error(err: &std::io::Error) -> Self {
        Self::Io {
            kind: format!("{:?}", err.kind()),
            message: truncate_message(err.to_string()),
        }
    }

    /// Stable name of the variant, used as the event `error_kind`.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::OriginRejected { .. } => "OriginRejected",
            Self::IntegrityMismatch { .. } => "IntegrityMismatch",
            Self::TransientIo { .. } => "TransientIo",
            Self::TransientIoExhausted { .. } => "TransientIoExhausted",
            Self::ClientDisconnected => "ClientDisconnected",
            Self::MetadataNotFound { .. } => "MetadataNotFound",
            Self::InvalidKey { .. } => "InvalidKey",
            Self::Cancelled => "Cancelled",
            Self::Io { .. } => "Io",
        }
    }

    /// HTTP status to report to clients that have not received a head yet.
    ///
    /// `None` means waiting clients are redirected to retry instead.
    #[must_use]
    pub const fn reply_status(&self) -> Option<u16> {
        match self {
            Self::OriginRejected { status, .. } => Some(*status),
            Self::IntegrityMismatch { .. } => Some(409),
            _ => None,
        }
    }

    /// Whether the leader may resume after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }

    /// Short message without the variant prefix.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::OriginRejected { message, .. }
            | Self::TransientIo { message, .. }
            | Self::TransientIoExhausted { message, .. }
            | Self::InvalidKey { message }
            | Self::Io { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<KeyError> for ShareError {
    fn from(err: KeyError) -> Self {
        Self::InvalidKey {
            message: err.to_string(),
        }
    }
}

impl From<MetadataError> for ShareError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound { path } => Self::MetadataNotFound {
                path: path.display().to_string(),
            },
            MetadataError::Corrupt { message, .. } => Self::Io {
                kind: "InvalidData".into(),
                message,
            },
            MetadataError::Io { message, .. } => Self::Io {
                kind: "Other".into(),
                message,
            },
        }
    }
}

/// Convenience result type for share operations.
pub type ShareResult<T> = Result<T, ShareError>;

/// Cut a message to [`MAX_MESSAGE_CHARS`] characters.
#[must_use]
pub fn truncate_message(message: String) -> String {
    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message,
    }
}
