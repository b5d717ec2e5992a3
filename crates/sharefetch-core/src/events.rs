//! Share events - discriminated union for everything observers can see.
//!
//! Listeners get one callback and switch on [`ShareEvent::kind`]. Serialized,
//! the event is a tagged object:
//!
//! ```text
//! { "type": "download_before", "resource": {...}, "metadata": {...} }
//! { "type": "download_error", "resource": {...}, "message": "...", "error_kind": "..." }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::key::ResourceKey;
use crate::metadata::FileMetadata;

/// Which resource an event is about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceRef {
    /// Origin URL.
    pub uri: String,
    /// Path below the store root.
    pub relative_path: String,
    /// Final on-disk location.
    pub file: PathBuf,
}

impl ResourceRef {
    /// Describe `key` stored at `file`.
    #[must_use]
    pub fn new(key: &ResourceKey, file: impl Into<PathBuf>) -> Self {
        Self {
            uri: key.as_str().to_string(),
            relative_path: key.relative_path().to_string(),
            file: file.into(),
        }
    }

    /// Format an error message as `<message> - <uri>`.
    #[must_use]
    pub fn describe(&self, message: &str) -> String {
        format!("{message} - {}", self.uri)
    }
}

/// Event kind, for listeners that switch on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareEventKind {
    DownloadBefore,
    DownloadSuccess,
    DownloadError,
    SharedDownloadSuccess,
    SharedDownloadError,
    LocalDownload,
    LocalDownloadError,
}

impl ShareEventKind {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DownloadBefore => "download_before",
            Self::DownloadSuccess => "download_success",
            Self::DownloadError => "download_error",
            Self::SharedDownloadSuccess => "shared_download_success",
            Self::SharedDownloadError => "shared_download_error",
            Self::LocalDownload => "local_download",
            Self::LocalDownloadError => "local_download_error",
        }
    }

    /// Whether this kind reports a failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Self::DownloadError | Self::SharedDownloadError | Self::LocalDownloadError
        )
    }
}

/// Single discriminated union for all share events.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShareEvent {
    /// The leader accepted the first origin response of its session.
    DownloadBefore {
        resource: ResourceRef,
        metadata: Arc<FileMetadata>,
    },

    /// The leader committed the file.
    DownloadSuccess {
        resource: ResourceRef,
        metadata: Arc<FileMetadata>,
        started_at: DateTime<Utc>,
        /// Elapsed time minus time spent writing to disk.
        duration: Duration,
    },

    /// The leader gave up.
    DownloadError {
        resource: ResourceRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Arc<FileMetadata>>,
        started_at: DateTime<Utc>,
        duration: Duration,
        /// `<message> - <uri>`.
        message: String,
        /// Name of the error variant.
        error_kind: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },

    /// A follower received the whole resource (or its whole range).
    SharedDownloadSuccess {
        resource: ResourceRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Arc<FileMetadata>>,
        started_at: DateTime<Utc>,
        duration: Duration,
        bytes: u64,
    },

    /// A follower ended without receiving everything it asked for.
    SharedDownloadError {
        resource: ResourceRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Arc<FileMetadata>>,
        started_at: DateTime<Utc>,
        duration: Duration,
        bytes: u64,
        message: String,
        error_kind: String,
    },

    /// A committed file was served from disk.
    LocalDownload {
        resource: ResourceRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Arc<FileMetadata>>,
        started_at: DateTime<Utc>,
        duration: Duration,
        bytes: u64,
    },

    /// Serving a committed file failed.
    LocalDownloadError {
        resource: ResourceRef,
        started_at: DateTime<Utc>,
        message: String,
        error_kind: String,
    },
}

impl ShareEvent {
    /// The event's kind.
    #[must_use]
    pub const fn kind(&self) -> ShareEventKind {
        match self {
            Self::DownloadBefore { .. } => ShareEventKind::DownloadBefore,
            Self::DownloadSuccess { .. } => ShareEventKind::DownloadSuccess,
            Self::DownloadError { .. } => ShareEventKind::DownloadError,
            Self::SharedDownloadSuccess { .. } => ShareEventKind::SharedDownloadSuccess,
            Self::SharedDownloadError { .. } => ShareEventKind::SharedDownloadError,
            Self::LocalDownload { .. } => ShareEventKind::LocalDownload,
            Self::LocalDownloadError { .. } => ShareEventKind::LocalDownloadError,
        }
    }

    /// The resource this event is about.
    #[must_use]
    pub const fn resource(&self) -> &ResourceRef {
        match self {
            Self::DownloadBefore { resource, .. }
            | Self::DownloadSuccess { resource, .. }
            | Self::DownloadError { resource, .. }
            | Self::SharedDownloadSuccess { resource, .. }
            | Self::SharedDownloadError { resource, .. }
            | Self::LocalDownload { resource, .. }
            | Self::LocalDownloadError { resource, .. } => resource,
        }
    }

    /// Error message for failure events.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::DownloadError { message, .. }
            | Self::SharedDownloadError { message, .. }
            | Self::LocalDownloadError { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Error kind name for failure events.
    #[must_use]
    pub fn error_kind(&self) -> Option<&str> {
        match self {
            Self::DownloadError { error_kind, .. }
            | Self::SharedDownloadError { error_kind, .. }
            | Self::LocalDownloadError { error_kind, .. } => Some(error_kind),
            _ => None,
        }
    }
}
