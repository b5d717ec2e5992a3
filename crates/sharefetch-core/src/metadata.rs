//! Header sidecar persisted next to every cached file.
//!
//! The sidecar stores the origin's response headers so a cached file can be
//! served with the same `Content-Type`, `ETag` and friends. Format: one
//! header per line, `Name:Value\n`, UTF-8. Lines whose first colon sits at
//! index 0 or 1 are ignored.
//!
//! A sidecar is either fully present or absent. Writes go through a temp
//! file in the same directory, are fsynced, then renamed into place.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::is_md5_hex;
use crate::ports::{CORS_HEADERS, ResponseHead};
use crate::range::ByteRange;

/// Headers never stored in a sidecar nor replayed to clients.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Headers recomputed for every response instead of replayed.
const PER_RESPONSE_HEADERS: &[&str] = &["content-length", "content-range", "accept-ranges"];

/// Errors reading or writing a sidecar.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    /// No sidecar exists at the path.
    #[error("Metadata not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// The sidecar exists but is not valid UTF-8.
    #[error("Metadata corrupt at {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    /// Any other filesystem failure.
    #[error("Metadata I/O error at {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
}

impl MetadataError {
    fn from_io(path: &Path, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            }
        }
    }

    /// Whether the sidecar simply does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Cached response headers plus download timings for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    path: PathBuf,
    headers: IndexMap<String, String>,
    created_at: DateTime<Utc>,
    network_time: Duration,
    disk_write_time: Duration,
}

impl FileMetadata {
    /// Empty metadata bound to a sidecar path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            headers: IndexMap::new(),
            created_at: Utc::now(),
            network_time: Duration::ZERO,
            disk_write_time: Duration::ZERO,
        }
    }

    /// Build metadata from an origin response.
    ///
    /// A `206` is normalised to describe the whole resource: `Content-Length`
    /// becomes the total from `Content-Range`, and `Content-Range` is dropped.
    /// `Content-Disposition` is always set to `inline;filename=<relative_path>`.
    #[must_use]
    pub fn from_origin(
        path: impl Into<PathBuf>,
        status: u16,
        headers: &[(String, String)],
        relative_path: &str,
    ) -> Self {
        let mut meta = Self::new(path);
        for (name, value) in headers {
            if is_hop_by_hop(name) {
                continue;
            }
            meta.set_header(name, value);
        }

        if status == 206 {
            let total = meta
                .header("Content-Range")
                .and_then(ByteRange::parse_content_range)
                .map(|range| range.total);
            meta.remove_header("Content-Range");
            match total {
                Some(total) => meta.set_header("Content-Length", &total.to_string()),
                None => meta.remove_header("Content-Length"),
            }
        }

        meta.set_header(
            "Content-Disposition",
            &format!("inline;filename={relative_path}"),
        );
        meta
    }

    /// Load a sidecar from disk.
    pub async fn read(path: PathBuf) -> Result<Self, MetadataError> {
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| MetadataError::from_io(&path, &e))?;
        let text = String::from_utf8(raw).map_err(|e| MetadataError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let created_at = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map_or_else(Utc::now, DateTime::<Utc>::from);

        let mut meta = Self::new(path);
        meta.created_at = created_at;
        for line in text.lines() {
            match line.find(':') {
                Some(index) if index > 1 => {
                    meta.set_header(&line[..index], &line[index + 1..]);
                }
                _ => {}
            }
        }
        Ok(meta)
    }

    /// Persist the headers to the sidecar path.
    ///
    /// Returns only once the sidecar is durable.
    pub async fn write(&self) -> Result<(), MetadataError> {
        let path = self.path.clone();
        let mut body = String::new();
        for (name, value) in &self.headers {
            if name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
                continue;
            }
            body.push_str(name);
            body.push(':');
            body.push_str(value);
            body.push('\n');
        }

        tokio::task::spawn_blocking(move || write_atomic(&path, body.as_bytes()))
            .await
            .map_err(|e| MetadataError::Io {
                path: self.path.clone(),
                message: e.to_string(),
            })?
            .map_err(|e| MetadataError::from_io(&self.path, &e))
    }

    /// Sidecar path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace a header, keeping the stored name's position.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => value.clone_into(existing),
            None => {
                self.headers.insert(name.to_string(), value.to_string());
            }
        }
    }

    /// Remove a header if present.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|n, _| !n.eq_ignore_ascii_case(name));
    }

    /// All headers in stored order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Declared length of the full resource.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.trim().parse().ok()
    }

    /// Raw `ETag` header, if any.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.header("ETag")
    }

    /// The ETag as a lowercase MD5 digest, when it is one.
    ///
    /// Only a 32 hex character value (quotes stripped) is trusted; weak or
    /// opaque ETags return `None` and are never used for validation.
    #[must_use]
    pub fn trusted_md5(&self) -> Option<String> {
        let etag = self.etag()?.trim().trim_matches('"');
        is_md5_hex(etag).then(|| etag.to_ascii_lowercase())
    }

    /// When this metadata was created (or the sidecar last written).
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time spent waiting on the origin.
    #[must_use]
    pub const fn network_time(&self) -> Duration {
        self.network_time
    }

    /// Time spent writing to the staging file.
    #[must_use]
    pub const fn disk_write_time(&self) -> Duration {
        self.disk_write_time
    }

    /// Copy with the given timing counters.
    #[must_use]
    pub fn with_timings(mut self, network_time: Duration, disk_write_time: Duration) -> Self {
        self.network_time = network_time;
        self.disk_write_time = disk_write_time;
        self
    }

    /// Build the client response head for a full or ranged response.
    ///
    /// Stored headers are replayed except the per-response ones, which are
    /// recomputed from `range` and the known length. CORS headers are always
    /// appended.
    #[must_use]
    pub fn response_head(&self, range: Option<ByteRange>) -> ResponseHead {
        let mut headers: Vec<(String, String)> = self
            .headers()
            .filter(|(name, _)| !is_hop_by_hop(name) && !is_per_response(name))
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();

        let status = match (range, self.content_length()) {
            (Some(range), _) => {
                headers.push(("Content-Range".into(), range.to_string()));
                headers.push(("Content-Length".into(), range.len().to_string()));
                206
            }
            (None, Some(length)) => {
                headers.push(("Content-Length".into(), length.to_string()));
                200
            }
            (None, None) => 200,
        };
        if self.content_length().is_some() {
            headers.push(("Accept-Ranges".into(), "bytes".into()));
        }
        for (name, value) in CORS_HEADERS {
            headers.push(((*name).to_string(), (*value).to_string()));
        }

        ResponseHead { status, headers }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_per_response(name: &str) -> bool {
    PER_RESPONSE_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
        || CORS_HEADERS.iter().any(|(h, _)| h.eq_ignore_ascii_case(name))
}

/// Write `data` to `path` through a synced temp file in the same directory.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new().prefix(".meta").tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
