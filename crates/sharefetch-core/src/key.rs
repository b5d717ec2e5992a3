//! Resource identity and on-disk layout.
//!
//! A [`ResourceKey`] is the canonical form of an origin URL. Two requests for
//! the same key share a single upstream fetch. The key also determines where
//! the resource lives under the store root:
//!
//! ```text
//! {root}/{host}[_{port}]{path}          final file
//! {root}/{host}[_{port}]{path}.meta     header sidecar
//! {root}/{host}[_{port}]{path}.part     staging file while downloading
//! ```
//!
//! The scheme is not part of the layout, so `http` and `https` URLs for the
//! same host and path share one set of files.
//!
//! A query string does not become part of the path. Instead the MD5 of the
//! query is spliced in before the extension (`a/b.bin?x=1` becomes
//! `a/b_<md5>.bin`) and the key is flagged as parameterized, which disables
//! ETag validation for that variant.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

use crate::hash::md5_hex;

/// Suffix appended to the final path for the header sidecar.
pub const SIDECAR_SUFFIX: &str = ".meta";

/// Suffix appended to the final path for the staging file.
pub const STAGING_SUFFIX: &str = ".part";

/// Errors raised while deriving a key from a URL.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The URL could not be parsed.
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// Only http and https origins can be fetched.
    #[error("Unsupported scheme '{scheme}' in '{url}'")]
    UnsupportedScheme { url: String, scheme: String },

    /// The URL has no host to fetch from.
    #[error("URL '{0}' has no host")]
    MissingHost(String),
}

/// Canonical identifier of an origin resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    url: Url,
    relative_path: String,
    parameterized: bool,
}

impl ResourceKey {
    /// Parse and normalise an origin URL.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let mut url = Url::parse(raw.trim()).map_err(|e| KeyError::InvalidUrl {
            url: raw.to_string(),
            message: e.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(KeyError::UnsupportedScheme {
                    url: raw.to_string(),
                    scheme: scheme.to_string(),
                });
            }
        }
        let host = url
            .host_str()
            .ok_or_else(|| KeyError::MissingHost(raw.to_string()))?
            .to_string();

        url.set_fragment(None);
        let query = url.query().filter(|q| !q.is_empty()).map(str::to_string);
        if query.is_none() {
            url.set_query(None);
        }

        let mut host_dir = host.replace(':', "_");
        if let Some(port) = url.port() {
            host_dir = format!("{host_dir}_{port}");
        }

        let mut path = url.path().to_string();
        if path.ends_with('/') {
            path.push_str("index");
        }
        if let Some(query) = &query {
            path = splice_suffix(&path, &md5_hex(query));
        }

        Ok(Self {
            relative_path: format!("/{host_dir}{path}"),
            parameterized: query.is_some(),
            url,
        })
    }

    /// The normalised origin URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The normalised origin URL as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Path of the resource below the store root, always starting with `/`.
    #[must_use]
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Whether the URL carried a query string.
    ///
    /// Parameterized variants are generated by the origin per request, so
    /// their ETag is never trusted as a content digest.
    #[must_use]
    pub const fn is_parameterized(&self) -> bool {
        self.parameterized
    }

    /// Final extension of the relative path, without the dot.
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        let name = self.relative_path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext)
    }

    /// Whether the key's extension is one of `extensions` (case-insensitive).
    #[must_use]
    pub fn has_extension_in(&self, extensions: &[String]) -> bool {
        self.extension()
            .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    /// Resolve the on-disk paths for this key below `root`.
    #[must_use]
    pub fn paths(&self, root: &Path) -> StorePaths {
        StorePaths::new(root.join(self.relative_path.trim_start_matches('/')))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Insert `_{suffix}` before the extension of the last path segment.
fn splice_suffix(path: &str, suffix: &str) -> String {
    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = name_start + dot;
            format!("{}_{suffix}{}", &path[..dot], &path[dot..])
        }
        _ => format!("{path}_{suffix}"),
    }
}

/// Files backing one cached resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    /// Committed file served to later requests.
    pub file: PathBuf,
    /// Header sidecar (`file` + `.meta`).
    pub sidecar: PathBuf,
    /// Staging file written while downloading (`file` + `.part`).
    pub staging: PathBuf,
}

impl StorePaths {
    /// Derive sidecar and staging paths from the final file path.
    #[must_use]
    pub fn new(file: PathBuf) -> Self {
        Self {
            sidecar: with_suffix(&file, SIDECAR_SUFFIX),
            staging: with_suffix(&file, STAGING_SUFFIX),
            file,
        }
    }

    /// Create the parent directory of the final file.
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}
