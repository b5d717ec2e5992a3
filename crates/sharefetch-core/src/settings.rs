//! Engine settings and validation.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::MetadataCache;

/// Default chunk size for follower copies.
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Default idle timeout for a waiting follower, in seconds.
pub const DEFAULT_FOLLOWER_IDLE_TIMEOUT_SECS: u64 = 5 * 60;

/// Default extensions that are fetched in the background while the client
/// is redirected to the origin.
pub const DEFAULT_BACKGROUND_EXTENSIONS: &[&str] = &["mp4", "cwp"];

/// Largest accepted copy chunk.
const MAX_COPY_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Settings validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("store_root must not be empty")]
    EmptyStoreRoot,

    #[error("copy_chunk_size must be between 1 and {MAX_COPY_CHUNK_SIZE}, got {0}")]
    InvalidChunkSize(usize),

    #[error("follower_idle_timeout_secs must be greater than zero")]
    InvalidIdleTimeout,

    #[error("metadata_cache_capacity must be greater than zero")]
    InvalidCacheCapacity,

    #[error("max_concurrent_copies must be greater than zero")]
    InvalidCopyConcurrency,

    #[error("local_redirect_base must be an absolute http(s) URL, got '{0}'")]
    InvalidRedirectBase(String),
}

/// Download engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShareSettings {
    /// Directory holding committed files, sidecars and staging files.
    pub store_root: PathBuf,

    /// Bytes copied from the staging file per follower read.
    pub copy_chunk_size: usize,

    /// Seconds a follower may go without progress before the transport
    /// is allowed to expire it.
    pub follower_idle_timeout_secs: u64,

    /// Number of sidecars kept in memory.
    pub metadata_cache_capacity: usize,

    /// Follower copy passes allowed to run at once across the service.
    pub max_concurrent_copies: usize,

    /// Extensions served by redirecting to the origin while a background
    /// download fills the cache (case-insensitive, no dot).
    pub background_extensions: Vec<String>,

    /// When set, committed files are served by redirecting to
    /// `local_redirect_base + relative_path` instead of streaming them.
    pub local_redirect_base: Option<String>,
}

impl Default for ShareSettings {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ShareSettings {
    /// Create settings with sensible defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            store_root: PathBuf::from("./store"),
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
            follower_idle_timeout_secs: DEFAULT_FOLLOWER_IDLE_TIMEOUT_SECS,
            metadata_cache_capacity: MetadataCache::DEFAULT_CAPACITY,
            max_concurrent_copies: default_copy_concurrency(),
            background_extensions: DEFAULT_BACKGROUND_EXTENSIONS
                .iter()
                .map(ToString::to_string)
                .collect(),
            local_redirect_base: None,
        }
    }

    /// Defaults rooted at `store_root`.
    #[must_use]
    pub fn for_store(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            ..Self::with_defaults()
        }
    }

    /// Follower idle timeout as a `Duration`.
    #[must_use]
    pub const fn follower_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.follower_idle_timeout_secs)
    }

    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.store_root.as_os_str().is_empty() {
            return Err(SettingsError::EmptyStoreRoot);
        }
        if self.copy_chunk_size == 0 || self.copy_chunk_size > MAX_COPY_CHUNK_SIZE {
            return Err(SettingsError::InvalidChunkSize(self.copy_chunk_size));
        }
        if self.follower_idle_timeout_secs == 0 {
            return Err(SettingsError::InvalidIdleTimeout);
        }
        if self.metadata_cache_capacity == 0 {
            return Err(SettingsError::InvalidCacheCapacity);
        }
        if self.max_concurrent_copies == 0 {
            return Err(SettingsError::InvalidCopyConcurrency);
        }
        if let Some(base) = &self.local_redirect_base {
            let valid = url::Url::parse(base)
                .is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.has_host());
            if !valid {
                return Err(SettingsError::InvalidRedirectBase(base.clone()));
            }
        }
        Ok(())
    }
}

/// Twice the available parallelism, matching a fixed transfer pool sized
/// for mostly I/O-bound copies.
fn default_copy_concurrency() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get() * 2)
}
