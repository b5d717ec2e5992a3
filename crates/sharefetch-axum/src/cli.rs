//! Command-line arguments for the `sharefetch` binary.
//!
//! Every flag falls back to a `SHAREFETCH_*` environment variable, so the
//! server can be configured entirely from a `.env` file.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use sharefetch_core::ShareSettings;

use crate::bootstrap::ServerConfig;
use crate::sink::DEFAULT_BODY_BUFFER;

/// Caching HTTP front end that coalesces concurrent downloads.
#[derive(Debug, Parser)]
#[command(name = "sharefetch", version, about)]
pub struct Cli {
    /// Origin base URL every request path is resolved against.
    #[arg(long, env = "SHAREFETCH_ORIGIN")]
    pub origin: String,

    /// Directory holding cached files, sidecars and staging files.
    #[arg(long, env = "SHAREFETCH_STORE", default_value = "./store")]
    pub store: PathBuf,

    /// Address to listen on.
    #[arg(long, env = "SHAREFETCH_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Bytes copied per follower chunk.
    #[arg(long, env = "SHAREFETCH_CHUNK_SIZE")]
    pub chunk_size: Option<usize>,

    /// Seconds a client may sit idle before it is dropped.
    #[arg(long, env = "SHAREFETCH_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Number of sidecars kept in memory.
    #[arg(long, env = "SHAREFETCH_CACHE_CAPACITY")]
    pub cache_capacity: Option<usize>,

    /// Copy passes allowed to run at once.
    #[arg(long, env = "SHAREFETCH_MAX_COPIES")]
    pub max_copies: Option<usize>,

    /// Extensions answered with a redirect while downloading in the background.
    #[arg(long, env = "SHAREFETCH_BACKGROUND_EXTENSIONS", value_delimiter = ',')]
    pub background_extensions: Option<Vec<String>>,

    /// Serve committed files by redirecting to this base URL.
    #[arg(long, env = "SHAREFETCH_LOCAL_REDIRECT")]
    pub local_redirect: Option<String>,

    /// Body chunks buffered per response.
    #[arg(long, env = "SHAREFETCH_BODY_BUFFER", default_value_t = DEFAULT_BODY_BUFFER)]
    pub body_buffer: usize,
}

impl Cli {
    /// Engine settings, starting from defaults and applying each given flag.
    pub fn settings(&self) -> ShareSettings {
        let mut settings = ShareSettings::for_store(&self.store);
        if let Some(size) = self.chunk_size {
            settings.copy_chunk_size = size;
        }
        if let Some(secs) = self.idle_timeout {
            settings.follower_idle_timeout_secs = secs;
        }
        if let Some(capacity) = self.cache_capacity {
            settings.metadata_cache_capacity = capacity;
        }
        if let Some(copies) = self.max_copies {
            settings.max_concurrent_copies = copies;
        }
        if let Some(extensions) = &self.background_extensions {
            settings.background_extensions = extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_string())
                .filter(|ext| !ext.is_empty())
                .collect();
        }
        settings.local_redirect_base.clone_from(&self.local_redirect);
        settings
    }

    /// Full server configuration.
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            settings: self.settings(),
            bind: self.bind,
            body_buffer: self.body_buffer,
            origin_base: self.origin,
        }
    }
}
