//! Server bootstrap - the composition root.
//!
//! This module is the ONLY place where the engine is wired to its concrete
//! adapters: the reqwest origin client and the tracing event listener.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use sharefetch_core::{OriginFetcher, ShareEventListener, ShareSettings};
use sharefetch_download::ShareDownloader;

use crate::listener::TracingEventListener;
use crate::origin::ReqwestOrigin;
use crate::routes::create_router;
use crate::sink::DEFAULT_BODY_BUFFER;

/// Server configuration for the Axum adapter.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub bind: SocketAddr,
    /// Origin every request path is resolved against.
    pub origin_base: String,
    /// Body chunks buffered per response.
    pub body_buffer: usize,
    /// Engine settings.
    pub settings: ShareSettings,
}

impl ServerConfig {
    /// Config with default settings for `origin_base`.
    pub fn new(origin_base: impl Into<String>) -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            origin_base: origin_base.into(),
            body_buffer: DEFAULT_BODY_BUFFER,
            settings: ShareSettings::default(),
        }
    }
}

/// Application context for the Axum adapter.
pub struct AxumContext {
    /// The download engine.
    pub downloader: ShareDownloader,
    /// Origin base without a trailing slash.
    pub origin_base: String,
    /// Body chunks buffered per response.
    pub body_buffer: usize,
}

impl AxumContext {
    /// Wrap an already built engine.
    pub fn new(downloader: ShareDownloader, origin_base: &str, body_buffer: usize) -> Self {
        Self {
            downloader,
            origin_base: origin_base.trim_end_matches('/').to_string(),
            body_buffer,
        }
    }

    /// Origin URL for an incoming request path and query.
    pub fn origin_url(&self, path_and_query: &str) -> String {
        format!("{}{path_and_query}", self.origin_base)
    }
}

fn check_origin_base(origin_base: &str) -> Result<()> {
    let url = Url::parse(origin_base).with_context(|| format!("invalid origin {origin_base}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("origin must be http or https, got {}", url.scheme());
    }
    if url.query().is_some() {
        bail!("origin must not carry a query string");
    }
    Ok(())
}

/// Build the engine and its adapters. Must run inside a tokio runtime.
pub fn bootstrap(config: &ServerConfig) -> Result<AxumContext> {
    check_origin_base(&config.origin_base)?;

    let fetcher: Arc<dyn OriginFetcher> =
        Arc::new(ReqwestOrigin::new().context("failed to build origin client")?);
    let listener: Arc<dyn ShareEventListener> = Arc::new(TracingEventListener::new());
    let downloader = ShareDownloader::new(config.settings.clone(), fetcher, listener)?;

    info!(
        origin = %config.origin_base,
        store_root = %config.settings.store_root.display(),
        "Bootstrap complete"
    );
    Ok(AxumContext::new(
        downloader,
        &config.origin_base,
        config.body_buffer,
    ))
}

/// Run the server until `shutdown` is cancelled, then drain the engine.
pub async fn start_server(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let ctx = Arc::new(bootstrap(&config)?);
    let app = create_router(Arc::clone(&ctx));

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("sharefetch listening on http://{}", listener.local_addr()?);

    // Cancelling the engine ends in-flight transfers, which lets graceful shutdown finish
    let serve = async {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await;
        shutdown.cancel();
        result
    };
    let drain = async {
        shutdown.cancelled().await;
        ctx.downloader.shutdown().await;
    };
    let (served, ()) = tokio::join!(serve, drain);
    served?;

    info!("sharefetch stopped");
    Ok(())
}
