//! The share downloader service object.
//!
//! [`ShareDownloader`] is the entry point adapters talk to. It owns the
//! leader pool, the metadata cache, the event dispatcher and the task
//! tracker every leader and follower runs on. Construct it once at the
//! composition root and call [`ShareDownloader::shutdown`] before exit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

use sharefetch_core::{
    FileMetadata, MetadataCache, OriginFetcher, ResourceKey, ResponseSink, SettingsError,
    ShareError, ShareEventListener, ShareResult, ShareSettings, StorePaths,
};

use crate::context::EngineContext;
use crate::dispatch::EventDispatcher;
use crate::follower::Follower;
use crate::leader::{FollowerLink, Leader, LeaderPhase, run_session};
use crate::local::{self, LocalRequest};
use crate::pool::LeaderPool;
use crate::staging;

/// One client request for an origin resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRequest {
    /// Origin URL.
    pub url: String,
    /// Raw client `Range` header.
    pub range: Option<String>,
    /// Where to send the client when the leader fails before any byte
    /// reached it. Usually the client's own request URL.
    pub retry_location: String,
}

impl ShareRequest {
    /// A request that retries against the origin URL itself.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            retry_location: url.clone(),
            url,
            range: None,
        }
    }

    /// Set the client `Range` header.
    #[must_use]
    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    /// Set the retry location.
    #[must_use]
    pub fn with_retry_location(mut self, location: impl Into<String>) -> Self {
        self.retry_location = location.into();
        self
    }
}

/// How a request was routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Dispatch {
    /// Served from the committed file.
    Local,
    /// Redirected (background media download).
    Redirected { location: String },
    /// Started a new leader session and follows it.
    Leader { session: Uuid },
    /// Attached to an existing leader session.
    Follower { session: Uuid },
}

/// Status of one active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub uri: String,
    pub relative_path: String,
    pub phase: LeaderPhase,
    pub published: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    pub followers: usize,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ShareError>,
    pub started_at: DateTime<Utc>,
}

impl SessionSnapshot {
    fn of(leader: &Leader) -> Self {
        Self {
            id: leader.id(),
            uri: leader.key().as_str().to_string(),
            relative_path: leader.key().relative_path().to_string(),
            phase: leader.phase(),
            published: leader.published(),
            content_length: leader.metadata().and_then(|m| m.content_length()),
            followers: leader.follower_count(),
            retries: leader.retries(),
            last_error: leader.last_error(),
            started_at: leader.started_at(),
        }
    }
}

/// Status of the whole service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub sessions: Vec<SessionSnapshot>,
    pub metadata_cached: usize,
    pub metadata_capacity: usize,
}

/// Download coalescing service.
#[derive(Clone)]
pub struct ShareDownloader {
    ctx: Arc<EngineContext>,
}

impl ShareDownloader {
    /// Build the service. Must be called from within a tokio runtime.
    pub fn new(
        settings: ShareSettings,
        fetcher: Arc<dyn OriginFetcher>,
        listener: Arc<dyn ShareEventListener>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        info!(
            store_root = %settings.store_root.display(),
            max_concurrent_copies = settings.max_concurrent_copies,
            metadata_cache_capacity = settings.metadata_cache_capacity,
            "Share downloader ready"
        );

        let ctx = EngineContext {
            fetcher,
            events: EventDispatcher::spawn(listener),
            metadata: MetadataCache::new(settings.metadata_cache_capacity),
            pool: LeaderPool::new(),
            copy_permits: Semaphore::new(settings.max_concurrent_copies),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            settings,
        };
        Ok(Self { ctx: Arc::new(ctx) })
    }

    /// Route one client request.
    ///
    /// The sink is always consumed: it is answered right away (redirect,
    /// error) or handed to a task that streams into it. Errors are returned
    /// only for requests rejected up front.
    pub async fn download(
        &self,
        request: ShareRequest,
        mut sink: Box<dyn ResponseSink>,
    ) -> ShareResult<Dispatch> {
        let ctx = &self.ctx;
        if ctx.cancel.is_cancelled() {
            sink.send_error(503, "service is shutting down").await;
            return Err(ShareError::Cancelled);
        }

        let key = match ResourceKey::parse(&request.url) {
            Ok(key) => key,
            Err(e) => {
                sink.send_error(400, &e.to_string()).await;
                return Err(e.into());
            }
        };
        let paths = key.paths(&ctx.settings.store_root);

        loop {
            if staging::is_file(&paths.file).await {
                let local = LocalRequest {
                    key,
                    paths,
                    range_header: request.range,
                };
                ctx.tracker.spawn(local::serve(Arc::clone(ctx), local, sink));
                return Ok(Dispatch::Local);
            }

            if key.has_extension_in(&ctx.settings.background_extensions) {
                self.start_background(&key, &paths);
                let location = key.as_str().to_string();
                sink.redirect(&location).await;
                return Ok(Dispatch::Redirected { location });
            }

            let candidate = Leader::new(key.clone(), paths.clone());
            let (leader, is_new) = match ctx.pool.acquire(&candidate) {
                None => (candidate, true),
                Some(existing) => (existing, false),
            };

            let link = FollowerLink::new();
            if let Err(e) = leader.attach(&link) {
                // Wound down between lookup and attach; the file may now exist
                debug!(uri = %key, error = %e, "Requeueing request");
                continue;
            }

            let session = leader.id();
            if is_new {
                ctx.tracker
                    .spawn(run_session(Arc::clone(&leader), Arc::clone(ctx)));
            } else {
                debug!(session = %session, uri = %key, "Joining active download");
            }
            let follower = Follower::new(
                link,
                leader,
                Arc::clone(ctx),
                sink,
                request.range,
                request.retry_location,
            );
            ctx.tracker.spawn(follower.run());

            return Ok(if is_new {
                Dispatch::Leader { session }
            } else {
                Dispatch::Follower { session }
            });
        }
    }

    /// Start a detached leader for `key` unless one is already running.
    fn start_background(&self, key: &ResourceKey, paths: &StorePaths) {
        let candidate = Leader::new(key.clone(), paths.clone());
        if self.ctx.pool.acquire(&candidate).is_none() {
            info!(uri = %key, "Starting background download");
            self.ctx
                .tracker
                .spawn(run_session(candidate, Arc::clone(&self.ctx)));
        }
    }

    /// Whether a leader is active for `url`.
    pub fn is_downloading(&self, url: &str) -> bool {
        ResourceKey::parse(url).is_ok_and(|key| {
            let paths = key.paths(&self.ctx.settings.store_root);
            self.ctx.pool.get(&paths.file).is_some()
        })
    }

    /// Sidecar metadata of a committed resource.
    pub async fn metadata(&self, url: &str) -> ShareResult<Option<Arc<FileMetadata>>> {
        let key = ResourceKey::parse(url)?;
        let paths = key.paths(&self.ctx.settings.store_root);
        Ok(self.ctx.metadata.get(&paths.sidecar).await)
    }

    /// Active sessions and cache occupancy.
    pub fn snapshot(&self) -> ServiceSnapshot {
        let mut sessions: Vec<_> = self
            .ctx
            .pool
            .leaders()
            .iter()
            .map(|leader| SessionSnapshot::of(leader))
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        ServiceSnapshot {
            sessions,
            metadata_cached: self.ctx.metadata.len(),
            metadata_capacity: self.ctx.metadata.capacity(),
        }
    }

    /// Engine settings.
    pub fn settings(&self) -> &ShareSettings {
        &self.ctx.settings
    }

    /// Cancel running leaders, wait for every task, then flush events.
    pub async fn shutdown(&self) {
        info!(active = self.ctx.pool.len(), "Shutting down share downloader");
        self.ctx.cancel.cancel();
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;
        self.ctx.events.shutdown().await;
        info!("Share downloader stopped");
    }
}
