//! Dependencies shared by every leader and follower task.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use sharefetch_core::{MetadataCache, OriginFetcher, ShareSettings};

use crate::dispatch::EventDispatcher;
use crate::pool::LeaderPool;

/// Cloned into every task as an `Arc`; tasks never reach back into the
/// service object.
pub(crate) struct EngineContext {
    pub settings: ShareSettings,
    pub fetcher: Arc<dyn OriginFetcher>,
    pub events: EventDispatcher,
    pub metadata: MetadataCache,
    pub pool: LeaderPool,
    /// Bounds follower and local-serving copies across the service.
    pub copy_permits: Semaphore,
    pub tracker: TaskTracker,
    pub cancel: CancellationToken,
}
