//! The leader of one download session.
//!
//! A [`Leader`] is shared (`Arc`) between the session task that drives the
//! origin fetch, the [`LeaderPool`], and every attached follower. Followers
//! only ever read from it: the published position, the session metadata and
//! their own directive slot.
//!
//! # Synchronization
//!
//! - `published` is stored with `Release` after the staging write is flushed
//!   and loaded with `Acquire` by followers.
//! - The follower queue, the completion flag and the phase live under one
//!   `parking_lot::Mutex` that is never held across an `.await`.
//! - Attach and wind-down both take that lock, so a follower is either
//!   drained by wind-down or refused and sent back to the entry path.

mod session;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use sharefetch_core::{FileMetadata, ResourceKey, ShareError, StorePaths};

use crate::pool::LeaderPool;
use crate::staging;

pub(crate) use session::run_session;

/// Where a leader is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderPhase {
    /// Waiting for the origin to answer.
    Fetching,
    /// Appending the origin body to the staging file.
    Streaming,
    /// An attempt failed after progress; about to resume.
    Retrying,
    /// Checking the staging file against the ETag digest.
    Validating,
    /// The final file is in place.
    Committed,
    /// Gave up.
    Failed,
}

/// Returned by attach when the leader already wound down.
#[derive(Debug, Error)]
#[error("leader {0} already completed")]
pub struct LeaderCompleted(pub Uuid);

/// What a follower must do once it has caught up.
#[derive(Debug, Clone)]
pub(crate) enum Directive {
    /// The file is complete; finish after copying everything published.
    Finish,
    /// The leader failed; stop now.
    Terminate(ShareError),
}

/// Leader-side handle on one attached follower.
pub(crate) struct FollowerLink {
    id: Uuid,
    wake: Notify,
    directive: Mutex<Option<Directive>>,
}

impl FollowerLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            wake: Notify::new(),
            directive: Mutex::new(None),
        })
    }

    pub(crate) const fn id(&self) -> Uuid {
        self.id
    }

    /// Schedule a copy pass. Wakes while a pass is running coalesce into one.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    /// Wait for the next wake.
    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    pub(crate) fn directive(&self) -> Option<Directive> {
        self.directive.lock().clone()
    }

    fn direct(&self, directive: Directive) {
        *self.directive.lock() = Some(directive);
        self.wake();
    }
}

struct LeaderState {
    phase: LeaderPhase,
    completed: bool,
    followers: VecDeque<Arc<FollowerLink>>,
    retries: u32,
    last_error: Option<ShareError>,
}

/// One active download session for a resource key.
pub struct Leader {
    id: Uuid,
    key: ResourceKey,
    paths: StorePaths,
    started_at: DateTime<Utc>,
    published: AtomicU64,
    metadata: OnceLock<Arc<FileMetadata>>,
    state: Mutex<LeaderState>,
    /// Live references to the staging file: the leader plus each attached follower.
    staging_refs: AtomicUsize,
    succeeded: AtomicBool,
}

impl Leader {
    /// Create a leader candidate for `key`.
    pub fn new(key: ResourceKey, paths: StorePaths) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            key,
            paths,
            started_at: Utc::now(),
            published: AtomicU64::new(0),
            metadata: OnceLock::new(),
            state: Mutex::new(LeaderState {
                phase: LeaderPhase::Fetching,
                completed: false,
                followers: VecDeque::new(),
                retries: 0,
                last_error: None,
            }),
            staging_refs: AtomicUsize::new(1),
            succeeded: AtomicBool::new(false),
        })
    }

    /// Session identity.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Resource being downloaded.
    pub const fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Files backing the resource.
    pub const fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// When the session was created.
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Bytes confirmed on disk in the staging file.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Session metadata, once the first origin response was accepted.
    pub fn metadata(&self) -> Option<Arc<FileMetadata>> {
        self.metadata.get().cloned()
    }

    /// Current phase.
    pub fn phase(&self) -> LeaderPhase {
        self.state.lock().phase
    }

    /// Number of followers still attached.
    pub fn follower_count(&self) -> usize {
        self.state.lock().followers.len()
    }

    /// Whether wind-down has run.
    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Number of times the session resumed after an interrupted transfer.
    pub fn retries(&self) -> u32 {
        self.state.lock().retries
    }

    /// The failure that triggered the most recent resume.
    pub fn last_error(&self) -> Option<ShareError> {
        self.state.lock().last_error.clone()
    }

    /// Enter `Retrying` after `error` interrupted an attempt.
    pub(crate) fn record_retry(&self, error: ShareError) {
        let mut state = self.state.lock();
        state.phase = LeaderPhase::Retrying;
        state.retries += 1;
        state.last_error = Some(error);
    }

    pub(crate) fn set_phase(&self, phase: LeaderPhase) {
        let mut state = self.state.lock();
        if state.phase != phase {
            debug!(session = %self.id, from = ?state.phase, to = ?phase, "Leader phase change");
            state.phase = phase;
        }
    }

    /// Store the session metadata. Returns the stored value and whether this
    /// call installed it.
    pub(crate) fn install_metadata(&self, metadata: FileMetadata) -> (Arc<FileMetadata>, bool) {
        if let Some(existing) = self.metadata.get() {
            return (Arc::clone(existing), false);
        }
        let metadata = Arc::new(metadata);
        let installed = self.metadata.set(Arc::clone(&metadata)).is_ok();
        (metadata, installed)
    }

    /// Advance the published position and wake every follower.
    ///
    /// Callers must have flushed the bytes up to `position` first.
    pub(crate) fn publish(&self, position: u64) {
        self.published.fetch_max(position, Ordering::Release);
        self.wake_followers();
    }

    fn wake_followers(&self) {
        for link in &self.state.lock().followers {
            link.wake();
        }
    }

    /// Attach a follower, taking a staging reference for it.
    pub(crate) fn attach(&self, link: &Arc<FollowerLink>) -> Result<(), LeaderCompleted> {
        let mut state = self.state.lock();
        if state.completed {
            return Err(LeaderCompleted(self.id));
        }
        self.staging_refs.fetch_add(1, Ordering::AcqRel);
        state.followers.push_back(Arc::clone(link));
        link.wake();
        Ok(())
    }

    /// Forget a follower that aborted. Its staging reference is released separately.
    pub(crate) fn detach(&self, id: Uuid) {
        self.state.lock().followers.retain(|link| link.id() != id);
    }

    /// Conclude the session exactly once.
    ///
    /// Marks the leader completed, removes it from the pool and drains the
    /// follower queue under the session lock, then directs each drained
    /// follower to finish or terminate.
    pub(crate) fn wind_down(self: &Arc<Self>, pool: &LeaderPool, failure: Option<&ShareError>) {
        let followers = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            self.succeeded.store(failure.is_none(), Ordering::Release);
            state.phase = if failure.is_some() {
                LeaderPhase::Failed
            } else {
                LeaderPhase::Committed
            };
            pool.release(self);
            std::mem::take(&mut state.followers)
        };

        let directive = failure.map_or(Directive::Finish, |e| Directive::Terminate(e.clone()));
        debug!(
            session = %self.id,
            followers = followers.len(),
            directive = ?directive,
            "Draining followers"
        );
        for link in followers {
            link.direct(directive.clone());
        }
    }

    /// Drop one staging reference. The last reference after a successful
    /// session deletes the staging file.
    pub(crate) async fn release_staging(&self) {
        if self.staging_refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if self.succeeded.load(Ordering::Acquire) {
            staging::remove_quietly(&self.paths.staging).await;
        } else {
            debug!(
                session = %self.id,
                staging = %self.paths.staging.display(),
                "Keeping staging file for resume"
            );
        }
    }

    /// Remaining staging references (leader plus live followers).
    pub(crate) fn staging_refs(&self) -> usize {
        self.staging_refs.load(Ordering::Acquire)
    }
}
