//! Download coalescing engine for sharefetch.
//!
//! The first request for a resource becomes its *leader*: it fetches from the
//! origin into a staging file and publishes how many bytes are on disk. Every
//! concurrent request for the same resource becomes a *follower* that tails
//! the staging file up to the published position and is woken whenever the
//! leader appends.
//!
//! # Architecture
//!
//! ```text
//! ShareDownloader::download
//!   ├─ final file exists ──────────► local serving
//!   ├─ background extension ───────► redirect to origin + detached leader
//!   └─ LeaderPool::acquire
//!        ├─ no leader: spawn Leader session, attach caller as follower
//!        └─ leader exists: attach caller as follower (requeue if it completed)
//!
//! Leader session:  Fetching → Streaming → (Retrying → Fetching)* → Validating → Committed
//!                                                                  └──────────► Failed
//! Wind-down: mark completed, leave pool, drain followers with Finish / Terminate
//! ```
//!
//! A failed leader keeps its staging file, so the next leader for the same
//! resource resumes from the last byte on disk.

mod context;
mod dispatch;
mod follower;
mod leader;
mod local;
mod pool;
mod service;
mod staging;

pub use dispatch::EventDispatcher;
pub use leader::{Leader, LeaderCompleted, LeaderPhase};
pub use pool::LeaderPool;
pub use service::{Dispatch, ServiceSnapshot, SessionSnapshot, ShareDownloader, ShareRequest};
