//! Port definitions (trait abstractions) for external systems.
//!
//! Ports define the interfaces that the download engine expects from its
//! environment. They contain no transport details and use only domain types.
//!
//! # Design Rules
//!
//! - No `reqwest`/`axum` types in any signature
//! - Bodies are pulled chunk by chunk, never buffered whole
//! - Listener callbacks are synchronous and must not block

pub mod event_listener;
pub mod origin;
pub mod response_sink;

pub use event_listener::{NoopListener, ShareEventListener};
pub use origin::{OriginBody, OriginError, OriginFetcher, OriginResponse};
pub use response_sink::{CORS_HEADERS, ResponseHead, ResponseSink};
