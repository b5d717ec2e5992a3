//! Core domain types and port definitions for sharefetch.
//!
//! sharefetch fronts an HTTP origin with a local file cache. When many
//! clients ask for the same remote resource at once, exactly one upstream
//! fetch runs and every other request is streamed from the bytes that fetch
//! is writing to disk.
//!
//! This crate holds everything that does not depend on a runtime transport:
//!
//! - [`key`]: resource identity and on-disk layout
//! - [`range`]: `Range` / `Content-Range` negotiation
//! - [`metadata`]: the header sidecar persisted next to every cached file
//! - [`cache`]: the bounded LRU holding recently used sidecars
//! - [`events`]: observer notifications
//! - [`error`]: the error taxonomy shared by every layer
//! - [`ports`]: traits implemented by adapters (origin client, response sink, listener)
//! - [`settings`]: engine configuration with defaults and validation
//!
//! # Architecture
//!
//! ```text
//! sharefetch-axum ──► sharefetch-download ──► sharefetch-core
//!   (adapters)            (engine)            (domain + ports)
//! ```

pub mod cache;
pub mod error;
pub mod events;
pub mod hash;
pub mod key;
pub mod metadata;
pub mod ports;
pub mod range;
pub mod settings;

pub use cache::{LruCache, MetadataCache};
pub use error::{ShareError, ShareResult};
pub use events::{ResourceRef, ShareEvent, ShareEventKind};
pub use key::{KeyError, ResourceKey, StorePaths};
pub use metadata::{FileMetadata, MetadataError};
pub use ports::{
    NoopListener, OriginBody, OriginError, OriginFetcher, OriginResponse, ResponseHead,
    ResponseSink, ShareEventListener,
};
pub use range::ByteRange;
pub use settings::{SettingsError, ShareSettings};
