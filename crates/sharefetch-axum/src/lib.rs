//! Axum HTTP front end for the sharefetch download engine.
//!
//! This crate holds the concrete adapters for the engine's ports and the
//! composition root that wires them together:
//!
//! - [`origin`]: reqwest [`OriginFetcher`](sharefetch_core::OriginFetcher)
//! - [`sink`]: channel-backed [`ResponseSink`](sharefetch_core::ResponseSink) for axum bodies
//! - [`listener`]: tracing [`ShareEventListener`](sharefetch_core::ShareEventListener)
//! - [`routes`] and [`handlers`]: the HTTP surface
//! - [`bootstrap`]: configuration and server startup
//!
//! # Architecture
//!
//! ```text
//! client ──► axum router ──► handlers::share ──► ShareDownloader
//!                                   ▲                  │
//!                                   └── SinkReply ◄── ChannelSink
//! ```

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod cli;
pub mod error;
pub mod handlers;
pub mod listener;
pub mod origin;
pub mod routes;
pub mod sink;
pub mod state;

pub use bootstrap::{AxumContext, ServerConfig, bootstrap, start_server};
pub use cli::Cli;
pub use error::HttpError;
pub use listener::TracingEventListener;
pub use origin::ReqwestOrigin;
pub use routes::create_router;
pub use sink::{ChannelSink, SinkReply, channel_sink};
pub use state::AppState;
