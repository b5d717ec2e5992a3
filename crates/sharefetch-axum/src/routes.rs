//! Route definitions and router construction.
//!
//! Two fixed routes serve the adapter itself; every other path is a
//! resource on the origin and goes to the share handler.

use axum::Router;
use axum::http::HeaderValue;
use axum::http::header::{ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN};
use axum::routing::get;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Path of the JSON status endpoint.
pub const STATUS_PATH: &str = "/_sharefetch/status";

/// Build the router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::status::health))
        .route(STATUS_PATH, get(handlers::status::status))
        .fallback(handlers::share::fetch)
        .layer(SetResponseHeaderLayer::if_not_present(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, GET, HEAD"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
