//! Resource handler: every path not claimed by another route.

use axum::extract::State;
use axum::http::header::RANGE;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use tracing::debug;

use sharefetch_download::ShareRequest;

use crate::error::HttpError;
use crate::sink::channel_sink;
use crate::state::AppState;

/// Serve the origin resource at the request's path and query.
///
/// A client that has to retry is redirected back to this same path.
pub async fn fetch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    if method != Method::GET && method != Method::HEAD {
        return Err(HttpError::MethodNotAllowed(method.to_string()));
    }

    let path_and_query = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |pq| pq.as_str());
    let mut request = ShareRequest::new(state.origin_url(path_and_query))
        .with_retry_location(path_and_query);
    if let Some(range) = headers.get(RANGE).and_then(|v| v.to_str().ok()) {
        request = request.with_range(range);
    }

    let (sink, reply) = channel_sink(state.body_buffer);
    match state.downloader.download(request, Box::new(sink)).await {
        Ok(dispatch) => debug!(path = path_and_query, ?dispatch, "Request dispatched"),
        Err(e) => debug!(path = path_and_query, error = %e, "Request rejected"),
    }
    Ok(reply.into_response().await)
}
