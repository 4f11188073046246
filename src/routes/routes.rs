//! Routing for the edge.
//!
//! There are no per-path routes: the resource key is the whole request path,
//! so every request, whatever its method or path, lands in `serve_content`.
//! Method gating happens inside the handler so that rejected verbs still get
//! the JSON error body and CORS headers.

use crate::handlers::content_handlers::{AppState, serve_content};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the router. The caller supplies `AppState` with `with_state`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .fallback(serve_content)
        .layer(TraceLayer::new_for_http())
}
