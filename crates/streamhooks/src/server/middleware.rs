//! Axum middleware layers applied to the merged router.
//!
//! Includes request tracing, timeout enforcement, and response compression.

use std::time::Duration;

use axum::Router;
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};

/// Default per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wrap `router` in the tracing, timeout, and compression layers.
pub fn apply(router: Router) -> Router {
    router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
}
