//! Per-request logging and metrics middleware.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::metrics::RequestLabels;
use crate::proxy::AppState;

/// Record method/path/status/latency for every request at debug level and
/// feed the request counters.
pub async fn log_requests(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    debug!(%method, path = %path, status, duration = ?elapsed, "request");

    let metrics = &state.metrics.metrics;
    metrics
        .requests_total
        .get_or_create(&RequestLabels {
            method: method.to_string(),
            status: u32::from(status),
        })
        .inc();
    metrics.request_duration_seconds.observe(elapsed.as_secs_f64());

    response
}
