//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "vod_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "vod_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "vod_http_requests_in_flight";

    // Delivery metrics
    pub const STREAM_CACHE_LOOKUPS_TOTAL: &str = "vod_stream_cache_lookups_total";

    // Ingest metrics
    pub const UPLOADS_TOTAL: &str = "vod_uploads_total";
    pub const UPLOAD_BYTES_TOTAL: &str = "vod_upload_bytes_total";
    pub const RUNS_ENQUEUED_TOTAL: &str = "vod_runs_enqueued_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a stream cache lookup: `hit`, `miss` or `error`.
pub fn record_cache_lookup(outcome: &'static str) {
    counter!(names::STREAM_CACHE_LOOKUPS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an accepted upload.
pub fn record_upload(bytes: u64) {
    counter!(names::UPLOADS_TOTAL).increment(1);
    counter!(names::UPLOAD_BYTES_TOTAL).increment(bytes);
}

/// Record a run submission: `enqueued` or `duplicate`.
pub fn record_run_enqueued(outcome: &'static str) {
    counter!(names::RUNS_ENQUEUED_TOTAL, "outcome" => outcome).increment(1);
}

/// Collapse ids and file names so label cardinality stays bounded.
fn sanitize_path(path: &str) -> String {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        ["videos", _] => "/videos/:video_id".to_string(),
        ["videos", _, "runs"] => "/videos/:video_id/runs".to_string(),
        ["videos", _, _, _] => "/videos/:video_id/:format/:filename".to_string(),
        _ => path.to_string(),
    }
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(
            sanitize_path("/videos/abc123/hls/abc123_v0_001.ts"),
            "/videos/:video_id/:format/:filename"
        );
        assert_eq!(sanitize_path("/videos/abc123"), "/videos/:video_id");
        assert_eq!(sanitize_path("/videos/abc123/runs"), "/videos/:video_id/runs");
        assert_eq!(sanitize_path("/videos"), "/videos");
        assert_eq!(sanitize_path("/health"), "/health");
    }
}
