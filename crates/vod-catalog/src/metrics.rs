//! Catalog metrics.
//!
//! - Request counters by operation and status
//! - Latency histograms
//! - Retry counters

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Total catalog queries by operation and status.
    pub const REQUESTS_TOTAL: &str = "catalog_requests_total";

    /// Total retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "catalog_retries_total";

    /// Query latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "catalog_latency_seconds";
}

/// Record metrics for a completed catalog query.
pub fn record_request(operation: &str, ok: bool, latency_ms: f64) {
    counter!(
        names::REQUESTS_TOTAL,
        "operation" => operation.to_string(),
        "status" => if ok { "ok" } else { "error" }
    )
    .increment(1);

    histogram!(
        names::LATENCY_SECONDS,
        "operation" => operation.to_string()
    )
    .record(latency_ms / 1000.0);
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(
        names::RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::REQUESTS_TOTAL.starts_with("catalog_"));
        assert!(names::RETRIES_TOTAL.contains("retries"));
        assert!(names::LATENCY_SECONDS.contains("latency"));
    }
}
