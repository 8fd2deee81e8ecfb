//! Pipeline metrics.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use vod_models::Stage;

pub mod names {
    pub const RUNS_TOTAL: &str = "vod_pipeline_runs_total";
    pub const RUNS_ACTIVE: &str = "vod_pipeline_runs_active";
    pub const STAGE_DURATION_SECONDS: &str = "vod_pipeline_stage_duration_seconds";
    pub const STAGE_ATTEMPTS_TOTAL: &str = "vod_pipeline_stage_attempts_total";
    pub const STAGE_RETRIES_TOTAL: &str = "vod_pipeline_stage_retries_total";
    pub const RENDITIONS_PUBLISHED_TOTAL: &str = "vod_renditions_published_total";
    pub const STATUS_WRITE_FAILURES_TOTAL: &str = "vod_status_write_failures_total";
    pub const QUEUE_DLQ_TOTAL: &str = "vod_queue_dlq_total";
}

/// Record a finished run: `completed`, `failed` or `cancelled`.
pub fn record_run(outcome: &str) {
    counter!(names::RUNS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn set_active_runs(count: usize) {
    gauge!(names::RUNS_ACTIVE).set(count as f64);
}

pub fn record_stage(stage: Stage, ok: bool, elapsed: Duration) {
    let outcome = if ok { "ok" } else { "error" };
    counter!(
        names::STAGE_ATTEMPTS_TOTAL,
        "stage" => stage.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        names::STAGE_DURATION_SECONDS,
        "stage" => stage.as_str(),
        "outcome" => outcome
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_stage_retry(stage: Stage) {
    counter!(names::STAGE_RETRIES_TOTAL, "stage" => stage.as_str()).increment(1);
}

pub fn record_renditions(count: usize) {
    counter!(names::RENDITIONS_PUBLISHED_TOTAL).increment(count as u64);
}

pub fn record_status_write_failure() {
    counter!(names::STATUS_WRITE_FAILURES_TOTAL).increment(1);
}

pub fn record_dlq() {
    counter!(names::QUEUE_DLQ_TOTAL).increment(1);
}
