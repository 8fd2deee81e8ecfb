//! Structured run logging.
//!
//! Every line carries `video_id`, and stage events add `stage` and
//! `attempt`, so one run can be followed through the JSON logs.

use std::time::Duration;

use tracing::{error, info, warn, Span};
use vod_models::{Stage, VideoId};

use crate::error::StageFailure;

/// Logger for the lifecycle of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunLogger {
    video_id: String,
}

impl RunLogger {
    pub fn new(video_id: &VideoId) -> Self {
        Self {
            video_id: video_id.to_string(),
        }
    }

    pub fn log_start(&self, stage: Stage, resumed: bool) {
        info!(
            video_id = %self.video_id,
            stage = %stage,
            resumed,
            "Run started"
        );
    }

    pub fn log_attempt(&self, stage: Stage, attempt: u32, max_attempts: u32) {
        info!(
            video_id = %self.video_id,
            stage = %stage,
            attempt,
            max_attempts,
            "Stage attempt"
        );
    }

    pub fn log_retry(&self, stage: Stage, attempt: u32, delay: Duration, reason: &str) {
        warn!(
            video_id = %self.video_id,
            stage = %stage,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Stage attempt failed, retrying: {}", reason
        );
    }

    pub fn log_stage_complete(&self, stage: Stage, elapsed: Duration) {
        info!(
            video_id = %self.video_id,
            stage = %stage,
            elapsed_ms = elapsed.as_millis() as u64,
            "Stage complete"
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(video_id = %self.video_id, "Run warning: {}", message);
    }

    pub fn log_failure(&self, failure: &StageFailure) {
        error!(
            video_id = %self.video_id,
            stage = %failure.stage,
            class = failure.class.as_str(),
            attempts = failure.attempts,
            "Run failed: {}", failure.reason
        );
    }

    pub fn log_completion(&self, renditions: usize, elapsed: Duration) {
        info!(
            video_id = %self.video_id,
            renditions,
            elapsed_ms = elapsed.as_millis() as u64,
            "Run completed"
        );
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// Span wrapping the whole run.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("run", video_id = %self.video_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_logger_creation() {
        let logger = RunLogger::new(&VideoId::from("vid-1"));
        assert_eq!(logger.video_id(), "vid-1");
    }
}
