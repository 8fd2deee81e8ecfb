//! Queue message carrying a run request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vod_models::{RunRequest, VideoId};

/// One pipeline run to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunJob {
    /// Unique message-level id, distinct per enqueue
    pub job_id: String,
    pub request: RunRequest,
    pub enqueued_at: DateTime<Utc>,
}

impl RunJob {
    pub fn new(request: RunRequest) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            request,
            enqueued_at: Utc::now(),
        }
    }

    pub fn video_id(&self) -> &VideoId {
        &self.request.video_id
    }

    /// Key used to coalesce duplicate submissions for the same video.
    pub fn idempotency_key(&self) -> String {
        format!("run:{}", self.request.video_id)
    }
}
