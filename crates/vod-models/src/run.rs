//! Pipeline runs, stages and run requests.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;
use crate::video::{ProcessingState, VideoId};

/// Request to process one uploaded video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunRequest {
    pub video_id: VideoId,
    /// Object key of the uploaded source file
    pub object_key: String,
    /// Original client-side filename
    pub filename: String,
    pub content_type: String,
}

impl RunRequest {
    pub fn new(
        video_id: VideoId,
        object_key: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            video_id,
            object_key: object_key.into(),
            filename: filename.into(),
            content_type: content_type.into(),
        }
    }
}

/// Pipeline stage, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Analyze,
    Transcode,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Download, Stage::Analyze, Stage::Transcode, Stage::Cleanup];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Analyze => "analyze",
            Stage::Transcode => "transcode",
            Stage::Cleanup => "cleanup",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Download => Some(Stage::Analyze),
            Stage::Analyze => Some(Stage::Transcode),
            Stage::Transcode => Some(Stage::Cleanup),
            Stage::Cleanup => None,
        }
    }

    /// Catalog state written when the stage starts.
    pub fn processing_state(&self) -> Option<ProcessingState> {
        match self {
            Stage::Download => Some(ProcessingState::Downloading),
            Stage::Analyze => Some(ProcessingState::Analyzing),
            Stage::Transcode => Some(ProcessingState::Transcoding),
            Stage::Cleanup => None,
        }
    }

    /// Failure of a critical stage fails the run.
    pub fn is_critical(&self) -> bool {
        !matches!(self, Stage::Cleanup)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Stage::Download),
            "analyze" => Ok(Stage::Analyze),
            "transcode" => Ok(Stage::Transcode),
            "cleanup" => Ok(Stage::Cleanup),
            other => Err(ModelError::UnknownStage(other.to_string())),
        }
    }
}

/// Durable progress of one pipeline run (table `pipeline_runs`).
///
/// Saved after every attempt so a restarted worker resumes at `stage`
/// with the attempt budget already spent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineRun {
    pub video_id: VideoId,
    pub request: RunRequest,
    /// Stage to execute next
    pub stage: Stage,
    /// Attempts consumed per stage
    #[serde(default)]
    pub attempts: BTreeMap<Stage, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Scratch copy of the source, set by the download stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Probed duration, set by the analyze stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Whether the source carries an audio stream, set by the analyze stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_audio: Option<bool>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Start a new run at the download stage.
    pub fn new(request: RunRequest) -> Self {
        let now = Utc::now();
        Self {
            video_id: request.video_id.clone(),
            request,
            stage: Stage::Download,
            attempts: BTreeMap::new(),
            last_error: None,
            local_path: None,
            duration: None,
            has_audio: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    /// Count one more attempt for `stage` and return the new total.
    pub fn record_attempt(&mut self, stage: Stage) -> u32 {
        let count = self.attempts.entry(stage).or_insert(0);
        *count += 1;
        self.updated_at = Utc::now();
        *count
    }

    /// Move to `stage`, clearing the previous error.
    pub fn advance_to(&mut self, stage: Stage) {
        self.stage = stage;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    pub fn record_error(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
        self.updated_at = Utc::now();
    }
}
