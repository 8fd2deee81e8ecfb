//! Video records and the processing state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};

/// Maximum accepted length for a video id.
pub const MAX_VIDEO_ID_LEN: usize = 128;

/// Unique identifier for an uploaded video.
///
/// Ids are embedded in object keys and file names, so only ASCII
/// alphanumerics, `-` and `_` are accepted by [`VideoId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct VideoId(pub String);

impl VideoId {
    /// Generate a new random video ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string without validation.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Parse and validate an id received from outside the process.
    pub fn parse(s: &str) -> ModelResult<Self> {
        if s.is_empty() || s.len() > MAX_VIDEO_ID_LEN {
            return Err(ModelError::InvalidVideoId(s.to_string()));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ModelError::InvalidVideoId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for VideoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VideoId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VideoId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Processing state of a video.
///
/// Moves strictly forward through the pipeline, or to `Error` from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[default]
    Received,
    Downloading,
    Analyzing,
    Transcoding,
    Completed,
    Error,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 6] = [
        ProcessingState::Received,
        ProcessingState::Downloading,
        ProcessingState::Analyzing,
        ProcessingState::Transcoding,
        ProcessingState::Completed,
        ProcessingState::Error,
    ];

    /// States from which a write of `next` is legal.
    pub fn predecessors_of(next: ProcessingState) -> Vec<ProcessingState> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Received => "received",
            ProcessingState::Downloading => "downloading",
            ProcessingState::Analyzing => "analyzing",
            ProcessingState::Transcoding => "transcoding",
            ProcessingState::Completed => "completed",
            ProcessingState::Error => "error",
        }
    }

    /// Position in the forward pipeline order. `Error` sorts last.
    pub fn rank(&self) -> u8 {
        match self {
            ProcessingState::Received => 0,
            ProcessingState::Downloading => 1,
            ProcessingState::Analyzing => 2,
            ProcessingState::Transcoding => 3,
            ProcessingState::Completed => 4,
            ProcessingState::Error => 5,
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingState::Completed | ProcessingState::Error)
    }

    /// The state that follows this one on the success path.
    pub fn next(&self) -> Option<ProcessingState> {
        match self {
            ProcessingState::Received => Some(ProcessingState::Downloading),
            ProcessingState::Downloading => Some(ProcessingState::Analyzing),
            ProcessingState::Analyzing => Some(ProcessingState::Transcoding),
            ProcessingState::Transcoding => Some(ProcessingState::Completed),
            ProcessingState::Completed | ProcessingState::Error => None,
        }
    }

    /// Whether a catalog write moving from `self` to `next` is legal.
    ///
    /// Re-entering the same non-terminal state is allowed so that a stage
    /// can be re-executed after a crash.
    pub fn can_transition_to(&self, next: ProcessingState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next || next == ProcessingState::Error {
            return true;
        }
        self.next() == Some(next)
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProcessingState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(ProcessingState::Received),
            "downloading" => Ok(ProcessingState::Downloading),
            "analyzing" => Ok(ProcessingState::Analyzing),
            "transcoding" => Ok(ProcessingState::Transcoding),
            "completed" => Ok(ProcessingState::Completed),
            "error" => Ok(ProcessingState::Error),
            other => Err(ModelError::UnknownState(other.to_string())),
        }
    }
}

/// Catalog record for one uploaded video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Video {
    pub id: VideoId,

    /// Original filename without its extension
    pub title: String,

    pub original_name: String,

    /// Object key of the uploaded source file
    pub original_path: String,

    pub processing_state: ProcessingState,

    /// Duration in seconds, 0 until the analyze stage has run
    #[serde(default)]
    pub duration: f64,

    /// Source size in bytes
    #[serde(default)]
    pub size: u64,

    pub content_type: String,

    /// Last stage failure, set only in the `error` state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Video {
    /// Create a freshly received video.
    pub fn new(
        id: VideoId,
        original_name: impl Into<String>,
        original_path: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        let original_name = original_name.into();
        let now = Utc::now();
        Self {
            id,
            title: title_from_filename(&original_name),
            original_name,
            original_path: original_path.into(),
            processing_state: ProcessingState::Received,
            duration: 0.0,
            size: 0,
            content_type: content_type.into(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the measured source size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Set the processing state.
    pub fn with_state(mut self, state: ProcessingState) -> Self {
        self.processing_state = state;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.processing_state.is_terminal()
    }
}

/// Derive a display title by stripping the last extension.
pub fn title_from_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match base.rfind('.') {
        Some(idx) if idx > 0 => base[..idx].to_string(),
        _ => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ProcessingState; 6] = ProcessingState::ALL;

    #[test]
    fn test_predecessors() {
        use ProcessingState::*;
        assert_eq!(ProcessingState::predecessors_of(Completed), vec![Transcoding]);
        assert_eq!(
            ProcessingState::predecessors_of(Analyzing),
            vec![Downloading, Analyzing]
        );
        assert_eq!(
            ProcessingState::predecessors_of(Error),
            vec![Received, Downloading, Analyzing, Transcoding]
        );
    }

    #[test]
    fn test_forward_transitions() {
        use ProcessingState::*;
        assert!(Received.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Transcoding));
        assert!(Transcoding.can_transition_to(Completed));
    }

    #[test]
    fn test_no_backward_or_skipping_transitions() {
        use ProcessingState::*;
        assert!(!Analyzing.can_transition_to(Downloading));
        assert!(!Transcoding.can_transition_to(Received));
        assert!(!Received.can_transition_to(Transcoding));
        assert!(!Downloading.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for next in ALL {
            assert!(!ProcessingState::Completed.can_transition_to(next));
            assert!(!ProcessingState::Error.can_transition_to(next));
        }
    }

    #[test]
    fn test_error_reachable_from_any_non_terminal_state() {
        for state in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(ProcessingState::Error), "{state}");
            assert!(state.can_transition_to(*state), "{state} re-entry");
        }
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in ALL {
            assert_eq!(state.as_str().parse::<ProcessingState>().unwrap(), state);
        }
        assert!("processing".parse::<ProcessingState>().is_err());
    }

    #[test]
    fn test_video_title_strips_extension() {
        let video = Video::new(
            VideoId::from("abc"),
            "holiday.final.mp4",
            "uploads/abc/abc.mp4",
            "video/mp4",
        );
        assert_eq!(video.title, "holiday.final");
        assert_eq!(video.processing_state, ProcessingState::Received);
        assert_eq!(video.duration, 0.0);
        assert_eq!(title_from_filename("clip"), "clip");
        assert_eq!(title_from_filename(".hidden"), ".hidden");
    }

    #[test]
    fn test_video_id_parse() {
        assert!(VideoId::parse("1700000000-abc_DEF").is_ok());
        assert!(VideoId::parse("").is_err());
        assert!(VideoId::parse("../etc").is_err());
        assert!(VideoId::parse("a/b").is_err());
        assert!(VideoId::parse(&"x".repeat(MAX_VIDEO_ID_LEN + 1)).is_err());
    }
}
