//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Encoder/prober stderr fragments that mean the input itself is unusable.
///
/// Retrying the same file cannot change these outcomes.
const INPUT_ERROR_MARKERS: &[&str] = &[
    "matches no streams",
    "does not contain any stream",
    "Invalid data found when processing input",
    "moov atom not found",
    "Output file #0 does not contain any stream",
    "Unknown encoder",
    "Invalid argument",
];

/// Errors that can occur during media processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid video file: {0}")]
    InvalidVideo(String),

    #[error("Invalid ladder: {0}")]
    InvalidLadder(#[from] vod_models::ModelError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create an invalid video error.
    pub fn invalid_video(message: impl Into<String>) -> Self {
        Self::InvalidVideo(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Captured stderr, verbatim, when the tool produced any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::FfmpegFailed { stderr, .. } | Self::FfprobeFailed { stderr, .. } => {
                stderr.as_deref()
            }
            _ => None,
        }
    }

    /// Whether the failure is caused by the input or the ladder rather than
    /// by the environment. Such failures are not worth retrying.
    pub fn is_input_error(&self) -> bool {
        match self {
            Self::InvalidVideo(_) | Self::InvalidLadder(_) => true,
            Self::FfmpegFailed { stderr, .. } | Self::FfprobeFailed { stderr, .. } => stderr
                .as_deref()
                .map(|s| INPUT_ERROR_MARKERS.iter().any(|m| s.contains(m)))
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_detected_from_stderr() {
        let err = MediaError::ffmpeg_failed(
            "exit 1",
            Some("Stream map '0:a:0' matches no streams.".to_string()),
            Some(1),
        );
        assert!(err.is_input_error());
        assert_eq!(err.stderr(), Some("Stream map '0:a:0' matches no streams."));
    }

    #[test]
    fn test_environment_errors_are_not_input_errors() {
        let err = MediaError::ffmpeg_failed(
            "exit 137",
            Some("Killed".to_string()),
            Some(137),
        );
        assert!(!err.is_input_error());
        assert!(!MediaError::Timeout(30).is_input_error());
        assert!(!MediaError::FfmpegNotFound.is_input_error());
        assert!(MediaError::invalid_video("no video stream").is_input_error());
    }
}
