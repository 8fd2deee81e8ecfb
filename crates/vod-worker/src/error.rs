//! Worker error types and failure classification.

use std::fmt;

use thiserror::Error;
use vod_catalog::CatalogError;
use vod_media::MediaError;
use vod_models::{ModelError, Stage};
use vod_queue::QueueError;
use vod_storage::StorageError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("attempt timed out after {0}s")]
    Timeout(u64),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid model: {0}")]
    Model(#[from] ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a failed attempt is treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt after backoff.
    Transient,
    /// Retrying cannot help; fail the stage now.
    Configuration,
    /// Logged and swallowed; the run continues.
    NonCritical,
    /// The run was cancelled by its owner.
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Configuration => "configuration",
            ErrorClass::NonCritical => "non_critical",
            ErrorClass::Cancelled => "cancelled",
        }
    }
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn processing_failed(msg: impl Into<String>) -> Self {
        Self::ProcessingFailed(msg.into())
    }

    /// Classify this error for the stage retry loop.
    pub fn class(&self) -> ErrorClass {
        match self {
            WorkerError::Cancelled => ErrorClass::Cancelled,
            WorkerError::ConfigError(_) | WorkerError::Model(_) => ErrorClass::Configuration,
            WorkerError::ProcessingFailed(_) | WorkerError::Timeout(_) | WorkerError::Io(_) => {
                ErrorClass::Transient
            }
            WorkerError::Media(e) => match e {
                MediaError::Cancelled => ErrorClass::Cancelled,
                MediaError::FfmpegNotFound | MediaError::FfprobeNotFound => {
                    ErrorClass::Configuration
                }
                e if e.is_input_error() => ErrorClass::Configuration,
                _ => ErrorClass::Transient,
            },
            WorkerError::Storage(e) => transient_if(e.is_retryable()),
            WorkerError::Catalog(e) => transient_if(e.is_retryable()),
            WorkerError::Queue(e) => transient_if(e.is_retryable()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Failure text recorded on the video. Encoder failures carry their
    /// stderr verbatim.
    pub fn reason(&self) -> String {
        match self {
            WorkerError::Media(e) => match e.stderr() {
                Some(stderr) if !stderr.trim().is_empty() => {
                    format!("{}: {}", e, stderr.trim_end())
                }
                _ => e.to_string(),
            },
            other => other.to_string(),
        }
    }
}

fn transient_if(retryable: bool) -> ErrorClass {
    if retryable {
        ErrorClass::Transient
    } else {
        ErrorClass::Configuration
    }
}

/// A stage failure normalized for recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub class: ErrorClass,
    pub reason: String,
    pub attempts: u32,
}

impl StageFailure {
    pub fn new(stage: Stage, error: &WorkerError, attempts: u32) -> Self {
        let class = if stage.is_critical() {
            error.class()
        } else {
            ErrorClass::NonCritical
        };
        Self {
            stage,
            class,
            reason: error.reason(),
            attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.class == ErrorClass::Cancelled
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.reason)
    }
}
