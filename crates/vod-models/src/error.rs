//! Model parsing and validation errors.

use thiserror::Error;

/// Result type for model parsing.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while parsing or validating model values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("Invalid ladder entry '{entry}': {reason}")]
    InvalidLadderEntry { entry: String, reason: String },

    #[error("Ladder must contain at least one entry")]
    EmptyLadder,

    #[error("Unknown processing state: {0}")]
    UnknownState(String),

    #[error("Unknown stream format: {0}")]
    UnknownFormat(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Invalid video id: {0}")]
    InvalidVideoId(String),
}

impl ModelError {
    pub fn invalid_ladder_entry(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLadderEntry {
            entry: entry.into(),
            reason: reason.into(),
        }
    }
}
