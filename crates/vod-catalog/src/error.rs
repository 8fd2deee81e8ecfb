//! Error types for catalog operations.

use thiserror::Error;
use vod_models::{ModelError, ProcessingState, VideoId};

/// Result type for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors that can occur during catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Video not found: {0}")]
    NotFound(VideoId),

    #[error("Illegal state transition for {video_id}: {from} -> {to}")]
    InvalidTransition {
        video_id: VideoId,
        from: ProcessingState,
        to: ProcessingState,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(#[from] ModelError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CatalogError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_transition(video_id: &VideoId, from: ProcessingState, to: ProcessingState) -> Self {
        Self::InvalidTransition {
            video_id: video_id.clone(),
            from,
            to,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            CatalogError::Database(e) => is_transient_sqlx(e),
            _ => false,
        }
    }
}

/// SQLSTATE classes that clear up on their own: connection exceptions,
/// serialization failures, deadlocks and operator intervention.
const TRANSIENT_SQLSTATE_PREFIXES: &[&str] = &["08", "40001", "40P01", "57P"];

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| {
                TRANSIENT_SQLSTATE_PREFIXES
                    .iter()
                    .any(|prefix| code.starts_with(prefix))
            })
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CatalogError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(CatalogError::Database(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        )))
        .is_retryable());
        assert!(!CatalogError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!CatalogError::NotFound(VideoId::from("v")).is_retryable());
        assert!(!CatalogError::invalid_transition(
            &VideoId::from("v"),
            ProcessingState::Completed,
            ProcessingState::Downloading
        )
        .is_retryable());
    }
}
