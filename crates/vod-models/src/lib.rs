//! Shared data models for the VOD transcoding pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Videos and their processing state machine
//! - Renditions (one per ladder entry and packaging format)
//! - The ABR ladder and encoding configuration
//! - Pipeline runs, stages and run requests
//! - Read-path response shapes (detail, listing, pagination)

pub mod error;
pub mod ladder;
pub mod listing;
pub mod rendition;
pub mod run;
pub mod video;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use ladder::{EncodingConfig, Ladder, LadderEntry};
pub use listing::{Pagination, VideoDetail, VideoListing};
pub use rendition::{Rendition, StreamFormat};
pub use run::{PipelineRun, RunRequest, Stage};
pub use video::{ProcessingState, Video, VideoId};
