//! Read-path response shapes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::rendition::{Rendition, StreamFormat};
use crate::video::{ProcessingState, Video, VideoId};

/// Playback view of one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VideoDetail {
    pub video_id: VideoId,
    pub title: String,
    pub duration: f64,
    pub status: ProcessingState,
    /// Distinct formats across the renditions, in first-seen order
    pub formats: Vec<StreamFormat>,
    /// Signed URL of the HLS master manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_master: Option<String>,
    /// Signed URL of the DASH manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dash_master: Option<String>,
    pub streams: Vec<Rendition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Effective paging window echoed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

/// One page of videos, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VideoListing {
    pub videos: Vec<Video>,
    pub pagination: Pagination,
}

impl VideoListing {
    pub fn empty(pagination: Pagination) -> Self {
        Self {
            videos: Vec::new(),
            pagination,
        }
    }
}
