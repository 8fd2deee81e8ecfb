//! Rendition records and packaging formats.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;
use crate::ladder::LadderEntry;
use crate::video::VideoId;

/// Streaming packaging format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    #[default]
    Hls,
    Dash,
}

impl StreamFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::Hls => "hls",
            StreamFormat::Dash => "dash",
        }
    }

    /// File name of the top-level manifest for this format.
    pub fn master_manifest_name(&self) -> &'static str {
        match self {
            StreamFormat::Hls => "master.m3u8",
            StreamFormat::Dash => "manifest.mpd",
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StreamFormat {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hls" => Ok(StreamFormat::Hls),
            "dash" => Ok(StreamFormat::Dash),
            other => Err(ModelError::UnknownFormat(other.to_string())),
        }
    }
}

/// One encoded variant of a video (table `video_streams`).
///
/// Unique on `(video_id, resolution, format)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Rendition {
    /// `{video_id}-{resolution}-{format}`, derived from the natural key
    pub id: String,
    pub video_id: VideoId,
    /// "WxH"
    pub resolution: String,
    /// Target bitrate as configured, e.g. "5000k"
    pub bitrate: String,
    pub format: StreamFormat,
    /// Object key of the variant playlist
    pub path: String,
    /// Encoded bytes (playlist plus segments)
    pub size: u64,
    /// Segment duration in seconds
    pub segment_size: u32,
    pub created_at: DateTime<Utc>,
}

impl Rendition {
    /// Build the rendition record for a ladder entry.
    pub fn for_variant(
        video_id: &VideoId,
        entry: &LadderEntry,
        format: StreamFormat,
        path: impl Into<String>,
        size: u64,
        segment_size: u32,
    ) -> Self {
        Self {
            id: format!("{}-{}-{}", video_id, entry.resolution(), format.as_str()),
            video_id: video_id.clone(),
            resolution: entry.resolution(),
            bitrate: entry.bitrate.clone(),
            format,
            path: path.into(),
            size,
            segment_size,
            created_at: Utc::now(),
        }
    }

    /// Natural key used for upserts.
    pub fn natural_key(&self) -> (VideoId, String, StreamFormat) {
        (self.video_id.clone(), self.resolution.clone(), self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendition_for_variant() {
        let id = VideoId::from("vid1");
        let entry = LadderEntry::new(1280, 720, "2500k");
        let r = Rendition::for_variant(
            &id,
            &entry,
            StreamFormat::Hls,
            "videos/vid1/hls/vid1_v1.m3u8",
            4096,
            10,
        );
        assert_eq!(r.id, "vid1-1280x720-hls");
        assert_eq!(r.resolution, "1280x720");
        assert_eq!(r.bitrate, "2500k");
        assert_eq!(
            r.natural_key(),
            (id, "1280x720".to_string(), StreamFormat::Hls)
        );
    }

    #[test]
    fn test_id_follows_natural_key_not_ladder_position() {
        let id = VideoId::from("vid1");
        let entry = LadderEntry::new(1280, 720, "2500k");
        let first = Rendition::for_variant(&id, &entry, StreamFormat::Hls, "a.m3u8", 1, 10);
        let moved = Rendition::for_variant(&id, &entry, StreamFormat::Hls, "b.m3u8", 2, 10);
        assert_eq!(first.id, moved.id);

        let dash = Rendition::for_variant(&id, &entry, StreamFormat::Dash, "c.mpd", 1, 10);
        assert_ne!(first.id, dash.id);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("hls".parse::<StreamFormat>().unwrap(), StreamFormat::Hls);
        assert_eq!("dash".parse::<StreamFormat>().unwrap(), StreamFormat::Dash);
        assert!("HLS".parse::<StreamFormat>().is_err());
        assert_eq!(StreamFormat::Dash.master_manifest_name(), "manifest.mpd");
    }
}
