//! ABR ladder and encoding configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, ModelResult};

/// Default video codec (H.264)
pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
/// Default audio codec
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
/// Default encoding preset
pub const DEFAULT_PRESET: &str = "fast";
/// Fixed audio bitrate shared by every variant
pub const DEFAULT_AUDIO_BITRATE: &str = "128k";
/// HLS segment duration in seconds
pub const DEFAULT_SEGMENT_SECONDS: u32 = 10;

/// Resolution whose presence gates master manifest URLs on the read path.
pub const REFERENCE_RESOLUTION: &str = "1920x1080";

/// One rung of the ABR ladder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct LadderEntry {
    pub width: u32,
    pub height: u32,
    /// Target video bitrate, e.g. "5000k" or "5M"
    pub bitrate: String,
}

impl LadderEntry {
    pub fn new(width: u32, height: u32, bitrate: impl Into<String>) -> Self {
        Self {
            width,
            height,
            bitrate: bitrate.into(),
        }
    }

    /// Resolution label, e.g. "1920x1080".
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Target bitrate in bits per second, used for `BANDWIDTH`.
    pub fn bandwidth_bps(&self) -> ModelResult<u64> {
        parse_bitrate(&self.bitrate)
            .ok_or_else(|| ModelError::invalid_ladder_entry(self.to_string(), "bad bitrate"))
    }

    /// Check dimensions and bitrate.
    pub fn validate(&self) -> ModelResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ModelError::invalid_ladder_entry(
                self.to_string(),
                "dimensions must be positive",
            ));
        }
        // libx264 with yuv420p rejects odd dimensions
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ModelError::invalid_ladder_entry(
                self.to_string(),
                "dimensions must be even",
            ));
        }
        match self.bandwidth_bps()? {
            0 => Err(ModelError::invalid_ladder_entry(
                self.to_string(),
                "bitrate must be positive",
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for LadderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}:{}", self.width, self.height, self.bitrate)
    }
}

impl FromStr for LadderEntry {
    type Err = ModelError;

    /// Parse `WIDTHxHEIGHT:BITRATE`, e.g. `1280x720:2500k`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (dims, bitrate) = s
            .split_once(':')
            .ok_or_else(|| ModelError::invalid_ladder_entry(s, "expected WxH:bitrate"))?;
        let (w, h) = dims
            .split_once('x')
            .ok_or_else(|| ModelError::invalid_ladder_entry(s, "expected WxH"))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| ModelError::invalid_ladder_entry(s, "bad width"))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| ModelError::invalid_ladder_entry(s, "bad height"))?;

        let entry = LadderEntry::new(width, height, bitrate.trim());
        entry.validate()?;
        Ok(entry)
    }
}

/// Parse an encoder bitrate string into bits per second.
fn parse_bitrate(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1_000),
        'm' | 'M' => (&s[..s.len() - 1], 1_000_000),
        _ => (s, 1),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

/// Ordered list of ladder entries.
///
/// Order is significant: variant `i` of the encode is entry `i`, and the
/// master manifest lists variants in this order. Resolutions are unique,
/// so every entry maps to its own catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Ladder(Vec<LadderEntry>);

impl Ladder {
    /// Build a validated ladder.
    pub fn new(entries: Vec<LadderEntry>) -> ModelResult<Self> {
        if entries.is_empty() {
            return Err(ModelError::EmptyLadder);
        }
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            entry.validate()?;
            if !seen.insert((entry.width, entry.height)) {
                return Err(ModelError::invalid_ladder_entry(
                    entry.to_string(),
                    "duplicate resolution",
                ));
            }
        }
        Ok(Self(entries))
    }

    pub fn entries(&self) -> &[LadderEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LadderEntry> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for Ladder {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries = Vec::<LadderEntry>::deserialize(deserializer)?;
        Ladder::new(entries).map_err(serde::de::Error::custom)
    }
}

impl Default for Ladder {
    /// Four-rung ladder from 1080p down to 360p.
    fn default() -> Self {
        Self(vec![
            LadderEntry::new(1920, 1080, "5000k"),
            LadderEntry::new(1280, 720, "2500k"),
            LadderEntry::new(854, 480, "1000k"),
            LadderEntry::new(640, 360, "500k"),
        ])
    }
}

impl FromStr for Ladder {
    type Err = ModelError;

    /// Parse a comma separated list, e.g. `1920x1080:5000k,1280x720:2500k`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let entries = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<ModelResult<Vec<LadderEntry>>>()?;
        Ladder::new(entries)
    }
}

/// Encoder settings shared by every variant of a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EncodingConfig {
    /// Video codec (e.g., "libx264")
    #[serde(default = "default_video_codec")]
    pub codec: String,

    /// Encoding preset (e.g., "fast", "medium", "slow")
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Audio codec
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    /// Audio bitrate
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    /// HLS segment duration in seconds
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Encoder thread count, 0 lets the encoder decide
    #[serde(default)]
    pub threads: u32,
}

fn default_video_codec() -> String {
    DEFAULT_VIDEO_CODEC.to_string()
}
fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}
fn default_audio_codec() -> String {
    DEFAULT_AUDIO_CODEC.to_string()
}
fn default_audio_bitrate() -> String {
    DEFAULT_AUDIO_BITRATE.to_string()
}
fn default_segment_seconds() -> u32 {
    DEFAULT_SEGMENT_SECONDS
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            codec: DEFAULT_VIDEO_CODEC.to_string(),
            preset: DEFAULT_PRESET.to_string(),
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            audio_bitrate: DEFAULT_AUDIO_BITRATE.to_string(),
            segment_seconds: DEFAULT_SEGMENT_SECONDS,
            threads: 0,
        }
    }
}

impl EncodingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new config with updated preset.
    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    /// Returns a new config with a fixed encoder thread count.
    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ladder_entry() {
        let entry: LadderEntry = "1280x720:2500k".parse().unwrap();
        assert_eq!(entry.width, 1280);
        assert_eq!(entry.height, 720);
        assert_eq!(entry.bitrate, "2500k");
        assert_eq!(entry.resolution(), "1280x720");
        assert_eq!(entry.bandwidth_bps().unwrap(), 2_500_000);
    }

    #[test]
    fn test_bitrate_units() {
        assert_eq!(parse_bitrate("5M"), Some(5_000_000));
        assert_eq!(parse_bitrate("800000"), Some(800_000));
        assert_eq!(parse_bitrate("k"), None);
        assert_eq!(parse_bitrate("2.5M"), None);
        assert_eq!(parse_bitrate(""), None);
    }

    #[test]
    fn test_invalid_entries_rejected() {
        assert!("1280x720".parse::<LadderEntry>().is_err());
        assert!("1281x720:2500k".parse::<LadderEntry>().is_err());
        assert!("0x720:2500k".parse::<LadderEntry>().is_err());
        assert!("1280x720:fast".parse::<LadderEntry>().is_err());
        assert!("1280x720:0k".parse::<LadderEntry>().is_err());
    }

    #[test]
    fn test_ladder_preserves_order() {
        let ladder: Ladder = "640x360:500k, 1920x1080:5000k".parse().unwrap();
        let resolutions: Vec<_> = ladder.iter().map(|e| e.resolution()).collect();
        assert_eq!(resolutions, vec!["640x360", "1920x1080"]);
    }

    #[test]
    fn test_empty_ladder_rejected() {
        assert_eq!(Ladder::new(vec![]), Err(ModelError::EmptyLadder));
        assert_eq!("".parse::<Ladder>(), Err(ModelError::EmptyLadder));
    }

    #[test]
    fn test_repeated_resolution_rejected() {
        let err = "1280x720:2500k,640x360:500k,1280x720:1000k"
            .parse::<Ladder>()
            .unwrap_err();
        assert_eq!(
            err,
            ModelError::invalid_ladder_entry("1280x720:1000k", "duplicate resolution")
        );
    }

    #[test]
    fn test_deserialize_validates() {
        let ladder: Ladder =
            serde_json::from_str(r#"[{"width":1280,"height":720,"bitrate":"2500k"}]"#).unwrap();
        assert_eq!(ladder.len(), 1);

        assert!(serde_json::from_str::<Ladder>("[]").is_err());
        assert!(serde_json::from_str::<Ladder>(
            r#"[{"width":1280,"height":720,"bitrate":"2500k"},
                {"width":1280,"height":720,"bitrate":"1000k"}]"#
        )
        .is_err());
        assert!(
            serde_json::from_str::<Ladder>(r#"[{"width":1281,"height":720,"bitrate":"2500k"}]"#)
                .is_err()
        );
    }

    #[test]
    fn test_default_ladder_contains_reference_resolution() {
        let ladder = Ladder::default();
        assert_eq!(ladder.len(), 4);
        assert!(ladder.iter().any(|e| e.resolution() == REFERENCE_RESOLUTION));
        assert!(ladder.iter().all(|e| e.validate().is_ok()));
    }

    #[test]
    fn test_encoding_defaults() {
        let config = EncodingConfig::new().with_preset("veryfast").with_threads(4);
        assert_eq!(config.preset, "veryfast");
        assert_eq!(config.threads, 4);
        assert_eq!(config.audio_bitrate, "128k");
        assert_eq!(config.segment_seconds, 10);
    }
}
