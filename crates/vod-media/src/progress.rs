//! FFmpeg progress reporting.

use serde::{Deserialize, Serialize};

/// Progress snapshot parsed from `-progress` key/value blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FfmpegProgress {
    pub frame: u64,
    pub fps: f64,
    /// Encoded media time in milliseconds
    pub out_time_ms: i64,
    /// Encoded media time as HH:MM:SS.micro
    pub out_time: String,
    /// Multiple of realtime
    pub speed: f64,
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Percentage of a source of `duration_secs` encoded so far.
    pub fn percentage(&self, duration_secs: f64) -> f64 {
        if duration_secs <= 0.0 {
            return 0.0;
        }
        if self.is_complete {
            return 100.0;
        }
        (self.out_time_ms as f64 / 10.0 / duration_secs).clamp(0.0, 100.0)
    }
}
