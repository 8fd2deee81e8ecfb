//! FFmpeg CLI wrapper for ABR ladder transcoding.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Progress parsing from `-progress pipe:1`
//! - Cancellation and timeouts that kill the encoder process
//! - FFprobe metadata extraction
//! - Single-pass multi-variant HLS jobs and master playlist rendering
//! - The [`CodecRunner`] capability used by the pipeline

pub mod codec;
pub mod command;
pub mod error;
pub mod fs_utils;
pub mod hls;
pub mod probe;
pub mod progress;

pub use codec::{CodecOutput, CodecRunner, FfmpegCodecRunner};
pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use hls::{variant_name, HlsLadderJob, HlsVariant, MASTER_PLAYLIST};
pub use probe::{parse_probe_output, probe_video, MediaInfo};
pub use progress::FfmpegProgress;
