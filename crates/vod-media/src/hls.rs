//! Multi-variant HLS ladder encoding.
//!
//! One encoder invocation demuxes the source once and produces every ladder
//! variant. Variant `i` of video `id` is named `{id}_v{i}`:
//! playlist `{id}_v{i}.m3u8`, segments `{id}_v{i}_%03d.ts`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use vod_models::{EncodingConfig, Ladder, LadderEntry, VideoId};

use crate::command::FfmpegCommand;
use crate::error::MediaResult;

/// File name of the master playlist.
pub const MASTER_PLAYLIST: &str = "master.m3u8";

/// Base name of ladder variant `index`.
pub fn variant_name(video_id: &VideoId, index: usize) -> String {
    format!("{}_v{}", video_id, index)
}

/// Naming of one ladder variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsVariant {
    pub index: usize,
    pub entry: LadderEntry,
    pub name: String,
    pub playlist: String,
    /// printf-style pattern handed to the segment muxer
    pub segment_pattern: String,
}

impl HlsVariant {
    pub fn new(video_id: &VideoId, index: usize, entry: &LadderEntry) -> Self {
        let name = variant_name(video_id, index);
        Self {
            index,
            entry: entry.clone(),
            playlist: format!("{}.m3u8", name),
            segment_pattern: format!("{}_%03d.ts", name),
            name,
        }
    }

    /// Whether `filename` is the playlist or one of the segments of this variant.
    pub fn owns_file(&self, filename: &str) -> bool {
        if filename == self.playlist {
            return true;
        }
        filename
            .strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|rest| rest.strip_suffix(".ts"))
            .map(|seq| !seq.is_empty() && seq.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    }
}

/// A complete ladder encode for one source file.
#[derive(Debug, Clone)]
pub struct HlsLadderJob {
    pub video_id: VideoId,
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub ladder: Ladder,
    pub encoding: EncodingConfig,
    /// Map the first audio stream into every variant
    pub include_audio: bool,
    /// Probed source duration, used for progress reporting
    pub source_duration: Option<f64>,
}

impl HlsLadderJob {
    pub fn new(
        video_id: VideoId,
        input: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        ladder: Ladder,
        encoding: EncodingConfig,
    ) -> Self {
        Self {
            video_id,
            input: input.as_ref().to_path_buf(),
            output_dir: output_dir.as_ref().to_path_buf(),
            ladder,
            encoding,
            include_audio: true,
            source_duration: None,
        }
    }

    pub fn with_source_duration(mut self, seconds: f64) -> Self {
        self.source_duration = Some(seconds);
        self
    }

    /// Encode video only, for sources without an audio stream.
    pub fn without_audio(mut self) -> Self {
        self.include_audio = false;
        self
    }

    /// Variants in ladder order.
    pub fn variants(&self) -> Vec<HlsVariant> {
        self.ladder
            .iter()
            .enumerate()
            .map(|(i, entry)| HlsVariant::new(&self.video_id, i, entry))
            .collect()
    }

    pub fn master_path(&self) -> PathBuf {
        self.output_dir.join(MASTER_PLAYLIST)
    }

    /// Build the single multi-output encoder command.
    pub fn to_command(&self) -> FfmpegCommand {
        let enc = &self.encoding;
        let segment_secs = enc.segment_seconds.to_string();

        let mut cmd = FfmpegCommand::new(&self.input);
        for variant in self.variants() {
            cmd = cmd.map("0:v:0");
            if self.include_audio {
                cmd = cmd.map("0:a:0");
            }
            cmd = cmd
                .video_codec(enc.codec.as_str())
                .preset(enc.preset.as_str())
                .video_bitrate(variant.entry.bitrate.as_str())
                .size(variant.entry.width, variant.entry.height);
            if self.include_audio {
                cmd = cmd
                    .audio_codec(enc.audio_codec.as_str())
                    .audio_bitrate(enc.audio_bitrate.as_str());
            }
            // Thread count is an encoder option, so every output group repeats it.
            if enc.threads > 0 {
                cmd = cmd.output_arg("-threads").output_arg(enc.threads.to_string());
            }
            cmd = cmd
                .output_args(["-hls_time", segment_secs.as_str(), "-hls_list_size", "0"])
                .output_arg("-hls_segment_filename")
                .output_arg(path_arg(&self.output_dir.join(&variant.segment_pattern)))
                .output_arg(path_arg(&self.output_dir.join(&variant.playlist)));
        }
        cmd
    }

    /// Render the master playlist, one `EXT-X-STREAM-INF` per variant in
    /// ladder order.
    pub fn master_manifest(&self) -> MediaResult<String> {
        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        for variant in self.variants() {
            let bandwidth = variant.entry.bandwidth_bps()?;
            // Writing to a String cannot fail
            let _ = writeln!(
                out,
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}",
                bandwidth,
                variant.entry.resolution()
            );
            let _ = writeln!(out, "{}", variant.playlist);
        }
        Ok(out)
    }

    /// Write the master playlist next to the variant playlists.
    pub async fn write_master_manifest(&self) -> MediaResult<PathBuf> {
        let path = self.master_path();
        tokio::fs::write(&path, self.master_manifest()?).await?;
        Ok(path)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
