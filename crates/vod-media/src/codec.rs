//! Codec runner capability.
//!
//! The pipeline depends on [`CodecRunner`] rather than on FFmpeg directly so
//! tests can script encoder behaviour without the binaries installed.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::command::FfmpegRunner;
use crate::error::{MediaError, MediaResult};
use crate::hls::HlsLadderJob;
use crate::probe::{probe_video, MediaInfo};

/// Raw outcome of one encoder process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CodecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into an error carrying stderr verbatim.
    pub fn into_result(self) -> MediaResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let message = match self.exit_code {
            Some(code) => format!("FFmpeg exited with status {}", code),
            None => "FFmpeg terminated by signal".to_string(),
        };
        Err(MediaError::ffmpeg_failed(
            message,
            Some(self.stderr),
            self.exit_code,
        ))
    }
}

/// Probe and encode operations needed by the transcode pipeline.
#[async_trait]
pub trait CodecRunner: Send + Sync {
    /// Read technical metadata of a source file.
    async fn probe(&self, input: &Path) -> MediaResult<MediaInfo>;

    /// Run the ladder encode to completion.
    ///
    /// Raising `cancel` terminates the encoder process.
    async fn run(&self, job: &HlsLadderJob, cancel: watch::Receiver<bool>)
        -> MediaResult<CodecOutput>;
}

/// [`CodecRunner`] backed by the `ffmpeg` and `ffprobe` binaries on PATH.
#[derive(Debug, Clone, Default)]
pub struct FfmpegCodecRunner {
    timeout_secs: Option<u64>,
}

impl FfmpegCodecRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill encodes that run longer than `secs`.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

#[async_trait]
impl CodecRunner for FfmpegCodecRunner {
    async fn probe(&self, input: &Path) -> MediaResult<MediaInfo> {
        probe_video(input).await
    }

    async fn run(
        &self,
        job: &HlsLadderJob,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<CodecOutput> {
        let mut runner = FfmpegRunner::new().with_cancel(cancel);
        if let Some(secs) = self.timeout_secs {
            runner = runner.with_timeout(secs);
        }

        let video_id = job.video_id.to_string();
        let duration = job.source_duration.unwrap_or(0.0);
        runner
            .run_with_progress(&job.to_command(), move |progress| {
                debug!(
                    video_id = %video_id,
                    percent = progress.percentage(duration),
                    speed = progress.speed,
                    "encode progress"
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_passes_through() {
        let output = CodecOutput {
            exit_code: Some(0),
            stdout: "progress=end\n".into(),
            stderr: String::new(),
        };
        assert!(output.clone().into_result().is_ok());
    }

    #[test]
    fn test_failure_keeps_stderr_verbatim() {
        let stderr = "[libx264 @ 0x1] broken\nConversion failed!\n".to_string();
        let output = CodecOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.clone(),
        };
        let err = output.into_result().unwrap_err();
        assert_eq!(err.stderr(), Some(stderr.as_str()));
        match err {
            MediaError::FfmpegFailed { exit_code, .. } => assert_eq!(exit_code, Some(1)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_signal_termination_is_failure() {
        let output = CodecOutput {
            exit_code: None,
            ..Default::default()
        };
        assert!(!output.success());
        assert!(output.into_result().is_err());
    }
}
