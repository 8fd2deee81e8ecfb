//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use vod_models::{EncodingConfig, Ladder};

use crate::error::{WorkerError, WorkerResult};
use crate::retry::StagePolicies;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum runs executing at once
    pub max_concurrent_runs: usize,
    /// Root of per-video scratch directories
    pub work_dir: PathBuf,
    /// ABR ladder, in manifest order
    pub ladder: Ladder,
    pub encoding: EncodingConfig,
    pub policies: StagePolicies,
    /// Parallel uploads of encoded files per run
    pub upload_concurrency: usize,
    /// TTL of playlists written to the stream cache after a transcode;
    /// `None` disables warming
    pub cache_warm_ttl: Option<Duration>,
    /// How often the executor reclaims messages from crashed workers
    pub claim_interval: Duration,
    /// Per-video lease TTL when leases are enabled
    pub lease_ttl: Duration,
    /// Take a Redis lease per video so runs are exclusive across workers
    pub leases_enabled: bool,
    /// Lease refresh interval
    pub lease_heartbeat_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 2,
            work_dir: PathBuf::from("/tmp/vod"),
            ladder: Ladder::default(),
            encoding: EncodingConfig::default(),
            policies: StagePolicies::default(),
            upload_concurrency: 8,
            cache_warm_ttl: Some(Duration::from_secs(300)),
            claim_interval: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(120),
            leases_enabled: true,
            lease_heartbeat_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();

        let ladder = match std::env::var("TRANSCODE_LADDER") {
            Ok(spec) if !spec.trim().is_empty() => spec
                .parse::<Ladder>()
                .map_err(|e| WorkerError::config_error(format!("TRANSCODE_LADDER: {}", e)))?,
            _ => defaults.ladder,
        };

        let mut encoding = defaults.encoding;
        if let Ok(preset) = std::env::var("FFMPEG_PRESET") {
            encoding = encoding.with_preset(preset);
        }
        if let Some(threads) = env_parse::<u32>("FFMPEG_THREADS") {
            encoding = encoding.with_threads(threads);
        }
        if let Some(secs) = env_parse::<u32>("HLS_SEGMENT_SECONDS") {
            encoding.segment_seconds = secs.max(1);
        }

        let cache_warm_ttl = match env_parse::<u64>("CACHE_WARM_TTL_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.cache_warm_ttl,
        };

        Ok(Self {
            max_concurrent_runs: env_parse("WORKER_MAX_RUNS")
                .unwrap_or(defaults.max_concurrent_runs)
                .max(1),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            ladder,
            encoding,
            policies: StagePolicies::from_env(),
            upload_concurrency: env_parse("WORKER_UPLOAD_CONCURRENCY")
                .unwrap_or(defaults.upload_concurrency)
                .max(1),
            cache_warm_ttl,
            claim_interval: env_parse("WORKER_CLAIM_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            lease_ttl: env_parse("WORKER_LEASE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_ttl),
            leases_enabled: env_parse("WORKER_LEASES_ENABLED").unwrap_or(defaults.leases_enabled),
            lease_heartbeat_interval: env_parse("WORKER_LEASE_HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_heartbeat_interval),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
        })
    }

    /// Scratch directory of one video.
    pub fn scratch_dir(&self, video_id: &vod_models::VideoId) -> PathBuf {
        self.work_dir.join(video_id.as_str())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vod_models::VideoId;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.ladder.len(), 4);
        assert_eq!(config.encoding.preset, "fast");
        assert_eq!(
            config.scratch_dir(&VideoId::from("abc")),
            PathBuf::from("/tmp/vod/abc")
        );
    }
}
