//! Dependencies shared by every pipeline run.

use std::sync::Arc;

use tracing::{info, warn};
use vod_catalog::{CatalogConfig, CatalogStore, PgCatalog};
use vod_media::{CodecRunner, FfmpegCodecRunner};
use vod_storage::{NoopStreamCache, ObjectStore, RedisStreamCache, S3ObjectStore, StreamCache};

use crate::config::WorkerConfig;
use crate::error::WorkerResult;

/// Capabilities the orchestrator and engine run against.
///
/// Production wiring uses S3, PostgreSQL, FFmpeg and Redis; tests swap in
/// the in-memory adapters and a scripted codec runner.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub codec: Arc<dyn CodecRunner>,
    pub cache: Arc<dyn StreamCache>,
    pub config: WorkerConfig,
}

impl PipelineDeps {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn CatalogStore>,
        codec: Arc<dyn CodecRunner>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            codec,
            cache: Arc::new(NoopStreamCache),
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn StreamCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Wire production adapters from the environment.
    ///
    /// The stream cache is optional: without `REDIS_URL`, or when Redis is
    /// unreachable, cache warming is skipped.
    pub async fn from_env(config: WorkerConfig) -> WorkerResult<Self> {
        let store = S3ObjectStore::from_env()?;

        let catalog = PgCatalog::connect(&CatalogConfig::from_env()?).await?;
        catalog.migrate().await?;

        vod_media::check_ffmpeg()?;
        vod_media::check_ffprobe()?;
        let codec = FfmpegCodecRunner::new();

        let cache: Arc<dyn StreamCache> = match std::env::var("REDIS_URL") {
            Ok(url) => match RedisStreamCache::connect(&url).await {
                Ok(cache) => {
                    info!("Stream cache connected");
                    Arc::new(cache)
                }
                Err(e) => {
                    warn!("Stream cache unavailable, warming disabled: {}", e);
                    Arc::new(NoopStreamCache)
                }
            },
            Err(_) => Arc::new(NoopStreamCache),
        };

        Ok(Self::new(
            Arc::new(store),
            Arc::new(catalog),
            Arc::new(codec),
            config,
        )
        .with_cache(cache))
    }
}
