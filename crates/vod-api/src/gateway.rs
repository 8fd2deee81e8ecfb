//! Streaming cache gateway.
//!
//! Read side of the pipeline: video detail with signed master manifest URLs,
//! manifest/segment delivery from the stream cache with a signed-URL
//! fallback, and paged listing. The gateway never streams bytes from the
//! object store itself.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use vod_catalog::{CatalogError, CatalogStore};
use vod_models::{
    Pagination, ProcessingState, StreamFormat, VideoDetail, VideoId, VideoListing,
};
use vod_storage::keys::{cache_key, content_type_for, is_safe_filename, master_manifest_key, rendition_key};
use vod_storage::{ObjectStore, StorageError, StreamCache};

use crate::metrics;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Video not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to sign URL: {0}")]
    Signing(#[source] StorageError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl GatewayError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// A master URL is offered only when a rendition at this resolution exists
    pub reference_resolution: String,
    pub default_list_limit: u32,
    pub max_list_limit: u32,
    /// TTL of redirect URLs for cache misses
    pub segment_url_ttl: Duration,
    /// TTL of master manifest URLs in video detail
    pub master_url_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reference_resolution: "1920x1080".to_string(),
            default_list_limit: 10,
            max_list_limit: 100,
            segment_url_ttl: Duration::from_secs(3600),
            master_url_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reference_resolution: std::env::var("GATEWAY_REFERENCE_RESOLUTION")
                .unwrap_or(defaults.reference_resolution),
            default_list_limit: env_parse("GATEWAY_DEFAULT_LIST_LIMIT")
                .unwrap_or(defaults.default_list_limit)
                .max(1),
            max_list_limit: env_parse("GATEWAY_MAX_LIST_LIMIT")
                .unwrap_or(defaults.max_list_limit)
                .max(1),
            segment_url_ttl: env_parse("GATEWAY_SEGMENT_URL_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.segment_url_ttl),
            master_url_ttl: env_parse("GATEWAY_MASTER_URL_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.master_url_ttl),
        }
    }

    /// Effective paging window for the requested values.
    pub fn pagination(&self, limit: Option<u32>, offset: Option<u32>) -> Pagination {
        let limit = limit
            .filter(|l| *l > 0)
            .unwrap_or(self.default_list_limit)
            .min(self.max_list_limit);
        Pagination {
            limit,
            offset: offset.unwrap_or(0),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Outcome of a manifest or segment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamResponse {
    /// Served from the stream cache
    Bytes {
        data: Vec<u8>,
        content_type: &'static str,
    },
    /// Fetch directly from the object store
    Redirect(String),
}

/// Read-side gateway over the catalog, object store and stream cache.
#[derive(Clone)]
pub struct StreamingGateway {
    catalog: Arc<dyn CatalogStore>,
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn StreamCache>,
    config: GatewayConfig,
}

impl StreamingGateway {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        store: Arc<dyn ObjectStore>,
        cache: Arc<dyn StreamCache>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Video metadata, its renditions and signed master URLs.
    pub async fn get_video_detail(&self, video_id: &str) -> GatewayResult<VideoDetail> {
        let id = parse_video_id(video_id)?;
        let video = self
            .catalog
            .get_video(&id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(video_id.to_string()))?;
        let streams = self.catalog.list_renditions(&id).await?;

        let mut formats: Vec<StreamFormat> = Vec::new();
        for stream in &streams {
            if !formats.contains(&stream.format) {
                formats.push(stream.format);
            }
        }

        let mut hls_master = None;
        let mut dash_master = None;
        if video.processing_state != ProcessingState::Error {
            for format in &formats {
                let has_reference = streams.iter().any(|s| {
                    s.format == *format && s.resolution == self.config.reference_resolution
                });
                if !has_reference {
                    continue;
                }
                let url = self
                    .store
                    .sign(&master_manifest_key(&id, *format), self.config.master_url_ttl)
                    .await
                    .map_err(GatewayError::Signing)?;
                match format {
                    StreamFormat::Hls => hls_master = Some(url),
                    StreamFormat::Dash => dash_master = Some(url),
                }
            }
        }

        Ok(VideoDetail {
            video_id: video.id,
            title: video.title,
            duration: video.duration,
            status: video.processing_state,
            formats,
            hls_master,
            dash_master,
            streams,
            error_message: video.error_message,
            created_at: video.created_at,
        })
    }

    /// Serve a manifest or segment from cache, else redirect to a signed URL.
    pub async fn get_manifest_or_segment(
        &self,
        video_id: &str,
        format: &str,
        filename: &str,
    ) -> GatewayResult<StreamResponse> {
        let id = parse_video_id(video_id)?;
        let format: StreamFormat = format
            .parse()
            .map_err(|_| GatewayError::invalid(format!("unsupported format '{}'", format)))?;
        if !is_safe_filename(filename) {
            return Err(GatewayError::invalid(format!("invalid filename '{}'", filename)));
        }

        let key = rendition_key(&id, format, filename);
        match self.cache.get(&cache_key(format, &key)).await {
            Ok(Some(data)) => {
                metrics::record_cache_lookup("hit");
                return Ok(StreamResponse::Bytes {
                    data,
                    content_type: content_type_for(filename),
                });
            }
            Ok(None) => metrics::record_cache_lookup("miss"),
            Err(e) => {
                metrics::record_cache_lookup("error");
                warn!(key = %key, "Stream cache lookup failed, redirecting: {}", e);
            }
        }

        let url = self
            .store
            .sign(&key, self.config.segment_url_ttl)
            .await
            .map_err(GatewayError::Signing)?;
        debug!(key = %key, "Redirecting to signed URL");
        Ok(StreamResponse::Redirect(url))
    }

    /// One page of videos, newest first.
    pub async fn list_videos(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> GatewayResult<VideoListing> {
        let pagination = self.config.pagination(limit, offset);
        let videos = self
            .catalog
            .list_videos(pagination.limit, pagination.offset)
            .await?;
        if videos.is_empty() {
            return Ok(VideoListing::empty(pagination));
        }
        Ok(VideoListing { videos, pagination })
    }
}

fn parse_video_id(raw: &str) -> GatewayResult<VideoId> {
    VideoId::parse(raw).map_err(|_| GatewayError::invalid(format!("invalid video id '{}'", raw)))
}
