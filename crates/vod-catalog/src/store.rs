//! The catalog capability.

use async_trait::async_trait;
use vod_models::{PipelineRun, ProcessingState, Rendition, Video, VideoId};

use crate::error::CatalogResult;

/// Durable record of videos, their renditions and in-flight pipeline runs.
///
/// State writes are guarded: [`CatalogStore::update_state`] and
/// [`CatalogStore::mark_error`] only succeed when the stored state may
/// legally move to the requested one, so a late or replayed write can
/// never move a video backwards or out of a terminal state.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert a video if no row with its id exists. Returns `true` when a
    /// row was created.
    async fn create_video(&self, video: &Video) -> CatalogResult<bool>;

    async fn get_video(&self, id: &VideoId) -> CatalogResult<Option<Video>>;

    /// Move a video to `state`. Re-writing the current non-terminal state
    /// is a no-op success.
    async fn update_state(&self, id: &VideoId, state: ProcessingState) -> CatalogResult<()>;

    async fn set_size(&self, id: &VideoId, size: u64) -> CatalogResult<()>;

    async fn set_duration(&self, id: &VideoId, duration: f64) -> CatalogResult<()>;

    /// Move a video to `error` and record why.
    async fn mark_error(&self, id: &VideoId, reason: &str) -> CatalogResult<()>;

    /// Insert or update a rendition on `(video_id, resolution, format)`.
    async fn upsert_rendition(&self, rendition: &Rendition) -> CatalogResult<()>;

    /// Renditions of a video, grouped by format, largest first.
    async fn list_renditions(&self, id: &VideoId) -> CatalogResult<Vec<Rendition>>;

    /// Videos ordered by `created_at` descending.
    async fn list_videos(&self, limit: u32, offset: u32) -> CatalogResult<Vec<Video>>;

    async fn save_run(&self, run: &PipelineRun) -> CatalogResult<()>;

    async fn load_run(&self, id: &VideoId) -> CatalogResult<Option<PipelineRun>>;

    async fn delete_run(&self, id: &VideoId) -> CatalogResult<()>;

    /// Runs that were persisted but never finished, oldest first.
    async fn list_runs(&self) -> CatalogResult<Vec<PipelineRun>>;

    async fn check_connectivity(&self) -> CatalogResult<()> {
        Ok(())
    }
}

/// Pixel count of a "WxH" resolution, 0 when malformed.
pub fn resolution_area(resolution: &str) -> u64 {
    resolution
        .split_once('x')
        .and_then(|(w, h)| w.parse::<u64>().ok()?.checked_mul(h.parse::<u64>().ok()?))
        .unwrap_or(0)
}

/// Canonical rendition order shared by all catalog backends.
pub fn sort_renditions(renditions: &mut [Rendition]) {
    renditions.sort_by(|a, b| {
        a.format
            .as_str()
            .cmp(b.format.as_str())
            .then_with(|| resolution_area(&b.resolution).cmp(&resolution_area(&a.resolution)))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use vod_models::{LadderEntry, StreamFormat};

    #[test]
    fn test_resolution_area() {
        assert_eq!(resolution_area("1920x1080"), 1920 * 1080);
        assert_eq!(resolution_area("garbage"), 0);
        assert_eq!(resolution_area("10xq"), 0);
        assert_eq!(resolution_area("18446744073709551615x2"), 0);
    }

    #[test]
    fn test_sort_renditions_largest_first() {
        let id = VideoId::from("v");
        let mut rows: Vec<Rendition> = ["640x360", "1920x1080", "854x480"]
            .iter()
            .map(|res| {
                let (w, h) = res.split_once('x').unwrap();
                let entry = LadderEntry::new(w.parse().unwrap(), h.parse().unwrap(), "1000k");
                Rendition::for_variant(&id, &entry, StreamFormat::Hls, "p", 1, 10)
            })
            .collect();
        sort_renditions(&mut rows);
        let order: Vec<_> = rows.iter().map(|r| r.resolution.as_str()).collect();
        assert_eq!(order, vec!["1920x1080", "854x480", "640x360"]);
    }
}
