//! In-process catalog for tests and single-node development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use vod_models::{PipelineRun, ProcessingState, Rendition, StreamFormat, Video, VideoId};

use crate::error::{CatalogError, CatalogResult};
use crate::store::{sort_renditions, CatalogStore};

type RenditionKey = (VideoId, String, StreamFormat);

#[derive(Default)]
struct Tables {
    videos: HashMap<VideoId, Video>,
    renditions: HashMap<RenditionKey, Rendition>,
    runs: HashMap<VideoId, PipelineRun>,
    /// Every distinct state each video has been in, oldest first
    history: HashMap<VideoId, Vec<ProcessingState>>,
}

/// [`CatalogStore`] held in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    tables: RwLock<Tables>,
    failing_state_writes: AtomicU32,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` state writes fail with a transient error.
    pub fn fail_next_state_writes(&self, n: u32) {
        self.failing_state_writes.store(n, Ordering::SeqCst);
    }

    pub async fn rendition_count(&self) -> usize {
        self.tables.read().await.renditions.len()
    }

    /// States a video has moved through, starting with the state it was
    /// created in. Repeated writes of the current state are not recorded.
    pub async fn state_history(&self, id: &VideoId) -> Vec<ProcessingState> {
        self.tables
            .read()
            .await
            .history
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    fn take_injected_failure(&self) -> CatalogResult<()> {
        let took = self
            .failing_state_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(CatalogError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    async fn modify<F>(&self, id: &VideoId, f: F) -> CatalogResult<()>
    where
        F: FnOnce(&mut Video) -> CatalogResult<()> + Send,
    {
        let mut tables = self.tables.write().await;
        let video = tables
            .videos
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound(id.clone()))?;
        let before = video.processing_state;
        f(video)?;
        video.updated_at = Utc::now();
        let after = video.processing_state;
        if after != before {
            tables.history.entry(id.clone()).or_default().push(after);
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn create_video(&self, video: &Video) -> CatalogResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.videos.contains_key(&video.id) {
            return Ok(false);
        }
        tables.videos.insert(video.id.clone(), video.clone());
        tables
            .history
            .insert(video.id.clone(), vec![video.processing_state]);
        Ok(true)
    }

    async fn get_video(&self, id: &VideoId) -> CatalogResult<Option<Video>> {
        Ok(self.tables.read().await.videos.get(id).cloned())
    }

    async fn update_state(&self, id: &VideoId, state: ProcessingState) -> CatalogResult<()> {
        self.take_injected_failure()?;
        self.modify(id, |video| {
            let current = video.processing_state;
            if !current.can_transition_to(state) {
                return Err(CatalogError::invalid_transition(id, current, state));
            }
            video.processing_state = state;
            Ok(())
        })
        .await
    }

    async fn set_size(&self, id: &VideoId, size: u64) -> CatalogResult<()> {
        self.modify(id, |video| {
            video.size = size;
            Ok(())
        })
        .await
    }

    async fn set_duration(&self, id: &VideoId, duration: f64) -> CatalogResult<()> {
        self.modify(id, |video| {
            video.duration = duration;
            Ok(())
        })
        .await
    }

    async fn mark_error(&self, id: &VideoId, reason: &str) -> CatalogResult<()> {
        self.take_injected_failure()?;
        self.modify(id, |video| {
            let current = video.processing_state;
            if !current.can_transition_to(ProcessingState::Error) {
                return Err(CatalogError::invalid_transition(
                    id,
                    current,
                    ProcessingState::Error,
                ));
            }
            video.processing_state = ProcessingState::Error;
            video.error_message = Some(reason.to_string());
            Ok(())
        })
        .await
    }

    async fn upsert_rendition(&self, rendition: &Rendition) -> CatalogResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.videos.contains_key(&rendition.video_id) {
            return Err(CatalogError::NotFound(rendition.video_id.clone()));
        }
        let key = rendition.natural_key();
        match tables.renditions.get_mut(&key) {
            Some(existing) => {
                existing.bitrate = rendition.bitrate.clone();
                existing.path = rendition.path.clone();
                existing.size = rendition.size;
                existing.segment_size = rendition.segment_size;
            }
            None => {
                tables.renditions.insert(key, rendition.clone());
            }
        }
        Ok(())
    }

    async fn list_renditions(&self, id: &VideoId) -> CatalogResult<Vec<Rendition>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Rendition> = tables
            .renditions
            .values()
            .filter(|r| &r.video_id == id)
            .cloned()
            .collect();
        sort_renditions(&mut rows);
        Ok(rows)
    }

    async fn list_videos(&self, limit: u32, offset: u32) -> CatalogResult<Vec<Video>> {
        let tables = self.tables.read().await;
        let mut videos: Vec<Video> = tables.videos.values().cloned().collect();
        videos.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(videos
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn save_run(&self, run: &PipelineRun) -> CatalogResult<()> {
        self.tables
            .write()
            .await
            .runs
            .insert(run.video_id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, id: &VideoId) -> CatalogResult<Option<PipelineRun>> {
        Ok(self.tables.read().await.runs.get(id).cloned())
    }

    async fn delete_run(&self, id: &VideoId) -> CatalogResult<()> {
        self.tables.write().await.runs.remove(id);
        Ok(())
    }

    async fn list_runs(&self) -> CatalogResult<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self.tables.read().await.runs.values().cloned().collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vod_models::{LadderEntry, RunRequest, Stage};

    fn video(id: &str) -> Video {
        Video::new(
            VideoId::from(id),
            "movie.mp4",
            format!("uploads/{id}/{id}.mp4"),
            "video/mp4",
        )
    }

    #[tokio::test]
    async fn test_create_video_is_insert_if_absent() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.create_video(&video("a")).await.unwrap());
        let mut again = video("a");
        again.title = "changed".into();
        assert!(!catalog.create_video(&again).await.unwrap());
        let stored = catalog.get_video(&VideoId::from("a")).await.unwrap().unwrap();
        assert_eq!(stored.title, "movie");
    }

    #[tokio::test]
    async fn test_state_writes_are_guarded() {
        let catalog = MemoryCatalog::new();
        let id = VideoId::from("a");
        catalog.create_video(&video("a")).await.unwrap();

        catalog.update_state(&id, ProcessingState::Downloading).await.unwrap();
        catalog.update_state(&id, ProcessingState::Downloading).await.unwrap();
        let err = catalog
            .update_state(&id, ProcessingState::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidTransition { .. }));

        catalog.mark_error(&id, "boom").await.unwrap();
        let stored = catalog.get_video(&id).await.unwrap().unwrap();
        assert_eq!(stored.processing_state, ProcessingState::Error);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));

        assert!(catalog
            .update_state(&id, ProcessingState::Analyzing)
            .await
            .is_err());
        assert!(catalog.mark_error(&id, "again").await.is_err());

        assert_eq!(
            catalog.state_history(&id).await,
            vec![
                ProcessingState::Received,
                ProcessingState::Downloading,
                ProcessingState::Error,
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_video_is_not_found() {
        let catalog = MemoryCatalog::new();
        let err = catalog
            .update_state(&VideoId::from("nope"), ProcessingState::Downloading)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let catalog = MemoryCatalog::new();
        let id = VideoId::from("a");
        catalog.create_video(&video("a")).await.unwrap();
        catalog.fail_next_state_writes(1);
        let err = catalog.mark_error(&id, "x").await.unwrap_err();
        assert!(err.is_retryable());
        catalog.mark_error(&id, "x").await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_rendition_keeps_one_row_per_key() {
        let catalog = MemoryCatalog::new();
        let id = VideoId::from("a");
        catalog.create_video(&video("a")).await.unwrap();
        let entry = LadderEntry::new(1280, 720, "2500k");

        let first = Rendition::for_variant(&id, &entry, StreamFormat::Hls, "p1", 100, 10);
        let second = Rendition::for_variant(&id, &entry, StreamFormat::Hls, "p1", 250, 10);
        catalog.upsert_rendition(&first).await.unwrap();
        catalog.upsert_rendition(&second).await.unwrap();

        let rows = catalog.list_renditions(&id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].size, 250);
    }

    #[tokio::test]
    async fn test_list_videos_newest_first_with_paging() {
        let catalog = MemoryCatalog::new();
        let base = Utc::now();
        for (i, id) in ["old", "mid", "new"].iter().enumerate() {
            let mut v = video(id);
            v.created_at = base + Duration::seconds(i as i64);
            catalog.create_video(&v).await.unwrap();
        }

        let page: Vec<String> = catalog
            .list_videos(2, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.id.0)
            .collect();
        assert_eq!(page, vec!["new", "mid"]);

        let rest = catalog.list_videos(10, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id.as_str(), "old");
        assert!(catalog.list_videos(10, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_persistence() {
        let catalog = MemoryCatalog::new();
        let id = VideoId::from("a");
        let mut run = PipelineRun::new(RunRequest::new(
            id.clone(),
            "uploads/a/a.mp4",
            "movie.mp4",
            "video/mp4",
        ));
        run.record_attempt(Stage::Download);
        catalog.save_run(&run).await.unwrap();

        let loaded = catalog.load_run(&id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts_for(Stage::Download), 1);
        assert_eq!(catalog.list_runs().await.unwrap().len(), 1);

        catalog.delete_run(&id).await.unwrap();
        assert!(catalog.load_run(&id).await.unwrap().is_none());
    }
}
