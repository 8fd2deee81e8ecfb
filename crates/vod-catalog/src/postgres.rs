//! PostgreSQL-backed catalog.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use vod_models::{PipelineRun, ProcessingState, Rendition, Video, VideoId};

use crate::error::{CatalogError, CatalogResult};
use crate::metrics::record_request;
use crate::retry::{with_retry, RetryConfig};
use crate::store::{sort_renditions, CatalogStore};

/// SQLSTATE for foreign key violations.
const FOREIGN_KEY_VIOLATION: &str = "23503";

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS videos (
        id               TEXT PRIMARY KEY,
        title            TEXT NOT NULL,
        original_name    TEXT NOT NULL,
        original_path    TEXT NOT NULL,
        processing_state TEXT NOT NULL DEFAULT 'received',
        duration         DOUBLE PRECISION NOT NULL DEFAULT 0,
        size             BIGINT NOT NULL DEFAULT 0,
        content_type     TEXT NOT NULL,
        error_message    TEXT,
        created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_videos_created_at ON videos (created_at DESC, id DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS video_streams (
        id           TEXT PRIMARY KEY,
        video_id     TEXT NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
        resolution   TEXT NOT NULL,
        bitrate      TEXT NOT NULL,
        format       TEXT NOT NULL,
        path         TEXT NOT NULL,
        size         BIGINT NOT NULL DEFAULT 0,
        segment_size INTEGER NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (video_id, resolution, format)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        video_id   TEXT PRIMARY KEY,
        stage      TEXT NOT NULL,
        payload    TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Connection settings for [`PgCatalog`].
#[derive(Clone)]
pub struct CatalogConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl fmt::Debug for CatalogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogConfig")
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("retry", &self.retry)
            .finish()
    }
}

impl CatalogConfig {
    /// Load from `DATABASE_URL`, `DB_MAX_CONNECTIONS` and
    /// `DB_ACQUIRE_TIMEOUT_SECS`.
    pub fn from_env() -> CatalogResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| CatalogError::config("DATABASE_URL environment variable not set"))?;

        Ok(Self {
            database_url,
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            acquire_timeout_secs: std::env::var("DB_ACQUIRE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            retry: RetryConfig::from_env(),
        })
    }
}

/// [`CatalogStore`] on PostgreSQL.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
    retry: RetryConfig,
}

impl PgCatalog {
    /// Open a pool using `config`.
    pub async fn connect(config: &CatalogConfig) -> CatalogResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.database_url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "Connected to catalog database"
        );

        Ok(Self::from_pool(pool, config.retry.clone()))
    }

    pub fn from_pool(pool: PgPool, retry: RetryConfig) -> Self {
        Self { pool, retry }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> CatalogResult<()> {
        for statement in MIGRATIONS.iter().copied() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Catalog schema is up to date");
        Ok(())
    }

    async fn timed<T, F, Fut>(&self, operation: &str, op: F) -> CatalogResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CatalogResult<T>>,
    {
        let start = Instant::now();
        let result = with_retry(&self.retry, operation, op).await;
        record_request(
            operation,
            result.is_ok(),
            start.elapsed().as_secs_f64() * 1000.0,
        );
        result
    }

    async fn insert_video(&self, video: &Video) -> CatalogResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO videos (id, title, original_name, original_path, processing_state,
                                duration, size, content_type, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(video.id.as_str())
        .bind(&video.title)
        .bind(&video.original_name)
        .bind(&video.original_path)
        .bind(video.processing_state.as_str())
        .bind(video.duration)
        .bind(video.size as i64)
        .bind(&video.content_type)
        .bind(video.error_message.as_deref())
        .bind(video.created_at)
        .bind(video.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn select_video(&self, id: &VideoId) -> CatalogResult<Option<Video>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, original_name, original_path, processing_state, duration,
                   size, content_type, error_message, created_at, updated_at
            FROM videos WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(video_from_row).transpose()
    }

    async fn select_state(&self, id: &VideoId) -> CatalogResult<Option<ProcessingState>> {
        let row = sqlx::query("SELECT processing_state FROM videos WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let state: String = row.try_get("processing_state")?;
                Ok(Some(state.parse()?))
            }
            None => Ok(None),
        }
    }

    /// Guarded state write. The `WHERE` clause admits only legal
    /// predecessors, so concurrent writers cannot regress the state.
    async fn write_state(
        &self,
        id: &VideoId,
        state: ProcessingState,
        error_message: Option<&str>,
    ) -> CatalogResult<()> {
        let allowed: Vec<String> = ProcessingState::predecessors_of(state)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE videos
            SET processing_state = $2,
                error_message = COALESCE($3, error_message),
                updated_at = NOW()
            WHERE id = $1 AND processing_state = ANY($4)
            "#,
        )
        .bind(id.as_str())
        .bind(state.as_str())
        .bind(error_message)
        .bind(allowed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.select_state(id).await? {
            Some(current) => Err(CatalogError::invalid_transition(id, current, state)),
            None => Err(CatalogError::NotFound(id.clone())),
        }
    }

    async fn write_column(&self, id: &VideoId, sql: &'static str, value: Scalar) -> CatalogResult<()> {
        let query = sqlx::query(sql).bind(id.as_str());
        let query = match value {
            Scalar::Int(v) => query.bind(v),
            Scalar::Float(v) => query.bind(v),
        };
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn write_rendition(&self, r: &Rendition) -> CatalogResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO video_streams (id, video_id, resolution, bitrate, format, path,
                                       size, segment_size, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (video_id, resolution, format) DO UPDATE
            SET bitrate = EXCLUDED.bitrate,
                path = EXCLUDED.path,
                size = EXCLUDED.size,
                segment_size = EXCLUDED.segment_size
            "#,
        )
        .bind(&r.id)
        .bind(r.video_id.as_str())
        .bind(&r.resolution)
        .bind(&r.bitrate)
        .bind(r.format.as_str())
        .bind(&r.path)
        .bind(r.size as i64)
        .bind(r.segment_size as i32)
        .bind(r.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                Err(CatalogError::NotFound(r.video_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn select_renditions(&self, id: &VideoId) -> CatalogResult<Vec<Rendition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, video_id, resolution, bitrate, format, path, size, segment_size, created_at
            FROM video_streams WHERE video_id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut renditions = rows
            .iter()
            .map(rendition_from_row)
            .collect::<CatalogResult<Vec<_>>>()?;
        sort_renditions(&mut renditions);
        Ok(renditions)
    }

    async fn select_videos(&self, limit: u32, offset: u32) -> CatalogResult<Vec<Video>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, original_name, original_path, processing_state, duration,
                   size, content_type, error_message, created_at, updated_at
            FROM videos
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(video_from_row).collect()
    }

    async fn write_run(&self, run: &PipelineRun) -> CatalogResult<()> {
        let payload = serde_json::to_string(run)?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (video_id, stage, payload, started_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (video_id) DO UPDATE
            SET stage = EXCLUDED.stage,
                payload = EXCLUDED.payload,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(run.video_id.as_str())
        .bind(run.stage.as_str())
        .bind(payload)
        .bind(run.started_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_run(&self, id: &VideoId) -> CatalogResult<Option<PipelineRun>> {
        let row = sqlx::query("SELECT payload FROM pipeline_runs WHERE video_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn remove_run(&self, id: &VideoId) -> CatalogResult<()> {
        sqlx::query("DELETE FROM pipeline_runs WHERE video_id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select_runs(&self) -> CatalogResult<Vec<PipelineRun>> {
        let rows = sqlx::query("SELECT payload FROM pipeline_runs ORDER BY started_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> CatalogResult<PipelineRun> {
                let payload: String = row.try_get("payload")?;
                Ok(serde_json::from_str(&payload)?)
            })
            .collect()
    }
}

#[derive(Clone, Copy)]
enum Scalar {
    Int(i64),
    Float(f64),
}

fn video_from_row(row: &PgRow) -> CatalogResult<Video> {
    let id: String = row.try_get("id")?;
    let state: String = row.try_get("processing_state")?;
    let size: i64 = row.try_get("size")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Video {
        id: VideoId::from(id),
        title: row.try_get("title")?,
        original_name: row.try_get("original_name")?,
        original_path: row.try_get("original_path")?,
        processing_state: state.parse()?,
        duration: row.try_get("duration")?,
        size: size.max(0) as u64,
        content_type: row.try_get("content_type")?,
        error_message: row.try_get("error_message")?,
        created_at,
        updated_at,
    })
}

fn rendition_from_row(row: &PgRow) -> CatalogResult<Rendition> {
    let video_id: String = row.try_get("video_id")?;
    let format: String = row.try_get("format")?;
    let size: i64 = row.try_get("size")?;
    let segment_size: i32 = row.try_get("segment_size")?;

    Ok(Rendition {
        id: row.try_get("id")?,
        video_id: VideoId::from(video_id),
        resolution: row.try_get("resolution")?,
        bitrate: row.try_get("bitrate")?,
        format: format.parse()?,
        path: row.try_get("path")?,
        size: size.max(0) as u64,
        segment_size: segment_size.max(0) as u32,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn create_video(&self, video: &Video) -> CatalogResult<bool> {
        self.timed("create_video", || self.insert_video(video)).await
    }

    async fn get_video(&self, id: &VideoId) -> CatalogResult<Option<Video>> {
        self.timed("get_video", || self.select_video(id)).await
    }

    async fn update_state(&self, id: &VideoId, state: ProcessingState) -> CatalogResult<()> {
        self.timed("update_state", || self.write_state(id, state, None))
            .await
    }

    async fn set_size(&self, id: &VideoId, size: u64) -> CatalogResult<()> {
        self.timed("set_size", || {
            self.write_column(
                id,
                "UPDATE videos SET size = $2, updated_at = NOW() WHERE id = $1",
                Scalar::Int(size as i64),
            )
        })
        .await
    }

    async fn set_duration(&self, id: &VideoId, duration: f64) -> CatalogResult<()> {
        self.timed("set_duration", || {
            self.write_column(
                id,
                "UPDATE videos SET duration = $2, updated_at = NOW() WHERE id = $1",
                Scalar::Float(duration),
            )
        })
        .await
    }

    async fn mark_error(&self, id: &VideoId, reason: &str) -> CatalogResult<()> {
        self.timed("mark_error", || {
            self.write_state(id, ProcessingState::Error, Some(reason))
        })
        .await
    }

    async fn upsert_rendition(&self, rendition: &Rendition) -> CatalogResult<()> {
        self.timed("upsert_rendition", || self.write_rendition(rendition))
            .await
    }

    async fn list_renditions(&self, id: &VideoId) -> CatalogResult<Vec<Rendition>> {
        self.timed("list_renditions", || self.select_renditions(id))
            .await
    }

    async fn list_videos(&self, limit: u32, offset: u32) -> CatalogResult<Vec<Video>> {
        self.timed("list_videos", || self.select_videos(limit, offset))
            .await
    }

    async fn save_run(&self, run: &PipelineRun) -> CatalogResult<()> {
        self.timed("save_run", || self.write_run(run)).await
    }

    async fn load_run(&self, id: &VideoId) -> CatalogResult<Option<PipelineRun>> {
        self.timed("load_run", || self.select_run(id)).await
    }

    async fn delete_run(&self, id: &VideoId) -> CatalogResult<()> {
        self.timed("delete_run", || self.remove_run(id)).await
    }

    async fn list_runs(&self) -> CatalogResult<Vec<PipelineRun>> {
        self.timed("list_runs", || self.select_runs()).await
    }

    async fn check_connectivity(&self) -> CatalogResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vod_models::{LadderEntry, RunRequest, Stage, StreamFormat};

    async fn catalog() -> PgCatalog {
        let config = CatalogConfig::from_env().expect("DATABASE_URL must be set");
        let catalog = PgCatalog::connect(&config).await.unwrap();
        catalog.migrate().await.unwrap();
        catalog
    }

    #[test]
    fn test_config_debug_redacts_url() {
        let config = CatalogConfig {
            database_url: "postgres://user:secret@db/vod".into(),
            max_connections: 4,
            acquire_timeout_secs: 1,
            retry: RetryConfig::default(),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("REDACTED"));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn test_guarded_state_writes() {
        let catalog = catalog().await;
        let id = VideoId::new();
        let video = Video::new(id.clone(), "a.mp4", "uploads/a/a.mp4", "video/mp4");
        assert!(catalog.create_video(&video).await.unwrap());
        assert!(!catalog.create_video(&video).await.unwrap());

        catalog.update_state(&id, ProcessingState::Downloading).await.unwrap();
        catalog.update_state(&id, ProcessingState::Downloading).await.unwrap();
        assert!(matches!(
            catalog.update_state(&id, ProcessingState::Completed).await,
            Err(CatalogError::InvalidTransition { .. })
        ));

        catalog.mark_error(&id, "probe failed").await.unwrap();
        let stored = catalog.get_video(&id).await.unwrap().unwrap();
        assert_eq!(stored.processing_state, ProcessingState::Error);
        assert_eq!(stored.error_message.as_deref(), Some("probe failed"));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn test_rendition_upsert_and_runs() {
        let catalog = catalog().await;
        let id = VideoId::new();
        let video = Video::new(id.clone(), "a.mp4", "uploads/a/a.mp4", "video/mp4");
        catalog.create_video(&video).await.unwrap();

        let entry = LadderEntry::new(1920, 1080, "5000k");
        let r = Rendition::for_variant(&id, &entry, StreamFormat::Hls, "p", 10, 10);
        catalog.upsert_rendition(&r).await.unwrap();
        catalog.upsert_rendition(&r).await.unwrap();
        assert_eq!(catalog.list_renditions(&id).await.unwrap().len(), 1);

        let mut run = PipelineRun::new(RunRequest::new(id.clone(), "k", "a.mp4", "video/mp4"));
        run.record_attempt(Stage::Download);
        catalog.save_run(&run).await.unwrap();
        let loaded = catalog.load_run(&id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts_for(Stage::Download), 1);
        catalog.delete_run(&id).await.unwrap();
        assert!(catalog.load_run(&id).await.unwrap().is_none());
    }
}
