//! Source upload handler.

use std::path::{Path, PathBuf};

use axum::extract::{Multipart, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use vod_models::{RunRequest, Video, VideoId};
use vod_storage::keys::upload_key;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

/// Multipart field carrying the source file.
pub const UPLOAD_FIELD: &str = "video";

#[derive(Debug, Serialize, Deserialize)]
pub struct VideoUploadResponse {
    pub video_id: String,
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub status: String,
    pub message: String,
    pub timestamp: String,
}

/// Accept a source video, store it and schedule transcoding.
pub async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<VideoUploadResponse>> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let content_type = field.content_type().unwrap_or_default().to_string();
        if !state.config.accepts_upload_type(&content_type) {
            return Err(ApiError::UnsupportedMediaType(format!(
                "'{}' is not an accepted video format",
                content_type
            )));
        }
        let filename = field
            .file_name()
            .filter(|n| !n.is_empty())
            .unwrap_or("upload")
            .to_string();

        let video_id = VideoId::new();
        let spool = SpoolFile::new(state.config.upload_tmp_dir.join(format!("{}.upload", video_id)));

        let mut file = tokio::fs::File::create(spool.path())
            .await
            .map_err(|e| ApiError::internal(format!("failed to create spool file: {}", e)))?;
        let mut size: u64 = 0;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::bad_request(format!("upload interrupted: {}", e)))?
        {
            size += chunk.len() as u64;
            if size > state.config.max_upload_size as u64 {
                return Err(ApiError::PayloadTooLarge(format!(
                    "uploads are limited to {} bytes",
                    state.config.max_upload_size
                )));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| ApiError::internal(format!("failed to spool upload: {}", e)))?;
        }
        file.flush()
            .await
            .map_err(|e| ApiError::internal(format!("failed to spool upload: {}", e)))?;
        drop(file);

        if size == 0 {
            return Err(ApiError::bad_request("uploaded file is empty"));
        }

        let object_key = upload_key(&video_id, &filename);
        state
            .store
            .upload_file(spool.path(), &object_key, &content_type)
            .await?;
        metrics::record_upload(size);

        let video = Video::new(
            video_id.clone(),
            filename.as_str(),
            object_key.as_str(),
            content_type.as_str(),
        )
        .with_size(size);
        state.catalog.create_video(&video).await?;

        info!(video_id = %video_id, size, key = %object_key, "Source uploaded");

        let request = RunRequest::new(
            video_id.clone(),
            object_key,
            filename.as_str(),
            content_type.as_str(),
        );
        // The source is stored either way; a failed submission can be
        // retried through the runs endpoint.
        let message = match state.runs.submit(request).await {
            Ok(_) => {
                metrics::record_run_enqueued("enqueued");
                "Video uploaded successfully and scheduled for transcoding".to_string()
            }
            Err(e) => {
                error!(video_id = %video_id, "Failed to enqueue transcoding run: {}", e);
                "Video uploaded but transcoding could not be scheduled".to_string()
            }
        };

        return Ok(Json(VideoUploadResponse {
            video_id: video_id.to_string(),
            filename,
            size,
            content_type,
            status: "uploaded".to_string(),
            message,
            timestamp: Utc::now().to_rfc3339(),
        }));
    }

    Err(ApiError::bad_request(format!(
        "missing multipart field '{}'",
        UPLOAD_FIELD
    )))
}

/// Spooled upload removed on drop.
struct SpoolFile(PathBuf);

impl SpoolFile {
    fn new(path: PathBuf) -> Self {
        Self(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), "Failed to remove spooled upload: {}", e);
            }
        }
    }
}
