//! Video read and run handlers.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use vod_models::{RunRequest, VideoDetail, VideoId, VideoListing};
use vod_queue::EnqueueOutcome;

use crate::error::{ApiError, ApiResult};
use crate::gateway::StreamResponse;
use crate::metrics;
use crate::state::AppState;

/// Query parameters for the listing. Unparseable values fall back to the
/// defaults rather than failing the request.
#[derive(Debug, Default, Deserialize)]
pub struct ListVideosQuery {
    pub limit: Option<String>,
    pub offset: Option<String>,
}

/// List videos, newest first.
pub async fn list_videos(
    State(state): State<AppState>,
    Query(query): Query<ListVideosQuery>,
) -> ApiResult<Json<VideoListing>> {
    let limit = query.limit.as_deref().and_then(|s| s.trim().parse().ok());
    let offset = query.offset.as_deref().and_then(|s| s.trim().parse().ok());
    Ok(Json(state.gateway.list_videos(limit, offset).await?))
}

/// Video metadata with renditions and master manifest URLs.
pub async fn get_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<VideoDetail>> {
    Ok(Json(state.gateway.get_video_detail(&video_id).await?))
}

/// Serve a manifest or segment: bytes on a cache hit, otherwise a 307 to
/// a signed object store URL.
pub async fn stream_file(
    State(state): State<AppState>,
    Path((video_id, format, filename)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    match state
        .gateway
        .get_manifest_or_segment(&video_id, &format, &filename)
        .await?
    {
        StreamResponse::Bytes { data, content_type } => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, data.len())
            .header(header::CACHE_CONTROL, "public, max-age=60")
            .body(Body::from(data))
            .map_err(|e| ApiError::internal(format!("failed to build response: {}", e))),
        StreamResponse::Redirect(url) => Ok(Redirect::temporary(&url).into_response()),
    }
}

/// Optional body of a run request. Required only when the catalog has no
/// record of the video yet.
#[derive(Debug, Default, Deserialize)]
pub struct StartRunBody {
    pub object_key: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub video_id: String,
    /// `enqueued` or `duplicate`
    pub status: String,
}

/// Enqueue a pipeline run for a video.
pub async fn start_run(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    body: Option<Json<StartRunBody>>,
) -> ApiResult<(StatusCode, Json<StartRunResponse>)> {
    let id = VideoId::parse(&video_id)
        .map_err(|_| ApiError::bad_request(format!("invalid video id '{}'", video_id)))?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let request = match state.catalog.get_video(&id).await? {
        Some(video) if video.is_terminal() => {
            return Err(ApiError::Conflict(format!(
                "video {} is already {}",
                id, video.processing_state
            )));
        }
        Some(video) => RunRequest::new(
            id.clone(),
            video.original_path,
            video.original_name,
            video.content_type,
        ),
        None => {
            let object_key = body
                .object_key
                .ok_or_else(|| ApiError::not_found(format!("video {}", id)))?;
            let filename = body.filename.unwrap_or_else(|| {
                object_key.rsplit('/').next().unwrap_or(&object_key).to_string()
            });
            RunRequest::new(
                id.clone(),
                object_key,
                filename,
                body.content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            )
        }
    };

    let status = match state.runs.submit(request).await? {
        EnqueueOutcome::Enqueued(message_id) => {
            info!(video_id = %id, message_id = %message_id, "Run enqueued");
            metrics::record_run_enqueued("enqueued");
            "enqueued"
        }
        EnqueueOutcome::Duplicate => {
            info!(video_id = %id, "Run already queued");
            metrics::record_run_enqueued("duplicate");
            "duplicate"
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            video_id: id.to_string(),
            status: status.to_string(),
        }),
    ))
}
