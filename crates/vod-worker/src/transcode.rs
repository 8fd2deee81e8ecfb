//! ABR ladder transcode engine.
//!
//! Encodes every ladder variant in one encoder invocation, writes the master
//! playlist, uploads all outputs under `videos/{id}/hls/` and only then
//! publishes one rendition row per variant.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures_util::{stream, TryStreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vod_media::fs_utils::{file_size, list_files, prepare_output_dir};
use vod_media::{HlsLadderJob, MediaError, MASTER_PLAYLIST};
use vod_models::{Rendition, StreamFormat, VideoId};
use vod_storage::keys::{cache_key, content_type_for, rendition_key};

use crate::context::PipelineDeps;
use crate::error::{WorkerError, WorkerResult};

/// Source facts the engine needs from the analyze stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceInfo {
    pub duration: f64,
    pub has_audio: bool,
}

/// Transcodes one source into an HLS ladder.
pub struct AbrEngine<'a> {
    deps: &'a PipelineDeps,
}

impl<'a> AbrEngine<'a> {
    pub fn new(deps: &'a PipelineDeps) -> Self {
        Self { deps }
    }

    /// Build the encode job for `input`, writing into `output_dir`.
    pub fn build_job(
        &self,
        video_id: &VideoId,
        input: &Path,
        output_dir: &Path,
        source: SourceInfo,
    ) -> HlsLadderJob {
        let config = &self.deps.config;
        let job = HlsLadderJob::new(
            video_id.clone(),
            input,
            output_dir,
            config.ladder.clone(),
            config.encoding.clone(),
        )
        .with_source_duration(source.duration);
        if source.has_audio {
            job
        } else {
            job.without_audio()
        }
    }

    /// Run the full transcode and return the published renditions in
    /// ladder order.
    pub async fn transcode(
        &self,
        video_id: &VideoId,
        input: &Path,
        output_dir: &Path,
        source: SourceInfo,
        cancel: watch::Receiver<bool>,
    ) -> WorkerResult<Vec<Rendition>> {
        prepare_output_dir(output_dir).await?;

        let job = self.build_job(video_id, input, output_dir, source);
        if !source.has_audio {
            info!(video_id = %video_id, "Source has no audio stream, encoding video only");
        }

        let output = self.deps.codec.run(&job, cancel).await?;
        output.into_result()?;

        job.write_master_manifest().await?;

        let sizes = self.upload_outputs(video_id, output_dir).await?;
        let renditions = self.publish(&job, &sizes).await?;
        self.warm_cache(video_id, output_dir, &job).await;

        info!(
            video_id = %video_id,
            renditions = renditions.len(),
            files = sizes.len(),
            "Transcode published"
        );
        Ok(renditions)
    }

    /// Upload every file in `output_dir`; returns each file's size by name.
    async fn upload_outputs(
        &self,
        video_id: &VideoId,
        output_dir: &Path,
    ) -> WorkerResult<HashMap<String, u64>> {
        let files = list_files(output_dir).await?;
        let store = &self.deps.store;

        let uploaded: Vec<(String, u64)> = stream::iter(files.into_iter().map(Ok::<PathBuf, WorkerError>))
            .map_ok(|path| async move {
                let filename = file_name(&path)?;
                let size = file_size(&path).await?;
                let key = rendition_key(video_id, StreamFormat::Hls, &filename);
                store
                    .upload_file(&path, &key, content_type_for(&filename))
                    .await?;
                debug!(key = %key, size, "Uploaded rendition file");
                Ok::<_, WorkerError>((filename, size))
            })
            .try_buffer_unordered(self.deps.config.upload_concurrency)
            .try_collect()
            .await?;

        Ok(uploaded.into_iter().collect())
    }

    /// Upsert one rendition per variant. Runs only after every upload
    /// succeeded, so readers never see a row whose files are missing.
    async fn publish(
        &self,
        job: &HlsLadderJob,
        sizes: &HashMap<String, u64>,
    ) -> WorkerResult<Vec<Rendition>> {
        let segment_seconds = job.encoding.segment_seconds;
        let mut renditions = Vec::with_capacity(job.ladder.len());

        for variant in job.variants() {
            if !sizes.contains_key(&variant.playlist) {
                return Err(MediaError::FileNotFound(job.output_dir.join(&variant.playlist)).into());
            }
            let size: u64 = sizes
                .iter()
                .filter(|(name, _)| variant.owns_file(name))
                .map(|(_, size)| *size)
                .sum();

            let rendition = Rendition::for_variant(
                &job.video_id,
                &variant.entry,
                StreamFormat::Hls,
                rendition_key(&job.video_id, StreamFormat::Hls, &variant.playlist),
                size,
                segment_seconds,
            );
            self.deps.catalog.upsert_rendition(&rendition).await?;
            renditions.push(rendition);
        }

        Ok(renditions)
    }

    /// Put the master and variant playlists in the stream cache. Failures
    /// are logged and ignored.
    async fn warm_cache(&self, video_id: &VideoId, output_dir: &Path, job: &HlsLadderJob) {
        let Some(ttl) = self.deps.config.cache_warm_ttl else {
            return;
        };

        let playlists = std::iter::once(MASTER_PLAYLIST.to_string())
            .chain(job.variants().into_iter().map(|v| v.playlist));

        for playlist in playlists {
            let data = match tokio::fs::read(output_dir.join(&playlist)).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        video_id = %video_id,
                        playlist = %playlist,
                        "Cannot read playlist for cache warm: {}", e
                    );
                    continue;
                }
            };
            let key = cache_key(
                StreamFormat::Hls,
                &rendition_key(video_id, StreamFormat::Hls, &playlist),
            );
            if let Err(e) = self.deps.cache.put(&key, &data, ttl).await {
                debug!(video_id = %video_id, key = %key, "Cache warm skipped: {}", e);
            }
        }
    }
}

fn file_name(path: &Path) -> WorkerResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            WorkerError::processing_failed(format!("unusable output name: {}", path.display()))
        })
}
