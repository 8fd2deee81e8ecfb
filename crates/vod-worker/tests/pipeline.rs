//! End-to-end pipeline runs against in-memory adapters and a scripted
//! codec runner.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use vod_catalog::{CatalogStore, MemoryCatalog};
use vod_media::{CodecOutput, CodecRunner, HlsLadderJob, MediaError, MediaInfo, MediaResult};
use vod_models::{
    Ladder, PipelineRun, ProcessingState, RunRequest, Stage, StreamFormat, Video, VideoId,
};
use vod_storage::keys::{cache_key, master_manifest_key};
use vod_storage::{MemoryObjectStore, MemoryStreamCache, ObjectStore, StreamCache};
use vod_worker::{
    ErrorClass, Orchestrator, PipelineDeps, RetryPolicy, RunOutcome, StagePolicies, StartOutcome,
    WorkerConfig, WorkerError,
};

enum Script {
    Succeed,
    Fail(&'static str),
    /// Block until cancelled
    Hang,
}

struct ScriptedCodec {
    script: Mutex<VecDeque<Script>>,
    has_audio: bool,
    runs: AtomicU32,
    probes: AtomicU32,
    last_job: Mutex<Option<HlsLadderJob>>,
}

impl ScriptedCodec {
    fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            has_audio: true,
            runs: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            last_job: Mutex::new(None),
        }
    }

    fn without_audio(mut self) -> Self {
        self.has_audio = false;
        self
    }

    fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodecRunner for ScriptedCodec {
    async fn probe(&self, _input: &Path) -> MediaResult<MediaInfo> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(MediaInfo {
            duration: 12.5,
            width: 1920,
            height: 1080,
            fps: 30.0,
            codec: "h264".to_string(),
            audio_codec: self.has_audio.then(|| "aac".to_string()),
            size: 2048,
            bitrate: 1_000_000,
        })
    }

    async fn run(
        &self,
        job: &HlsLadderJob,
        mut cancel: watch::Receiver<bool>,
    ) -> MediaResult<CodecOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_job.lock().unwrap() = Some(job.clone());
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Script::Succeed);

        match step {
            Script::Succeed => {
                for variant in job.variants() {
                    let segments = ["000", "001"];
                    let mut playlist = String::from("#EXTM3U\n");
                    for seq in segments {
                        let segment = format!("{}_{}.ts", variant.name, seq);
                        tokio::fs::write(job.output_dir.join(&segment), b"segment-data")
                            .await?;
                        playlist.push_str(&format!("#EXTINF:6.0,\n{}\n", segment));
                    }
                    tokio::fs::write(job.output_dir.join(&variant.playlist), playlist).await?;
                }
                Ok(CodecOutput {
                    exit_code: Some(0),
                    ..Default::default()
                })
            }
            Script::Fail(stderr) => Ok(CodecOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: stderr.to_string(),
            }),
            Script::Hang => {
                while !*cancel.borrow_and_update() {
                    if cancel.changed().await.is_err() {
                        break;
                    }
                }
                Err(MediaError::Cancelled)
            }
        }
    }
}

struct Harness {
    store: Arc<MemoryObjectStore>,
    catalog: Arc<MemoryCatalog>,
    cache: Arc<MemoryStreamCache>,
    codec: Arc<ScriptedCodec>,
    orchestrator: Orchestrator,
    work_dir: tempfile::TempDir,
}

fn fast_policies() -> StagePolicies {
    StagePolicies::uniform(
        RetryPolicy::stage_default()
            .with_intervals(Duration::from_millis(1), Duration::from_millis(5))
            .with_timeout(Duration::from_secs(10)),
    )
}

fn harness(codec: ScriptedCodec) -> Harness {
    harness_with_ladder(codec, Ladder::default())
}

fn harness_with_ladder(codec: ScriptedCodec, ladder: Ladder) -> Harness {
    let work_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let catalog = Arc::new(MemoryCatalog::new());
    let cache = Arc::new(MemoryStreamCache::new());
    let codec = Arc::new(codec);

    let config = WorkerConfig {
        work_dir: work_dir.path().to_path_buf(),
        policies: fast_policies(),
        ladder,
        ..WorkerConfig::default()
    };
    let deps = PipelineDeps::new(store.clone(), catalog.clone(), codec.clone(), config)
        .with_cache(cache.clone());

    Harness {
        store,
        catalog,
        cache,
        codec,
        orchestrator: Orchestrator::new(deps),
        work_dir,
    }
}

async fn upload(h: &Harness, id: &str) -> RunRequest {
    let key = format!("uploads/{id}/{id}.mp4");
    h.store
        .put(&key, b"source-bytes".to_vec(), "video/mp4")
        .await
        .unwrap();
    RunRequest::new(VideoId::from(id), key, "holiday.mp4", "video/mp4")
}

async fn run_to_end(h: &Harness, request: RunRequest) -> vod_worker::RunReport {
    match h.orchestrator.start_run(request).await.unwrap() {
        StartOutcome::Started(handle) => handle.wait().await,
        other => panic!("expected a started run, got {:?}", other),
    }
}

#[tokio::test]
async fn test_successful_run_publishes_full_ladder() {
    let h = harness(ScriptedCodec::new(vec![]));
    let request = upload(&h, "vid1").await;
    let video_id = request.video_id.clone();

    let report = run_to_end(&h, request).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.renditions.len(), 4);

    let video = h.catalog.get_video(&video_id).await.unwrap().unwrap();
    assert_eq!(video.processing_state, ProcessingState::Completed);
    assert_eq!(
        h.catalog.state_history(&video_id).await,
        [
            ProcessingState::Received,
            ProcessingState::Downloading,
            ProcessingState::Analyzing,
            ProcessingState::Transcoding,
            ProcessingState::Completed,
        ]
    );
    assert_eq!(video.title, "holiday");
    assert_eq!(video.size, b"source-bytes".len() as u64);
    assert_eq!(video.duration, 12.5);

    let renditions = h.catalog.list_renditions(&video_id).await.unwrap();
    let resolutions: Vec<_> = renditions.iter().map(|r| r.resolution.as_str()).collect();
    assert_eq!(resolutions, ["1920x1080", "1280x720", "854x480", "640x360"]);
    assert!(renditions.iter().all(|r| r.size > 0));
    assert_eq!(renditions[0].path, "videos/vid1/hls/vid1_v0.m3u8");

    let master_key = master_manifest_key(&video_id, StreamFormat::Hls);
    let master = String::from_utf8(h.store.get(&master_key).await.unwrap()).unwrap();
    let order: Vec<_> = master.lines().filter(|l| l.ends_with(".m3u8")).collect();
    assert_eq!(
        order,
        ["vid1_v0.m3u8", "vid1_v1.m3u8", "vid1_v2.m3u8", "vid1_v3.m3u8"]
    );

    // master + 4 variant playlists + 2 segments each
    assert_eq!(h.store.keys_with_prefix("videos/vid1/hls/").await.len(), 13);

    let cached = h
        .cache
        .get(&cache_key(StreamFormat::Hls, &master_key))
        .await
        .unwrap();
    assert_eq!(cached.as_deref(), Some(master.as_bytes()));

    assert!(!h.work_dir.path().join("vid1").exists());
    assert!(h.catalog.load_run(&video_id).await.unwrap().is_none());
    assert!(!h.orchestrator.is_active(&video_id));
}

#[tokio::test]
async fn test_two_rung_ladder_yields_two_renditions() {
    let ladder: Ladder = "1920x1080:5000k,1280x720:2500k".parse().unwrap();
    let h = harness_with_ladder(ScriptedCodec::new(vec![]), ladder);
    let request = upload(&h, "movie").await;
    let video_id = request.video_id.clone();

    let report = run_to_end(&h, request).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.renditions.len(), 2);

    let renditions = h.catalog.list_renditions(&video_id).await.unwrap();
    assert_eq!(renditions.len(), report.renditions.len());
    let resolutions: Vec<_> = renditions.iter().map(|r| r.resolution.as_str()).collect();
    assert_eq!(resolutions, ["1920x1080", "1280x720"]);
    assert!(renditions.iter().all(|r| r.format == StreamFormat::Hls));

    let master_key = master_manifest_key(&video_id, StreamFormat::Hls);
    let master = String::from_utf8(h.store.get(&master_key).await.unwrap()).unwrap();
    assert_eq!(
        master.lines().filter(|l| l.starts_with("#EXT-X-STREAM-INF")).count(),
        2
    );
}

#[test]
fn test_ladder_with_repeated_resolution_never_reaches_the_engine() {
    let err = "1280x720:2500k,1280x720:1000k".parse::<Ladder>().unwrap_err();
    assert!(err.to_string().contains("duplicate resolution"), "{err}");
    assert_eq!(WorkerError::from(err).class(), ErrorClass::Configuration);
}

#[tokio::test]
async fn test_transient_encoder_failure_is_retried() {
    let h = harness(ScriptedCodec::new(vec![Script::Fail(
        "Connection reset by peer",
    )]));
    let request = upload(&h, "vid2").await;

    let report = run_to_end(&h, request).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.attempts.get(&Stage::Transcode), Some(&2));
    assert_eq!(report.attempts.get(&Stage::Download), Some(&1));
    assert_eq!(h.codec.runs(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_mark_video_error_with_stderr() {
    let stderr = "Connection reset by peer";
    let h = harness(ScriptedCodec::new(vec![
        Script::Fail(stderr),
        Script::Fail(stderr),
        Script::Fail(stderr),
    ]));
    let request = upload(&h, "vid3").await;
    let video_id = request.video_id.clone();

    let report = run_to_end(&h, request).await;
    let RunOutcome::Failed(failure) = report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert_eq!(failure.stage, Stage::Transcode);
    assert_eq!(failure.attempts, 3);
    assert_eq!(h.codec.runs(), 3);

    let video = h.catalog.get_video(&video_id).await.unwrap().unwrap();
    assert_eq!(video.processing_state, ProcessingState::Error);
    let message = video.error_message.unwrap();
    assert!(message.starts_with("transcode: "), "{message}");
    assert!(message.contains(stderr), "{message}");
    assert_eq!(
        h.catalog.state_history(&video_id).await,
        [
            ProcessingState::Received,
            ProcessingState::Downloading,
            ProcessingState::Analyzing,
            ProcessingState::Transcoding,
            ProcessingState::Error,
        ]
    );

    assert_eq!(h.catalog.rendition_count().await, 0);
    assert!(!h.work_dir.path().join("vid3").exists());
    assert!(h.catalog.load_run(&video_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_input_error_fails_without_retry() {
    let h = harness(ScriptedCodec::new(vec![Script::Fail(
        "Stream map '0:a:0' matches no streams.",
    )]));
    let request = upload(&h, "vid4").await;
    let video_id = request.video_id.clone();

    let report = run_to_end(&h, request).await;
    assert!(matches!(report.outcome, RunOutcome::Failed(_)));
    assert_eq!(h.codec.runs(), 1);

    let video = h.catalog.get_video(&video_id).await.unwrap().unwrap();
    assert_eq!(video.processing_state, ProcessingState::Error);
    assert!(video.error_message.unwrap().contains("matches no streams"));
}

#[tokio::test]
async fn test_missing_source_fails_in_download() {
    let h = harness(ScriptedCodec::new(vec![]));
    let request = RunRequest::new(
        VideoId::from("vid5"),
        "uploads/vid5/vid5.mp4",
        "gone.mp4",
        "video/mp4",
    );

    let report = run_to_end(&h, request).await;
    let RunOutcome::Failed(failure) = report.outcome else {
        panic!("expected failure");
    };
    assert_eq!(failure.stage, Stage::Download);
    assert_eq!(failure.attempts, 1);
    assert_eq!(h.codec.runs(), 0);

    let video = h.catalog.get_video(&VideoId::from("vid5")).await.unwrap().unwrap();
    assert_eq!(video.processing_state, ProcessingState::Error);
    assert!(video.error_message.unwrap().starts_with("download: "));
}

#[tokio::test]
async fn test_source_without_audio_encodes_video_only() {
    let h = harness(ScriptedCodec::new(vec![]).without_audio());
    let request = upload(&h, "vid6").await;

    let report = run_to_end(&h, request).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    let job = h.codec.last_job.lock().unwrap().clone().unwrap();
    assert!(!job.include_audio);
}

#[tokio::test]
async fn test_concurrent_start_is_coalesced_and_cancel_marks_error() {
    let h = harness(ScriptedCodec::new(vec![Script::Hang]));
    let request = upload(&h, "vid7").await;
    let video_id = request.video_id.clone();

    let StartOutcome::Started(handle) = h.orchestrator.start_run(request.clone()).await.unwrap()
    else {
        panic!("first start should run");
    };
    assert!(matches!(
        h.orchestrator.start_run(request).await.unwrap(),
        StartOutcome::Coalesced
    ));

    // Wait for the encoder to be running
    for _ in 0..200 {
        if h.codec.runs() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.codec.runs(), 1);

    handle.cancel();
    let report = handle.wait().await;
    assert_eq!(report.outcome, RunOutcome::Cancelled);

    let video = h.catalog.get_video(&video_id).await.unwrap().unwrap();
    assert_eq!(video.processing_state, ProcessingState::Error);
    assert_eq!(video.error_message.as_deref(), Some("cancelled"));
    assert!(!h.orchestrator.is_active(&video_id));
}

#[tokio::test]
async fn test_finished_video_is_rejected() {
    let h = harness(ScriptedCodec::new(vec![]));
    let request = upload(&h, "vid8").await;

    let report = run_to_end(&h, request.clone()).await;
    assert!(report.is_completed());

    assert!(matches!(
        h.orchestrator.start_run(request).await.unwrap(),
        StartOutcome::Rejected(ProcessingState::Completed)
    ));
    assert_eq!(h.codec.runs(), 1);
}

#[tokio::test]
async fn test_persisted_run_resumes_at_its_stage() {
    let h = harness(ScriptedCodec::new(vec![]));
    let request = upload(&h, "vid9").await;
    let video_id = request.video_id.clone();

    // A previous worker finished download and analyze, then died mid-transcode.
    let video = Video::new(
        video_id.clone(),
        request.filename.as_str(),
        request.object_key.as_str(),
        request.content_type.as_str(),
    );
    h.catalog.create_video(&video).await.unwrap();
    for state in [
        ProcessingState::Downloading,
        ProcessingState::Analyzing,
        ProcessingState::Transcoding,
    ] {
        h.catalog.update_state(&video_id, state).await.unwrap();
    }

    let mut run = PipelineRun::new(request.clone());
    run.record_attempt(Stage::Download);
    run.advance_to(Stage::Analyze);
    run.record_attempt(Stage::Analyze);
    run.advance_to(Stage::Transcode);
    run.record_attempt(Stage::Transcode);
    run.duration = Some(12.5);
    run.has_audio = Some(true);
    run.local_path = Some("/nonexistent/scratch/source.mp4".to_string());
    h.catalog.save_run(&run).await.unwrap();

    let report = run_to_end(&h, request).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.attempts.get(&Stage::Download), Some(&1));
    assert_eq!(report.attempts.get(&Stage::Analyze), Some(&1));
    assert_eq!(report.attempts.get(&Stage::Transcode), Some(&2));
    assert_eq!(h.codec.probes.load(Ordering::SeqCst), 0);
    assert_eq!(h.codec.runs(), 1);
}

#[tokio::test]
async fn test_resumed_run_with_spent_budget_fails() {
    let h = harness(ScriptedCodec::new(vec![]));
    let request = upload(&h, "vid10").await;
    let video_id = request.video_id.clone();

    let video = Video::new(video_id.clone(), "a.mp4", request.object_key.as_str(), "video/mp4");
    h.catalog.create_video(&video).await.unwrap();
    h.catalog
        .update_state(&video_id, ProcessingState::Downloading)
        .await
        .unwrap();

    let mut run = PipelineRun::new(request.clone());
    for _ in 0..3 {
        run.record_attempt(Stage::Download);
    }
    run.record_error("object store unreachable".to_string());
    h.catalog.save_run(&run).await.unwrap();

    let report = run_to_end(&h, request).await;
    assert!(matches!(report.outcome, RunOutcome::Failed(_)));
    let video = h.catalog.get_video(&video_id).await.unwrap().unwrap();
    assert_eq!(
        video.error_message.as_deref(),
        Some("download: object store unreachable")
    );
}

#[tokio::test]
async fn test_short_catalog_outage_is_retried() {
    let h = harness(ScriptedCodec::new(vec![]));
    let request = upload(&h, "vid11").await;
    let video_id = request.video_id.clone();
    h.catalog.fail_next_state_writes(2);

    let report = run_to_end(&h, request).await;
    assert!(report.is_completed(), "{:?}", report.outcome);
    assert_eq!(report.attempts.get(&Stage::Download), Some(&3));

    let video = h.catalog.get_video(&video_id).await.unwrap().unwrap();
    assert_eq!(video.processing_state, ProcessingState::Completed);
}
