//! Transcoding pipeline orchestrator.
//!
//! Drives one video through Download → Analyze → Transcode → Cleanup.
//! Every attempt is recorded on the persisted [`PipelineRun`] before it
//! starts, so a worker that dies mid-stage resumes at that stage with the
//! attempt budget already spent.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};
use vod_media::fs_utils::{remove_dir_if_exists, replace_file};
use vod_models::{
    PipelineRun, ProcessingState, Rendition, RunRequest, Stage, Video, VideoId,
};
use vod_queue::{LeaseManager, QueueError, VideoLease};

use crate::context::PipelineDeps;
use crate::error::{ErrorClass, StageFailure, WorkerError, WorkerResult};
use crate::logging::RunLogger;
use crate::metrics;
use crate::retry::{retry_with_policy, FailureTracker, RetryPolicy};
use crate::transcode::{AbrEngine, SourceInfo};

/// Result of asking the orchestrator to process a video.
#[derive(Debug)]
pub enum StartOutcome {
    /// A new run was spawned.
    Started(RunHandle),
    /// A run for this video is already active here or on another worker.
    Coalesced,
    /// The video already reached a terminal state.
    Rejected(ProcessingState),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(StageFailure),
    Cancelled,
    /// The run task panicked or was aborted.
    Aborted(String),
}

/// Summary returned by [`RunHandle::wait`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub video_id: VideoId,
    pub outcome: RunOutcome,
    /// Renditions published by this run
    pub renditions: Vec<Rendition>,
    /// Attempts consumed per stage
    pub attempts: BTreeMap<Stage, u32>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Handle to a spawned run.
#[derive(Debug)]
pub struct RunHandle {
    video_id: VideoId,
    cancel: watch::Sender<bool>,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn video_id(&self) -> &VideoId {
        &self.video_id
    }

    /// Ask the run to stop. The current stage observes the signal, a
    /// running encoder is killed and the video is marked `error`.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> RunReport {
        match self.join.await {
            Ok(report) => report,
            Err(e) => RunReport {
                video_id: self.video_id,
                outcome: RunOutcome::Aborted(e.to_string()),
                renditions: Vec::new(),
                attempts: BTreeMap::new(),
                elapsed: Duration::ZERO,
            },
        }
    }
}

/// Video ids with a run in this process.
#[derive(Clone, Default)]
struct ActiveRuns(Arc<Mutex<HashSet<VideoId>>>);

impl ActiveRuns {
    fn try_claim(&self, video_id: &VideoId) -> Option<ActiveRunGuard> {
        let mut set = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(video_id.clone()) {
            return None;
        }
        metrics::set_active_runs(set.len());
        Some(ActiveRunGuard {
            runs: self.clone(),
            video_id: video_id.clone(),
        })
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn contains(&self, video_id: &VideoId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(video_id)
    }
}

/// Releases the video id when the run ends, including on panic.
struct ActiveRunGuard {
    runs: ActiveRuns,
    video_id: VideoId,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        let mut set = self.runs.0.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.video_id);
        metrics::set_active_runs(set.len());
    }
}

/// Starts and supervises pipeline runs.
#[derive(Clone)]
pub struct Orchestrator {
    deps: Arc<PipelineDeps>,
    active: ActiveRuns,
    leases: Option<LeaseManager>,
}

impl Orchestrator {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            deps: Arc::new(deps),
            active: ActiveRuns::default(),
            leases: None,
        }
    }

    /// Also take a distributed lease per video so runs are exclusive
    /// across worker processes.
    pub fn with_leases(mut self, leases: LeaseManager) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    pub fn has_leases(&self) -> bool {
        self.leases.is_some()
    }

    pub fn active_runs(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, video_id: &VideoId) -> bool {
        self.active.contains(video_id)
    }

    /// Start processing `request` unless a run for the same video is
    /// already active or the video is finished.
    pub async fn start_run(&self, request: RunRequest) -> WorkerResult<StartOutcome> {
        let video_id = request.video_id.clone();

        let Some(guard) = self.active.try_claim(&video_id) else {
            info!(video_id = %video_id, "Run already active, coalescing");
            return Ok(StartOutcome::Coalesced);
        };

        if let Some(video) = self.deps.catalog.get_video(&video_id).await? {
            if video.is_terminal() {
                info!(
                    video_id = %video_id,
                    state = %video.processing_state,
                    "Video already finished, rejecting run"
                );
                return Ok(StartOutcome::Rejected(video.processing_state));
            }
        }

        let lease = match &self.leases {
            Some(leases) => match leases.acquire(&video_id).await? {
                Some(lease) => Some((leases.clone(), lease)),
                None => {
                    info!(video_id = %video_id, "Run active on another worker, coalescing");
                    return Ok(StartOutcome::Coalesced);
                }
            },
            None => None,
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let deps = Arc::clone(&self.deps);
        let logger = RunLogger::new(&video_id);
        let span = logger.create_span();

        let join = tokio::spawn(
            async move {
                let _guard = guard;
                let heartbeat = lease.as_ref().map(|(leases, lease)| {
                    spawn_heartbeat(
                        leases.clone(),
                        lease.clone(),
                        deps.config.lease_heartbeat_interval,
                    )
                });

                let report = Pipeline::new(&deps, logger, cancel_rx)
                    .execute(request)
                    .await;

                if let Some(heartbeat) = heartbeat {
                    heartbeat.abort();
                }
                if let Some((leases, lease)) = lease {
                    if let Err(e) = leases.release(lease).await {
                        warn!("Failed to release lease: {}", e);
                    }
                }
                report
            }
            .instrument(span),
        );

        Ok(StartOutcome::Started(RunHandle {
            video_id,
            cancel: cancel_tx,
            join,
        }))
    }
}

fn spawn_heartbeat(leases: LeaseManager, lease: VideoLease, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = FailureTracker::new(3);
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match leases.refresh(&lease).await {
                Ok(()) => tracker.record_success(),
                Err(QueueError::LeaseLost(video_id)) => {
                    warn!(video_id = %video_id, "Lease lost, another worker may take over");
                    break;
                }
                Err(e) => {
                    if tracker.record_failure() {
                        warn!(video_id = %lease.video_id(), "Lease refresh failed: {}", e);
                    }
                }
            }
        }
    })
}

/// Resolves once cancellation is requested. Never resolves if the
/// handle was dropped without cancelling.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum StageOutput {
    Downloaded { local_path: PathBuf },
    Analyzed(SourceInfo),
    Transcoded(Vec<Rendition>),
    CleanedUp,
}

/// Execution state of one run.
struct Pipeline<'a> {
    deps: &'a PipelineDeps,
    logger: RunLogger,
    cancel: watch::Receiver<bool>,
}

impl<'a> Pipeline<'a> {
    fn new(deps: &'a PipelineDeps, logger: RunLogger, cancel: watch::Receiver<bool>) -> Self {
        Self {
            deps,
            logger,
            cancel,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn scratch_dir(&self, video_id: &VideoId) -> PathBuf {
        self.deps.config.scratch_dir(video_id)
    }

    async fn execute(self, request: RunRequest) -> RunReport {
        let started = Instant::now();
        let video_id = request.video_id.clone();

        let (mut run, resumed) = match self.deps.catalog.load_run(&video_id).await {
            Ok(Some(run)) => (run, true),
            Ok(None) => (PipelineRun::new(request), false),
            Err(e) => {
                self.logger
                    .log_warning(&format!("cannot load persisted run, starting fresh: {}", e));
                (PipelineRun::new(request), false)
            }
        };
        self.logger.log_start(run.stage, resumed);
        self.persist(&run).await;

        let mut renditions = Vec::new();
        loop {
            let stage = run.stage;
            match self.run_stage(&mut run).await {
                Ok(output) => match output {
                    StageOutput::Downloaded { local_path } => {
                        run.local_path = Some(local_path.to_string_lossy().to_string());
                    }
                    StageOutput::Analyzed(info) => {
                        run.duration = Some(info.duration);
                        run.has_audio = Some(info.has_audio);
                    }
                    StageOutput::Transcoded(published) => renditions = published,
                    StageOutput::CleanedUp => {}
                },
                Err(failure) if failure.class == ErrorClass::NonCritical => {
                    self.logger
                        .log_warning(&format!("ignoring non-critical failure: {}", failure));
                }
                Err(failure) => return self.fail(run, failure, renditions, started).await,
            }

            match stage.next() {
                Some(next) => {
                    run.advance_to(next);
                    self.persist(&run).await;
                }
                None => break,
            }
        }

        self.complete(run, renditions, started).await
    }

    async fn complete(
        &self,
        run: PipelineRun,
        renditions: Vec<Rendition>,
        started: Instant,
    ) -> RunReport {
        let video_id = run.video_id.clone();
        let catalog = &self.deps.catalog;
        let written = retry_with_policy(&self.deps.config.policies.status, "complete", || async {
            catalog
                .update_state(&video_id, ProcessingState::Completed)
                .await
                .map_err(WorkerError::from)
        })
        .await;

        if let Err(e) = written {
            // The run stays persisted at Cleanup so a redelivery retries the write.
            metrics::record_status_write_failure();
            let failure = StageFailure::new(Stage::Cleanup, &e, run.attempts_for(Stage::Cleanup));
            error!(video_id = %video_id, "Failed to mark video completed: {}", e);
            metrics::record_run("failed");
            return RunReport {
                video_id,
                outcome: RunOutcome::Failed(StageFailure {
                    class: e.class(),
                    ..failure
                }),
                renditions,
                attempts: run.attempts,
                elapsed: started.elapsed(),
            };
        }

        if let Err(e) = catalog.delete_run(&video_id).await {
            self.logger
                .log_warning(&format!("failed to delete finished run: {}", e));
        }

        metrics::record_run("completed");
        metrics::record_renditions(renditions.len());
        self.logger.log_completion(renditions.len(), started.elapsed());

        RunReport {
            video_id,
            outcome: RunOutcome::Completed,
            renditions,
            attempts: run.attempts,
            elapsed: started.elapsed(),
        }
    }

    /// Record a fatal failure: best-effort `error` status, then reclaim
    /// scratch and drop the persisted run.
    async fn fail(
        &self,
        run: PipelineRun,
        failure: StageFailure,
        renditions: Vec<Rendition>,
        started: Instant,
    ) -> RunReport {
        let video_id = run.video_id.clone();
        self.logger.log_failure(&failure);

        let reason = if failure.is_cancelled() {
            "cancelled".to_string()
        } else {
            failure.to_string()
        };

        let catalog = &self.deps.catalog;
        let status = retry_with_policy(&self.deps.config.policies.status, "mark_error", || async {
            catalog
                .mark_error(&video_id, &reason)
                .await
                .map_err(WorkerError::from)
        })
        .await;
        if let Err(e) = status {
            metrics::record_status_write_failure();
            error!(
                video_id = %video_id,
                "Failed to record error status, video may appear stuck: {}", e
            );
        }

        if let Err(e) = remove_dir_if_exists(self.scratch_dir(&video_id)).await {
            self.logger
                .log_warning(&format!("failed to remove scratch: {}", e));
        }
        if let Err(e) = catalog.delete_run(&video_id).await {
            self.logger
                .log_warning(&format!("failed to delete failed run: {}", e));
        }

        let outcome = if failure.is_cancelled() {
            metrics::record_run("cancelled");
            RunOutcome::Cancelled
        } else {
            metrics::record_run("failed");
            RunOutcome::Failed(failure)
        };

        RunReport {
            video_id,
            outcome,
            renditions,
            attempts: run.attempts,
            elapsed: started.elapsed(),
        }
    }

    async fn persist(&self, run: &PipelineRun) {
        if let Err(e) = self.deps.catalog.save_run(run).await {
            self.logger
                .log_warning(&format!("failed to persist run progress: {}", e));
        }
    }

    /// Execute the current stage under its retry policy.
    async fn run_stage(&self, run: &mut PipelineRun) -> Result<StageOutput, StageFailure> {
        let stage = run.stage;
        let policy = self.deps.config.policies.for_stage(stage).clone();

        loop {
            if self.is_cancelled() {
                return Err(StageFailure::new(
                    stage,
                    &WorkerError::Cancelled,
                    run.attempts_for(stage),
                ));
            }

            let spent = run.attempts_for(stage);
            if spent >= policy.max_attempts {
                let reason = run
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "retry budget exhausted".to_string());
                return Err(StageFailure {
                    stage,
                    class: if stage.is_critical() {
                        ErrorClass::Transient
                    } else {
                        ErrorClass::NonCritical
                    },
                    reason,
                    attempts: spent,
                });
            }

            let attempt = run.record_attempt(stage);
            self.persist(run).await;
            self.logger.log_attempt(stage, attempt, policy.max_attempts);

            let attempt_started = Instant::now();
            let result = self.attempt(stage, run, &policy).await;
            metrics::record_stage(stage, result.is_ok(), attempt_started.elapsed());

            let error = match result {
                Ok(output) => {
                    self.logger
                        .log_stage_complete(stage, attempt_started.elapsed());
                    return Ok(output);
                }
                Err(e) => e,
            };

            let failure = StageFailure::new(stage, &error, attempt);
            run.record_error(failure.reason.clone());
            self.persist(run).await;

            if !error.is_retryable() || attempt >= policy.max_attempts {
                return Err(failure);
            }

            let delay = policy.delay_after(attempt);
            self.logger.log_retry(stage, attempt, delay, &failure.reason);
            metrics::record_stage_retry(stage);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(self.cancel.clone()) => {}
            }
        }
    }

    /// One attempt, bounded by the policy timeout and the cancel signal.
    async fn attempt(
        &self,
        stage: Stage,
        run: &PipelineRun,
        policy: &RetryPolicy,
    ) -> WorkerResult<StageOutput> {
        let work = tokio::time::timeout(policy.timeout, self.dispatch(stage, run));
        tokio::select! {
            result = work => match result {
                Ok(result) => result,
                Err(_) => Err(WorkerError::Timeout(policy.timeout.as_secs())),
            },
            _ = cancelled(self.cancel.clone()) => Err(WorkerError::Cancelled),
        }
    }

    async fn dispatch(&self, stage: Stage, run: &PipelineRun) -> WorkerResult<StageOutput> {
        match stage {
            Stage::Download => self.download(run).await,
            Stage::Analyze => self.analyze(run).await,
            Stage::Transcode => self.transcode(run).await,
            Stage::Cleanup => self.cleanup(run).await,
        }
    }

    async fn download(&self, run: &PipelineRun) -> WorkerResult<StageOutput> {
        let request = &run.request;
        let catalog = &self.deps.catalog;

        let video = Video::new(
            request.video_id.clone(),
            request.filename.as_str(),
            request.object_key.as_str(),
            request.content_type.as_str(),
        );
        if catalog.create_video(&video).await? {
            info!(video_id = %request.video_id, "Created video record");
        }
        catalog
            .update_state(&request.video_id, ProcessingState::Downloading)
            .await?;

        let (local_path, size) = self.fetch_source(request).await?;
        catalog.set_size(&request.video_id, size).await?;

        Ok(StageOutput::Downloaded { local_path })
    }

    async fn analyze(&self, run: &PipelineRun) -> WorkerResult<StageOutput> {
        let video_id = &run.video_id;
        self.deps
            .catalog
            .update_state(video_id, ProcessingState::Analyzing)
            .await?;

        let input = self.ensure_source(run).await?;
        let info = self.deps.codec.probe(&input).await?;
        self.deps.catalog.set_duration(video_id, info.duration).await?;

        info!(
            video_id = %video_id,
            duration = info.duration,
            resolution = %info.resolution(),
            codec = %info.codec,
            has_audio = info.has_audio(),
            "Source analyzed"
        );

        Ok(StageOutput::Analyzed(SourceInfo {
            duration: info.duration,
            has_audio: info.has_audio(),
        }))
    }

    async fn transcode(&self, run: &PipelineRun) -> WorkerResult<StageOutput> {
        let video_id = &run.video_id;
        self.deps
            .catalog
            .update_state(video_id, ProcessingState::Transcoding)
            .await?;

        let input = self.ensure_source(run).await?;
        let source = SourceInfo {
            duration: run.duration.unwrap_or(0.0),
            has_audio: run.has_audio.unwrap_or(true),
        };
        let output_dir = self.scratch_dir(video_id).join("hls");

        let renditions = AbrEngine::new(self.deps)
            .transcode(video_id, &input, &output_dir, source, self.cancel.clone())
            .await?;
        Ok(StageOutput::Transcoded(renditions))
    }

    async fn cleanup(&self, run: &PipelineRun) -> WorkerResult<StageOutput> {
        remove_dir_if_exists(self.scratch_dir(&run.video_id)).await?;
        Ok(StageOutput::CleanedUp)
    }

    /// Download the source into scratch via a temp file and rename.
    async fn fetch_source(&self, request: &RunRequest) -> WorkerResult<(PathBuf, u64)> {
        let scratch = self.scratch_dir(&request.video_id);
        tokio::fs::create_dir_all(&scratch).await?;

        let name = source_file_name(&request.object_key);
        let dest = scratch.join(&name);
        let part = scratch.join(format!("{}.part", name));

        let size = self
            .deps
            .store
            .download_file(&request.object_key, &part)
            .await?;
        replace_file(&part, &dest).await?;

        info!(video_id = %request.video_id, size, "Source downloaded");
        Ok((dest, size))
    }

    /// Local source path, fetched again if scratch was lost since the
    /// download stage (for example after moving to another host).
    async fn ensure_source(&self, run: &PipelineRun) -> WorkerResult<PathBuf> {
        if let Some(path) = run.local_path.as_deref().map(Path::new) {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Ok(path.to_path_buf());
            }
        }
        self.logger
            .log_warning("scratch copy missing, fetching source again");
        let (path, _) = self.fetch_source(&run.request).await?;
        Ok(path)
    }
}

/// Scratch file name for the source, keeping a sane extension.
fn source_file_name(object_key: &str) -> String {
    let ext = object_key
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("source{}", ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_file_name() {
        assert_eq!(source_file_name("uploads/a/a.MP4"), "source.mp4");
        assert_eq!(source_file_name("uploads/a/a"), "source");
        assert_eq!(source_file_name("uploads/a.b/noext"), "source");
    }

    #[tokio::test]
    async fn test_cancelled_resolves_on_signal() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(cancelled(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_pends_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let result = tokio::time::timeout(Duration::from_millis(20), cancelled(rx)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_active_runs_guard_releases() {
        let runs = ActiveRuns::default();
        let id = VideoId::from("v");
        let guard = runs.try_claim(&id).unwrap();
        assert!(runs.try_claim(&id).is_none());
        assert!(runs.contains(&id));
        drop(guard);
        assert!(!runs.contains(&id));
        assert!(runs.try_claim(&id).is_some());
    }
}
