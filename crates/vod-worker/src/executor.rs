//! Queue-driven run executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vod_queue::{RunJob, RunQueue};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::orchestrator::{Orchestrator, RunOutcome, StartOutcome};

/// What to do with a queue message once its run has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Run finished (or was refused); drop the message and its dedup key.
    Complete,
    /// Another run owns the video; drop only the message.
    Ack,
    /// Leave the message pending for redelivery.
    Retry(String),
}

/// Executor that feeds queued runs into the [`Orchestrator`].
pub struct RunExecutor {
    orchestrator: Orchestrator,
    queue: Arc<RunQueue>,
    run_semaphore: Arc<Semaphore>,
    max_runs: usize,
    shutdown: tokio::sync::watch::Sender<bool>,
    consumer_name: String,
}

impl RunExecutor {
    pub fn new(orchestrator: Orchestrator, queue: RunQueue) -> Self {
        let max_runs = orchestrator.deps().config.max_concurrent_runs;
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Self {
            orchestrator,
            queue: Arc::new(queue),
            run_semaphore: Arc::new(Semaphore::new(max_runs)),
            max_runs,
            shutdown,
            consumer_name: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Start the executor and block until shutdown.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting run executor '{}' with {} max concurrent runs",
            self.consumer_name, self.max_runs
        );

        self.queue.init().await?;

        if self.orchestrator.has_leases() {
            self.resume_persisted().await;
        }

        let mut shutdown_rx = self.shutdown.subscribe();

        let claim_task = {
            let queue = Arc::clone(&self.queue);
            let orchestrator = self.orchestrator.clone();
            let semaphore = Arc::clone(&self.run_semaphore);
            let consumer_name = self.consumer_name.clone();
            let every = self.orchestrator.deps().config.claim_interval;
            let mut shutdown_rx = self.shutdown.subscribe();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = interval.tick() => {
                            let available = semaphore.available_permits();
                            if available == 0 {
                                continue;
                            }
                            match queue.claim_pending(&consumer_name, available.min(5)).await {
                                Ok(jobs) if !jobs.is_empty() => {
                                    info!("Claimed {} pending runs", jobs.len());
                                    for (message_id, job) in jobs {
                                        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                                            break;
                                        };
                                        let orchestrator = orchestrator.clone();
                                        let queue = Arc::clone(&queue);
                                        tokio::spawn(async move {
                                            let _permit = permit;
                                            Self::execute_message(orchestrator, queue, message_id, job).await;
                                        });
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => warn!("Failed to claim pending runs: {}", e),
                            }
                        }
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_runs() => {
                    if let Err(e) = result {
                        error!("Error consuming runs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight runs to complete...");
        let timeout = self.orchestrator.deps().config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.wait_for_runs()).await.is_err() {
            warn!(
                active = self.orchestrator.active_runs(),
                "Shutdown timeout reached, unfinished runs will be redelivered"
            );
        }

        info!("Run executor stopped");
        Ok(())
    }

    async fn consume_runs(&self) -> WorkerResult<()> {
        let available = self.run_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let jobs = self
            .queue
            .consume(&self.consumer_name, 1000, available.min(5))
            .await?;
        if jobs.is_empty() {
            return Ok(());
        }

        debug!("Consumed {} runs from queue", jobs.len());

        for (message_id, job) in jobs {
            let orchestrator = self.orchestrator.clone();
            let queue = Arc::clone(&self.queue);
            let permit = Arc::clone(&self.run_semaphore)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::processing_failed("Semaphore closed"))?;

            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_message(orchestrator, queue, message_id, job).await;
            });
        }

        Ok(())
    }

    /// Resume runs persisted by a previous worker process.
    async fn resume_persisted(&self) {
        let runs = match self.orchestrator.deps().catalog.list_runs().await {
            Ok(runs) => runs,
            Err(e) => {
                warn!("Failed to list persisted runs: {}", e);
                return;
            }
        };
        if runs.is_empty() {
            return;
        }
        info!("Resuming {} persisted runs", runs.len());

        for run in runs {
            let Ok(permit) = Arc::clone(&self.run_semaphore).acquire_owned().await else {
                break;
            };
            match self.orchestrator.start_run(run.request).await {
                Ok(StartOutcome::Started(handle)) => {
                    tokio::spawn(async move {
                        let _permit = permit;
                        let report = handle.wait().await;
                        debug!(video_id = %report.video_id, outcome = ?report.outcome, "Resumed run finished");
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(video_id = %run.video_id, "Failed to resume run: {}", e),
            }
        }
    }

    /// Run one queue message to completion and settle it.
    async fn execute_message(
        orchestrator: Orchestrator,
        queue: Arc<RunQueue>,
        message_id: String,
        job: RunJob,
    ) {
        let video_id = job.video_id().clone();
        info!(video_id = %video_id, job_id = %job.job_id, "Executing run");

        let disposition = Self::run_job(&orchestrator, job.clone()).await;

        match disposition {
            Disposition::Complete => {
                if let Err(e) = queue.complete(&message_id, &job).await {
                    error!(video_id = %video_id, "Failed to complete run message: {}", e);
                }
            }
            Disposition::Ack => {
                if let Err(e) = queue.ack(&message_id).await {
                    error!(video_id = %video_id, "Failed to ack run message: {}", e);
                }
            }
            Disposition::Retry(reason) => {
                let retry_count = queue.increment_retry(&message_id).await.unwrap_or(u32::MAX);
                let max_retries = queue.max_retries();
                if retry_count >= max_retries {
                    warn!(
                        video_id = %video_id,
                        "Run exceeded max deliveries ({}), moving to DLQ", max_retries
                    );
                    metrics::record_dlq();
                    if let Err(e) = queue.dlq(&message_id, &job, &reason).await {
                        error!(video_id = %video_id, "Failed to move run to DLQ: {}", e);
                    }
                    if let Err(e) = queue.release_dedup(&video_id).await {
                        warn!(video_id = %video_id, "Failed to release dedup key: {}", e);
                    }
                } else {
                    info!(
                        video_id = %video_id,
                        "Run will be redelivered (delivery {}/{})", retry_count, max_retries
                    );
                }
            }
        }
    }

    /// Start the run and decide how to settle its message.
    pub async fn run_job(orchestrator: &Orchestrator, job: RunJob) -> Disposition {
        let video_id = job.video_id().clone();
        let handle = match orchestrator.start_run(job.request).await {
            Ok(StartOutcome::Started(handle)) => handle,
            Ok(StartOutcome::Coalesced) => return Disposition::Ack,
            Ok(StartOutcome::Rejected(_)) => return Disposition::Complete,
            Err(e) => return Disposition::Retry(e.to_string()),
        };

        let report = handle.wait().await;
        match report.outcome {
            RunOutcome::Completed | RunOutcome::Cancelled => Disposition::Complete,
            RunOutcome::Failed(failure) => {
                // A failed run normally leaves the video in `error`. If that
                // write was lost too, redeliver so the status gets fixed.
                match orchestrator.deps().catalog.get_video(&video_id).await {
                    Ok(Some(video)) if video.is_terminal() => Disposition::Complete,
                    Ok(None) => Disposition::Complete,
                    _ => Disposition::Retry(failure.to_string()),
                }
            }
            RunOutcome::Aborted(reason) => Disposition::Retry(reason),
        }
    }

    async fn wait_for_runs(&self) {
        loop {
            if self.run_semaphore.available_permits() == self.max_runs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Sender half of the shutdown signal, for signal handlers.
    pub fn shutdown_handle(&self) -> tokio::sync::watch::Sender<bool> {
        self.shutdown.clone()
    }
}
