//! VOD transcoding worker.
//!
//! This crate provides:
//! - The pipeline orchestrator (download, analyze, transcode, cleanup)
//! - The ABR ladder engine that encodes and publishes HLS renditions
//! - Per-stage retry policies with persisted attempt budgets
//! - A queue-driven executor with graceful shutdown

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod transcode;

pub use config::WorkerConfig;
pub use context::PipelineDeps;
pub use error::{ErrorClass, StageFailure, WorkerError, WorkerResult};
pub use executor::{Disposition, RunExecutor};
pub use logging::RunLogger;
pub use orchestrator::{Orchestrator, RunHandle, RunOutcome, RunReport, StartOutcome};
pub use retry::{RetryPolicy, StagePolicies};
pub use transcode::{AbrEngine, SourceInfo};
