//! Redis-backed run queue and per-video leases.
//!
//! This crate provides:
//! - Run submission via Redis Streams with per-video duplicate coalescing
//! - Consumer-group delivery with retry counters and a DLQ
//! - Leases that keep each video to one active run across workers

pub mod error;
pub mod job;
pub mod lease;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use job::RunJob;
pub use lease::{LeaseManager, VideoLease};
pub use queue::{EnqueueOutcome, QueueConfig, RunQueue};
