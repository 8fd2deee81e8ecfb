//! Stage retry policies.
//!
//! Each stage has its own [`RetryPolicy`]; catalog status writes have a
//! separate, tighter one. Attempt counters live on the persisted pipeline
//! run, so the budget survives a worker restart.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};
use vod_models::Stage;

use crate::error::{WorkerError, WorkerResult};

/// Backoff and attempt budget for one kind of operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Wall-clock limit for a single attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Default for pipeline stages.
    pub fn stage_default() -> Self {
        Self {
            initial_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(600),
            max_attempts: 3,
            timeout: Duration::from_secs(30 * 60),
        }
    }

    /// Default for catalog status writes.
    pub fn status_default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(10),
            max_attempts: 5,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max;
        self
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        let secs = self.initial_interval.as_secs_f64() * factor;
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Per-stage policies.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePolicies {
    pub download: RetryPolicy,
    pub analyze: RetryPolicy,
    pub transcode: RetryPolicy,
    pub cleanup: RetryPolicy,
    pub status: RetryPolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        let stage = RetryPolicy::stage_default();
        Self {
            download: stage.clone().with_timeout(Duration::from_secs(10 * 60)),
            analyze: stage.clone().with_timeout(Duration::from_secs(5 * 60)),
            transcode: stage.clone(),
            cleanup: stage
                .with_max_attempts(1)
                .with_timeout(Duration::from_secs(60)),
            status: RetryPolicy::status_default(),
        }
    }
}

impl StagePolicies {
    /// Defaults overridden by `STAGE_MAX_ATTEMPTS`,
    /// `STAGE_INITIAL_INTERVAL_SECS`, `STAGE_MAX_INTERVAL_SECS` and
    /// `TRANSCODE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut policies = Self::default();

        let max_attempts: Option<u32> = env_parse("STAGE_MAX_ATTEMPTS");
        let initial: Option<u64> = env_parse("STAGE_INITIAL_INTERVAL_SECS");
        let max: Option<u64> = env_parse("STAGE_MAX_INTERVAL_SECS");

        for policy in [
            &mut policies.download,
            &mut policies.analyze,
            &mut policies.transcode,
        ] {
            if let Some(n) = max_attempts {
                policy.max_attempts = n.max(1);
            }
            if let Some(secs) = initial {
                policy.initial_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = max {
                policy.max_interval = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = env_parse::<u64>("TRANSCODE_TIMEOUT_SECS") {
            policies.transcode.timeout = Duration::from_secs(secs);
        }

        policies
    }

    /// The same policy for every stage and for status writes.
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            download: policy.clone(),
            analyze: policy.clone(),
            transcode: policy.clone(),
            cleanup: policy.clone().with_max_attempts(1),
            status: policy,
        }
    }

    pub fn for_stage(&self, stage: Stage) -> &RetryPolicy {
        match stage {
            Stage::Download => &self.download,
            Stage::Analyze => &self.analyze,
            Stage::Transcode => &self.transcode,
            Stage::Cleanup => &self.cleanup,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Run `op` under `policy`, retrying transient failures.
///
/// Each attempt is bounded by the policy timeout; a timed-out attempt
/// counts as a failed one.
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    op: F,
) -> WorkerResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = WorkerResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout(policy.timeout.as_secs())),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = %operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "{} failed, retrying: {}",
                    operation,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                debug!(operation = %operation, attempt, "{} gave up: {}", operation, e);
                return Err(e);
            }
        }
    }
}

/// Suppresses log spam from a background task that keeps failing.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
    max_logged_failures: u32,
    suppressed: bool,
}

impl FailureTracker {
    pub fn new(max_logged_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_logged_failures,
            suppressed: false,
        }
    }

    /// Record a successful operation (resets failure count).
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 && self.suppressed {
            debug!(
                "Operation recovered after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.suppressed = false;
    }

    /// Record a failed operation. Returns `true` if it should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures <= self.max_logged_failures {
            true
        } else if self.consecutive_failures == self.max_logged_failures + 1 {
            self.suppressed = true;
            warn!(
                "Suppressing further failure logs after {} consecutive failures",
                self.max_logged_failures
            );
            false
        } else {
            false
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vod_storage::StorageError;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::stage_default()
            .with_intervals(Duration::from_millis(1), Duration::from_millis(2))
            .with_max_attempts(max_attempts)
            .with_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_stage_delays_follow_backoff() {
        let policy = RetryPolicy::stage_default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(60));
        assert_eq!(policy.delay_after(2), Duration::from_secs(120));
        assert_eq!(policy.delay_after(3), Duration::from_secs(240));
        assert_eq!(policy.delay_after(10), Duration::from_secs(600));
    }

    #[test]
    fn test_status_policy_defaults() {
        let policy = RetryPolicy::status_default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(5), Duration::from_secs(10));
        assert_eq!(policy.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_default_policies() {
        let policies = StagePolicies::default();
        assert_eq!(policies.for_stage(Stage::Transcode).max_attempts, 3);
        assert_eq!(
            policies.for_stage(Stage::Transcode).timeout,
            Duration::from_secs(1800)
        );
        assert_eq!(policies.for_stage(Stage::Cleanup).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_policy(&fast(5), "status", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(WorkerError::Storage(StorageError::upload_failed("503")))
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let calls = AtomicU32::new(0);
        let policy = fast(2).with_timeout(Duration::from_millis(10));
        let result: WorkerResult<()> = retry_with_policy(&policy, "status", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(WorkerError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_configuration_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: WorkerResult<()> = retry_with_policy(&fast(5), "status", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(WorkerError::config_error("bad ladder"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_tracker_suppression() {
        let mut tracker = FailureTracker::new(2);
        assert!(tracker.record_failure());
        assert!(tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        tracker.record_success();
        assert_eq!(tracker.failure_count(), 0);
        assert!(tracker.record_failure());
    }
}
