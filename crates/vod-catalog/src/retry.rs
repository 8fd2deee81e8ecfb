//! Query retry with exponential backoff and jitter.
//!
//! Only errors classified by [`CatalogError::is_retryable`] are retried:
//! dropped connections, pool exhaustion, serialization failures and
//! deadlocks. Constraint violations and missing rows fail immediately.

use std::time::Duration;

use tracing::{info_span, warn, Instrument};

use crate::error::CatalogResult;
use crate::metrics::record_retry;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call.
    pub max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay cap (in milliseconds).
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_parse("CATALOG_RETRY_MAX", defaults.max_retries),
            base_delay_ms: env_parse("CATALOG_RETRY_BASE_MS", defaults.base_delay_ms),
            max_delay_ms: env_parse("CATALOG_RETRY_MAX_MS", defaults.max_delay_ms),
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Execute an async catalog operation with retry.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, op: F) -> CatalogResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = CatalogResult<T>>,
{
    let mut attempt = 0;
    loop {
        let span = info_span!("catalog_query", operation = %operation, attempt = attempt + 1);

        match op().instrument(span).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = calculate_delay(config, attempt);

                warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Catalog operation failed, retrying: {}",
                    e
                );

                record_retry(operation);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Exponential backoff `base * 2^attempt`, capped, with full jitter and a
/// floor of `base`.
fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp_delay = config
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    let capped_delay = exp_delay.min(config.max_delay_ms);

    let jittered = if capped_delay > 0 {
        use std::time::SystemTime;
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let random_factor = (nanos % 1000) as f64 / 1000.0;
        ((capped_delay as f64) * random_factor) as u64
    } else {
        0
    };

    Duration::from_millis(jittered.max(config.base_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CatalogError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vod_models::VideoId;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_calculate_delay_respects_bounds() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 2000,
        };
        assert!(calculate_delay(&config, 10).as_millis() <= 2000);
        assert!(calculate_delay(&config, 0).as_millis() >= 1000);
        assert!(calculate_delay(&config, 64).as_millis() <= 2000);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "get_video", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CatalogError::Database(sqlx::Error::PoolTimedOut))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: CatalogResult<()> = with_retry(&fast(), "get_video", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CatalogError::Database(sqlx::Error::PoolTimedOut))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: CatalogResult<()> = with_retry(&fast(), "get_video", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CatalogError::NotFound(VideoId::from("v")))
        })
        .await;
        assert!(matches!(result, Err(CatalogError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
