//! Stream cache for hot manifests and segments.
//!
//! The cache is an accelerator only: callers treat every error as a miss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Default bound on a single cache round trip.
pub const DEFAULT_CACHE_OP_TIMEOUT: Duration = Duration::from_millis(250);

/// Byte cache keyed by `{format}:{objectKey}`.
#[async_trait]
pub trait StreamCache: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, data: &[u8], ttl: Duration) -> StorageResult<()>;
}

/// Redis-backed [`StreamCache`].
#[derive(Clone)]
pub struct RedisStreamCache {
    conn: MultiplexedConnection,
    op_timeout: Duration,
}

impl RedisStreamCache {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            op_timeout: DEFAULT_CACHE_OP_TIMEOUT,
        })
    }

    /// Bound each cache call so a slow cache cannot stall the read path.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    async fn bounded<T, F>(&self, op: F) -> StorageResult<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StorageError::Cache(format!(
                "operation exceeded {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl StreamCache for RedisStreamCache {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = self.bounded(conn.get(key)).await?;
        debug!(key = %key, hit = value.is_some(), "stream cache lookup");
        Ok(value)
    }

    async fn put(&self, key: &str, data: &[u8], ttl: Duration) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        self.bounded(conn.set_ex::<_, _, ()>(key, data, secs)).await
    }
}

/// In-process [`StreamCache`] with TTLs, for tests and single-node setups.
#[derive(Default)]
pub struct MemoryStreamCache {
    entries: RwLock<HashMap<String, (Vec<u8>, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryStreamCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Cache("cache unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamCache for MemoryStreamCache {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(data, _)| data.clone()))
    }

    async fn put(&self, key: &str, data: &[u8], ttl: Duration) -> StorageResult<()> {
        self.check_available()?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (data.to_vec(), Instant::now() + ttl));
        Ok(())
    }
}

/// [`StreamCache`] that never holds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStreamCache;

#[async_trait]
impl StreamCache for NoopStreamCache {
    async fn get(&self, _key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _data: &[u8], _ttl: Duration) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_hit_and_expiry() {
        let cache = MemoryStreamCache::new();
        cache
            .put("hls:k", b"#EXTM3U", Duration::from_secs(60))
            .await
            .unwrap();
        cache.put("hls:gone", b"x", Duration::ZERO).await.unwrap();

        assert_eq!(cache.get("hls:k").await.unwrap(), Some(b"#EXTM3U".to_vec()));
        assert_eq!(cache.get("hls:gone").await.unwrap(), None);
        assert_eq!(cache.get("hls:missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_cache_outage() {
        let cache = MemoryStreamCache::new();
        cache.set_unavailable(true);
        assert!(cache.get("k").await.is_err());
        assert!(cache.put("k", b"x", Duration::from_secs(1)).await.is_err());
        cache.set_unavailable(false);
        assert!(cache.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_noop_cache_never_hits() {
        let cache = NoopStreamCache;
        cache.put("k", b"x", Duration::from_secs(1)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_cache_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let cache = RedisStreamCache::connect(&url).await.unwrap();
        cache
            .put("hls:test/vod-storage", b"segment", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            cache.get("hls:test/vod-storage").await.unwrap(),
            Some(b"segment".to_vec())
        );
    }
}
