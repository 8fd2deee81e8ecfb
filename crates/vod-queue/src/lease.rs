//! Per-video run leases.
//!
//! A lease is a Redis key `vod:lease:{video_id}` holding the owner token,
//! set with `NX PX`. Refresh and release only act when the caller still
//! owns the key, so a worker whose lease expired cannot clobber the
//! worker that took over.

use std::time::Duration;

use redis::Script;
use tracing::{debug, warn};
use uuid::Uuid;
use vod_models::VideoId;

use crate::error::{QueueError, QueueResult};

const REFRESH_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Issues leases that keep a video to one active run across workers.
#[derive(Clone)]
pub struct LeaseManager {
    client: redis::Client,
    ttl: Duration,
}

/// A held lease. Release it when the run ends; if the holder dies the
/// key expires after the TTL.
#[derive(Debug, Clone)]
pub struct VideoLease {
    video_id: VideoId,
    token: String,
    ttl: Duration,
}

impl VideoLease {
    pub fn video_id(&self) -> &VideoId {
        &self.video_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl LeaseManager {
    pub fn new(client: redis::Client, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn key(video_id: &VideoId) -> String {
        format!("vod:lease:{}", video_id)
    }

    /// Try to take the lease. `None` means another worker holds it.
    pub async fn acquire(&self, video_id: &VideoId) -> QueueResult<Option<VideoLease>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let token = Uuid::new_v4().to_string();

        let result: Option<String> = redis::cmd("SET")
            .arg(Self::key(video_id))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        if result.is_none() {
            debug!(video_id = %video_id, "Lease held elsewhere");
            return Ok(None);
        }

        Ok(Some(VideoLease {
            video_id: video_id.clone(),
            token,
            ttl: self.ttl,
        }))
    }

    /// Extend a held lease. Fails with [`QueueError::LeaseLost`] when the
    /// lease expired or was taken over.
    pub async fn refresh(&self, lease: &VideoLease) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let extended: i64 = Script::new(REFRESH_SCRIPT)
            .key(Self::key(&lease.video_id))
            .arg(&lease.token)
            .arg(lease.ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if extended == 1 {
            Ok(())
        } else {
            warn!(video_id = %lease.video_id, "Lease lost before refresh");
            Err(QueueError::LeaseLost(lease.video_id.to_string()))
        }
    }

    /// Release a held lease. Releasing a lease that already expired is
    /// not an error.
    pub async fn release(&self, lease: VideoLease) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(Self::key(&lease.video_id))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        debug!(video_id = %lease.video_id, released = deleted == 1, "Lease released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ttl: Duration) -> LeaseManager {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        LeaseManager::new(redis::Client::open(url).unwrap(), ttl)
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_lease_is_exclusive() {
        let leases = manager(Duration::from_secs(5));
        let id = VideoId::new();

        let held = leases.acquire(&id).await.unwrap().unwrap();
        assert!(leases.acquire(&id).await.unwrap().is_none());

        leases.refresh(&held).await.unwrap();
        leases.release(held).await.unwrap();
        assert!(leases.acquire(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_expired_lease_cannot_be_refreshed() {
        let leases = manager(Duration::from_millis(50));
        let id = VideoId::new();
        let held = leases.acquire(&id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            leases.refresh(&held).await,
            Err(QueueError::LeaseLost(_))
        ));
    }
}
