//! Run queue on Redis Streams.

use std::time::Duration;

use redis::AsyncCommands;
use tracing::{debug, info, warn};
use vod_models::{RunRequest, VideoId};

use crate::error::{QueueError, QueueResult};
use crate::job::RunJob;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for runs
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Deliveries before a message is dead-lettered
    pub max_retries: u32,
    /// Idle time after which a pending message may be claimed
    pub visibility_timeout: Duration,
    /// How long a submission blocks duplicates for the same video
    pub dedup_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "vod:runs".to_string(),
            consumer_group: "vod:workers".to_string(),
            dlq_stream_name: "vod:runs:dlq".to_string(),
            max_retries: 3,
            visibility_timeout: Duration::from_secs(1800),
            dedup_ttl: Duration::from_secs(6 * 3600),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            max_retries: std::env::var("QUEUE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            visibility_timeout: std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            dedup_ttl: std::env::var("QUEUE_DEDUP_TTL")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.dedup_ttl),
        }
    }
}

/// Result of submitting a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new message was added with this stream id.
    Enqueued(String),
    /// A run for the same video is already queued or in flight.
    Duplicate,
}

/// Run queue client.
pub struct RunQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl RunQueue {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn dedup_key(video_id: &VideoId) -> String {
        format!("vod:dedup:run:{}", video_id)
    }

    fn retry_key(message_id: &str) -> String {
        format!("vod:retry:{}", message_id)
    }

    /// Create the consumer group if it does not exist.
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Submit a run. Duplicate submissions for a video that is already
    /// queued or running are coalesced.
    pub async fn enqueue(&self, request: RunRequest) -> QueueResult<EnqueueOutcome> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let job = RunJob::new(request);
        let payload = serde_json::to_string(&job)?;

        // SET NX makes the duplicate check and the claim one step.
        let dedup_key = Self::dedup_key(job.video_id());
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&dedup_key)
            .arg(&job.job_id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.dedup_ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        if claimed.is_none() {
            info!(video_id = %job.video_id(), "Duplicate run coalesced");
            return Ok(EnqueueOutcome::Duplicate);
        }

        let added: Result<String, redis::RedisError> = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("key")
            .arg(job.idempotency_key())
            .query_async(&mut conn)
            .await;

        let message_id = match added {
            Ok(id) => id,
            Err(e) => {
                let _: Result<(), _> = conn.del(&dedup_key).await;
                return Err(QueueError::Redis(e));
            }
        };

        info!(
            video_id = %job.video_id(),
            job_id = %job.job_id,
            message_id = %message_id,
            "Enqueued run"
        );
        Ok(EnqueueOutcome::Enqueued(message_id))
    }

    /// Acknowledge and delete a message.
    pub async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        conn.del::<_, ()>(Self::retry_key(message_id)).await?;

        debug!("Acknowledged run message: {}", message_id);
        Ok(())
    }

    /// Finish a run: ack its message and allow future submissions for the video.
    pub async fn complete(&self, message_id: &str, job: &RunJob) -> QueueResult<()> {
        self.ack(message_id).await?;
        self.release_dedup(job.video_id()).await
    }

    /// Drop the duplicate guard for a video.
    pub async fn release_dedup(&self, video_id: &VideoId) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(Self::dedup_key(video_id)).await?;
        Ok(())
    }

    /// Move a message to the dead letter stream.
    pub async fn dlq(&self, message_id: &str, job: &RunJob, error: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(job)?;

        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.complete(message_id, job).await?;

        warn!(video_id = %job.video_id(), "Moved run to DLQ: {}", error);
        Ok(())
    }

    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.xlen(&self.config.stream_name).await?)
    }

    pub async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.xlen(&self.config.dlq_stream_name).await?)
    }

    /// Read new messages for this consumer.
    pub async fn consume(
        &self,
        consumer_name: &str,
        block_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<(String, RunJob)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Option<redis::streams::StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let entries = result
            .map(|reply| reply.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();
        Ok(self.decode_entries(entries, "consumed").await)
    }

    /// Claim messages left pending by crashed consumers.
    pub async fn claim_pending(
        &self,
        consumer_name: &str,
        count: usize,
    ) -> QueueResult<Vec<(String, RunJob)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let min_idle_ms = self.config.visibility_timeout.as_millis() as u64;

        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms as u64 >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let reply: redis::streams::StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(min_idle_ms)
            .arg(&stale)
            .query_async(&mut conn)
            .await?;

        for entry in &reply.ids {
            info!("Claimed pending run message {}", entry.id);
        }
        Ok(self.decode_entries(reply.ids, "claimed").await)
    }

    async fn decode_entries(
        &self,
        entries: Vec<redis::streams::StreamId>,
        action: &str,
    ) -> Vec<(String, RunJob)> {
        let mut jobs = Vec::new();
        for entry in entries {
            let message_id = entry.id.clone();
            let payload: Option<String> = entry.get("job");
            match payload.map(|p| serde_json::from_str::<RunJob>(&p)) {
                Some(Ok(job)) => {
                    debug!(video_id = %job.video_id(), "Run message {}", action);
                    jobs.push((message_id, job));
                }
                Some(Err(e)) => {
                    warn!("Failed to parse run payload: {}", e);
                    self.ack(&message_id).await.ok();
                }
                None => {
                    warn!("Run message {} has no payload", message_id);
                    self.ack(&message_id).await.ok();
                }
            }
        }
        jobs
    }

    pub async fn get_retry_count(&self, message_id: &str) -> QueueResult<u32> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: Option<u32> = conn.get(Self::retry_key(message_id)).await?;
        Ok(count.unwrap_or(0))
    }

    /// Count one more delivery of a message.
    pub async fn increment_retry(&self, message_id: &str) -> QueueResult<u32> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::retry_key(message_id);
        let count: u32 = conn.incr(&key, 1).await?;
        conn.expire::<_, ()>(&key, 86400).await?;
        Ok(count)
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &VideoId) -> RunRequest {
        RunRequest::new(id.clone(), format!("uploads/{id}/{id}.mp4"), "a.mp4", "video/mp4")
    }

    #[test]
    fn test_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.stream_name, "vod:runs");
        assert_eq!(config.max_retries, 3);
        assert!(config.visibility_timeout > Duration::from_secs(60));
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_duplicate_runs_are_coalesced() {
        let queue = RunQueue::new(QueueConfig {
            stream_name: "vod:test:runs".into(),
            consumer_group: "vod:test:workers".into(),
            dlq_stream_name: "vod:test:dlq".into(),
            ..QueueConfig::from_env()
        })
        .unwrap();
        queue.init().await.unwrap();

        let id = VideoId::new();
        let first = queue.enqueue(request(&id)).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
        assert_eq!(
            queue.enqueue(request(&id)).await.unwrap(),
            EnqueueOutcome::Duplicate
        );

        let consumed = queue.consume("test-consumer", 100, 10).await.unwrap();
        let (message_id, job) = consumed
            .into_iter()
            .find(|(_, job)| job.video_id() == &id)
            .unwrap();
        queue.complete(&message_id, &job).await.unwrap();

        assert!(matches!(
            queue.enqueue(request(&id)).await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));
    }
}
