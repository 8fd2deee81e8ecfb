//! Application state.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use vod_catalog::{CatalogConfig, CatalogStore, PgCatalog};
use vod_models::RunRequest;
use vod_queue::{EnqueueOutcome, QueueResult, RunQueue};
use vod_storage::{NoopStreamCache, ObjectStore, RedisStreamCache, S3ObjectStore, StreamCache};

use crate::config::ApiConfig;
use crate::error::ApiResult;
use crate::gateway::StreamingGateway;

/// Destination for run requests.
#[async_trait]
pub trait RunSubmitter: Send + Sync {
    async fn submit(&self, request: RunRequest) -> QueueResult<EnqueueOutcome>;

    /// Reachability probe used by readiness checks.
    async fn check_connectivity(&self) -> QueueResult<()>;
}

#[async_trait]
impl RunSubmitter for RunQueue {
    async fn submit(&self, request: RunRequest) -> QueueResult<EnqueueOutcome> {
        self.enqueue(request).await
    }

    async fn check_connectivity(&self) -> QueueResult<()> {
        self.len().await.map(|_| ())
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub gateway: StreamingGateway,
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub runs: Arc<dyn RunSubmitter>,
}

impl AppState {
    pub fn new(
        config: ApiConfig,
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn CatalogStore>,
        cache: Arc<dyn StreamCache>,
        runs: Arc<dyn RunSubmitter>,
    ) -> Self {
        let gateway = StreamingGateway::new(
            Arc::clone(&catalog),
            Arc::clone(&store),
            cache,
            config.gateway.clone(),
        );
        Self {
            config,
            gateway,
            store,
            catalog,
            runs,
        }
    }

    /// Wire production adapters from the environment.
    pub async fn from_env(config: ApiConfig) -> ApiResult<Self> {
        let store = S3ObjectStore::from_env()?;
        let catalog = PgCatalog::connect(&CatalogConfig::from_env()?).await?;

        let queue = RunQueue::from_env()?;
        queue.init().await?;

        // The stream cache only accelerates reads; run without it if absent.
        let cache: Arc<dyn StreamCache> = match std::env::var("REDIS_URL") {
            Ok(url) => match RedisStreamCache::connect(&url).await {
                Ok(cache) => {
                    info!("Stream cache connected");
                    Arc::new(cache)
                }
                Err(e) => {
                    warn!("Stream cache unavailable, serving redirects only: {}", e);
                    Arc::new(NoopStreamCache)
                }
            },
            Err(_) => Arc::new(NoopStreamCache),
        };

        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(catalog),
            cache,
            Arc::new(queue),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use super::*;

    #[test]
    fn test_from_env_fails_with_api_error() {
        fn assert_api_result<F: Future<Output = ApiResult<AppState>>>(_: F) {}
        assert_api_result(AppState::from_env(ApiConfig::default()));
    }
}
