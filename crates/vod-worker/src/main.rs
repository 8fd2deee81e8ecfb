//! VOD transcoding worker binary.

use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vod_queue::{LeaseManager, RunQueue};
use vod_worker::{Orchestrator, PipelineDeps, RunExecutor, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS to S3, Redis and Postgres)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();

    init_tracing()?;

    info!("Starting vod-worker");

    if let Ok(addr) = std::env::var("WORKER_METRICS_ADDR") {
        let addr: SocketAddr = addr.parse().context("WORKER_METRICS_ADDR")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Metrics exporter listening on {}", addr);
    }

    let config = WorkerConfig::from_env()?;
    info!("Worker config: {:?}", config);

    let queue = match RunQueue::from_env() {
        Ok(q) => q,
        Err(e) => {
            error!("Failed to create run queue: {}", e);
            std::process::exit(1);
        }
    };

    let lease_ttl = config.lease_ttl;
    let leases_enabled = config.leases_enabled;
    let deps = match PipelineDeps::from_env(config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("Failed to initialize pipeline dependencies: {}", e);
            std::process::exit(1);
        }
    };

    let mut orchestrator = Orchestrator::new(deps);
    if leases_enabled {
        orchestrator = orchestrator.with_leases(LeaseManager::new(queue.client().clone(), lease_ttl));
    } else {
        warn!("Per-video leases disabled, runs are only exclusive within this process");
    }

    let executor = RunExecutor::new(orchestrator, queue);

    let shutdown = executor.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        let _ = shutdown.send(true);
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Colored output for dev, JSON for production.
fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vod_worker=info".parse()?)
        .add_directive("vod_media=info".parse()?)
        .add_directive("vod_queue=info".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("aws_config=warn".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}
