//! Video-processing worker binary.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use renderq_engine::{EngineConfig, Orchestrator};
use renderq_redis::{RedisCheckpointStore, RedisConfig, RedisLeaseStore, RedisTaskQueue};
use renderq_worker::{ShellCodecEngine, TaskRunner, WorkerConfig};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("renderq=info".parse().unwrap());

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

    info!("Starting renderq-worker");

    // Prometheus scrape endpoint
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        error!("Failed to install metrics exporter: {}", e);
    }

    let worker_config = WorkerConfig::from_env();
    info!("Worker config: {:?}", worker_config);

    let redis_config = RedisConfig::from_env();
    let queue = match RedisTaskQueue::new(&redis_config) {
        Ok(q) => Arc::new(q),
        Err(e) => {
            error!("Failed to create task queue: {}", e);
            std::process::exit(1);
        }
    };
    let leases = match RedisLeaseStore::new(&redis_config) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            error!("Failed to create lease store: {}", e);
            std::process::exit(1);
        }
    };
    let checkpoints = match RedisCheckpointStore::new(&redis_config) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to create checkpoint store: {}", e);
            std::process::exit(1);
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        EngineConfig::from_env(),
        queue,
        leases,
        checkpoints,
    ));

    let codec = match ShellCodecEngine::new(&worker_config.codec_command) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to resolve codec command: {}", e);
            std::process::exit(1);
        }
    };

    let runner = Arc::new(TaskRunner::new(
        worker_config,
        Arc::clone(&orchestrator),
        codec,
    ));
    let reaper = orchestrator.spawn_reaper(runner.shutdown_signal());

    // Shut down cleanly on ctrl-c
    let signal_runner = Arc::clone(&runner);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_runner.shutdown();
    });

    if let Err(e) = runner.run().await {
        error!("Runner error: {}", e);
        std::process::exit(1);
    }

    reaper.await.ok();
    info!("Worker shutdown complete");
}
