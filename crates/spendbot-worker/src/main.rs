//! Job processing worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use spendbot_models::SystemClock;
use spendbot_queue::{DualScopeLimiter, JobQueue, QueueConfig, RedisStore, SharedStore};
use spendbot_storage::{LocalResultStore, R2ResultStore, SharedResultStore};
use spendbot_worker::{
    metrics, CircuitBreaker, HandlerRegistry, HttpProvider, JobExecutor, JobProcessor,
    ResultStoreKind, WorkerConfig,
};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("spendbot=info,spendbot_worker=info,spendbot_queue=info"));

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
}

fn build_executor(config: WorkerConfig) -> anyhow::Result<JobExecutor> {
    let clock = SystemClock::shared();
    let queue_config = QueueConfig::from_env();

    let store: SharedStore =
        Arc::new(RedisStore::new(&queue_config.redis_url).context("Failed to create Redis store")?);
    let queue = Arc::new(JobQueue::new(queue_config, store.clone(), clock.clone()));

    let breaker = Arc::new(CircuitBreaker::new(
        "provider",
        config.circuit_breaker,
        clock.clone(),
    ));
    let limiter = Arc::new(DualScopeLimiter::with_configs(
        "ai_calls",
        config.user_ai_limit,
        config.global_ai_limit,
        store,
        clock,
    ));
    let provider = Arc::new(
        HttpProvider::new(config.provider.clone()).context("Failed to create provider client")?,
    );

    let mut processor = JobProcessor::new(queue, breaker, HandlerRegistry::with_provider(provider))
        .with_rate_limiter(limiter);

    let results: Option<SharedResultStore> = match &config.result_store {
        ResultStoreKind::None => None,
        ResultStoreKind::Local(dir) => {
            info!("Writing results to {}", dir.display());
            Some(Arc::new(LocalResultStore::new(dir.clone())))
        }
        ResultStoreKind::R2 => Some(Arc::new(
            R2ResultStore::from_env().context("Failed to configure R2 result store")?,
        )),
    };
    if let Some(results) = results {
        processor = processor.with_result_store(results);
    }

    Ok(JobExecutor::new(config, Arc::new(processor)))
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        match metrics::install_exporter(addr) {
            Ok(()) => info!("Metrics exporter listening on {}", addr),
            Err(e) => warn!("Failed to start metrics exporter: {}", e),
        }
    }

    let executor = Arc::new(build_executor(config)?);

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_executor.shutdown();
    });

    executor.run().await.context("Executor failed")?;
    Ok(())
}

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    let _ = rustls::crypto::ring::default_provider().install_default();

    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting spendbot-worker");

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}
