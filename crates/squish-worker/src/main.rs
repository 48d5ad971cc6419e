//! Squish worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use squish_queue::{Notifier, QueueConfig, RedisEventBus, RedisQueue};
use squish_storage::StorageLayout;
use squish_store::RedisJobStore;
use squish_worker::{Dispatcher, ProcessorRegistry, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();
    info!("Starting squish-worker");

    let metrics_addr: SocketAddr = std::env::var("METRICS_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9100)));
    if let Err(e) = squish_worker::metrics::install_exporter(metrics_addr) {
        warn!(error = %e, "Prometheus exporter not installed");
    } else {
        info!(addr = %metrics_addr, "Prometheus exporter listening");
    }

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let layout = StorageLayout::new(&config.upload_root, &config.output_root);
    layout.init().await.context("failed to prepare storage roots")?;

    let store = RedisJobStore::from_env().context("failed to create job store")?;
    store.ping().await.context("job store is unreachable")?;
    let queue = RedisQueue::from_env().context("failed to create work queue")?;

    let queue_config = QueueConfig::from_env();
    let events = RedisEventBus::new(&queue_config.redis_url, queue_config.prefix.clone())
        .context("failed to create event bus")?;
    let (notifier, _pump) = Notifier::spawn(Arc::new(events), Notifier::DEFAULT_CAPACITY);

    let registry = ProcessorRegistry::with_defaults();
    info!(registry = ?registry, "Delegate processors registered");

    let dispatcher = Dispatcher::new(
        config,
        Arc::new(store),
        Arc::new(queue),
        Arc::new(registry),
        layout,
        notifier,
    );

    let signal_handle = dispatcher.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_handle.shutdown();
    });

    if let Err(e) = dispatcher.run().await {
        error!("Dispatcher error: {}", e);
        return Err(e.into());
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("squish=info,squish_worker=info,squish_queue=info,squish_store=info"));

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
