// src/main.rs
//! Procfleet daemon
//!
//! Loads the engine configuration, starts every configured pool and runs
//! until interrupted.

use anyhow::{Context, Result};
use procfleet_engine::observability::{init_metrics, init_tracing};
use procfleet_engine::pool::events::PoolEventKind;
use procfleet_engine::{EngineConfig, PoolManager, SystemExecutor};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("failed to load configuration")?;

    init_tracing(&config.observability)?;
    init_metrics(config.observability.metrics_addr.as_deref())?;

    info!("Starting procfleet engine v{}", procfleet_engine::VERSION);

    let manager = Arc::new(PoolManager::new(
        config.manager.clone(),
        Arc::new(SystemExecutor::new()),
    ));
    manager.start();

    let mut events = manager.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match &event.kind {
                    PoolEventKind::PoolError { error } => warn!(pool = %event.pool_id, "{}", error),
                    PoolEventKind::WorkerFailed { error, .. } => {
                        warn!(pool = %event.pool_id, "worker failed: {}", error)
                    }
                    PoolEventKind::PoolScaled { from, to, reason } => {
                        info!(pool = %event.pool_id, "scaled {} -> {} ({})", from, to, reason)
                    }
                    kind => debug!(pool = %event.pool_id, event = ?kind),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Event log lagged by {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for pool_config in config.pools {
        let pool_id = pool_config.id.clone();
        match manager.create_pool(pool_config).await {
            Ok(pool) => info!(
                "Pool {} ready with {} workers",
                pool_id,
                pool.get_status().total_workers
            ),
            Err(e) => error!("Failed to create pool {}: {}", pool_id, e),
        }
    }

    if manager.pool_ids().is_empty() {
        warn!("No pools configured; waiting for shutdown");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C signal handler")?;
    info!("Received shutdown signal, cleaning up...");

    let metrics = manager.get_global_metrics();
    manager.shutdown().await?;
    event_log.abort();

    info!(
        "Engine stopped: {} tasks completed, {} failed",
        metrics.tasks_completed, metrics.tasks_failed
    );
    Ok(())
}
