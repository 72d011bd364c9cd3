// src/observability.rs
//! Tracing and metrics setup
//!
//! Metric names:
//!
//! - `procfleet_tasks_finished_total{pool, outcome}`
//! - `procfleet_task_duration_seconds{pool}`
//! - `procfleet_tasks_queued{pool}`
//! - `procfleet_workers_events_total{pool, event}`
//! - `procfleet_workers_total{pool}` / `procfleet_workers_busy{pool}`
//!
//! Recording is a no-op until [`init_metrics`] installs an exporter.

use crate::utils::config::{LogFormat, ObservabilityConfig};
use crate::utils::errors::{EngineError, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| EngineError::Observability(format!("invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
    };
    installed.map_err(|e| EngineError::Observability(e.to_string()))
}

/// Serve Prometheus metrics on `addr`; does nothing without an address
pub fn init_metrics(addr: Option<&str>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };
    let listen: SocketAddr = addr
        .parse()
        .map_err(|e| EngineError::Observability(format!("invalid metrics address {}: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .map_err(|e| EngineError::Observability(e.to_string()))?;

    describe_counter!("procfleet_tasks_finished_total", "Tasks that reached a final result");
    describe_histogram!(
        "procfleet_task_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time of finished tasks"
    );
    describe_gauge!("procfleet_tasks_queued", "Tasks waiting for a worker");
    describe_counter!("procfleet_workers_events_total", "Worker lifecycle transitions");
    describe_gauge!("procfleet_workers_total", "Workers in the roster");
    describe_gauge!("procfleet_workers_busy", "Workers running a task");

    info!("Prometheus metrics listening on {}", listen);
    Ok(())
}

pub(crate) fn record_task_result(pool_id: &str, success: bool, duration: Duration) {
    let outcome = if success { "success" } else { "failure" };
    counter!("procfleet_tasks_finished_total", "pool" => pool_id.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("procfleet_task_duration_seconds", "pool" => pool_id.to_string())
        .record(duration.as_secs_f64());
}

pub(crate) fn record_worker_event(pool_id: &str, event: &'static str) {
    counter!("procfleet_workers_events_total", "pool" => pool_id.to_string(), "event" => event)
        .increment(1);
}

pub(crate) fn set_queue_depth(pool_id: &str, depth: usize) {
    gauge!("procfleet_tasks_queued", "pool" => pool_id.to_string()).set(depth as f64);
}

pub(crate) fn set_pool_gauges(pool_id: &str, total: usize, busy: usize) {
    gauge!("procfleet_workers_total", "pool" => pool_id.to_string()).set(total as f64);
    gauge!("procfleet_workers_busy", "pool" => pool_id.to_string()).set(busy as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_address() {
        assert!(init_metrics(None).is_ok());
    }

    #[test]
    fn test_invalid_metrics_address() {
        let result = init_metrics(Some("not an address"));
        assert!(matches!(result, Err(EngineError::Observability(_))));
    }

    #[test]
    fn test_recording_without_exporter() {
        record_task_result("pool", true, Duration::from_millis(5));
        record_worker_event("pool", "spawned");
        set_queue_depth("pool", 3);
        set_pool_gauges("pool", 2, 1);
    }
}
