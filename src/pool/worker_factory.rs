// src/pool/worker_factory.rs
//! Worker process lifecycle: create, terminate, restart
//!
//! Readiness is a grace period: a freshly launched process that is still
//! alive after `startup_grace` counts as ready. Launch plus grace is bounded
//! by `startup_timeout`.

use crate::pool::types::{WorkerProcess, WorkerStatus};
use crate::process::executor::ProcessExecutor;
use crate::process::process_manager::SpawnConfig;
use crate::utils::config::{ShutdownConfig, WorkerSpec};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use ulid::Ulid;

pub struct WorkerFactory {
    pool_id: String,
    spec: WorkerSpec,
    shutdown: ShutdownConfig,
    executor: Arc<dyn ProcessExecutor>,
}

impl WorkerFactory {
    pub fn new(
        pool_id: impl Into<String>,
        spec: WorkerSpec,
        shutdown: ShutdownConfig,
        executor: Arc<dyn ProcessExecutor>,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            spec,
            shutdown,
            executor,
        }
    }

    fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            command: self.spec.command.clone(),
            args: self.spec.args.clone(),
            work_dir: self.spec.cwd.clone(),
            env_vars: self.spec.env.clone(),
            capture_output: false,
        }
    }

    /// Launch a worker into `slot` and wait until it is ready
    pub async fn create_worker(&self, slot: usize) -> Result<WorkerProcess> {
        let worker_id = format!("worker-{}", Ulid::new().to_string().to_lowercase());
        let config = self.spawn_config();
        debug!("Spawning worker {} for pool {} (slot {})", worker_id, self.pool_id, slot);

        let launch = async {
            let handle = self.executor.spawn(&worker_id, &config).await?;
            tokio::time::sleep(self.spec.startup_grace()).await;
            if !self.executor.is_alive(&handle) {
                return Err(EngineError::WorkerSpawnFailed(format!(
                    "worker {} exited during startup",
                    worker_id
                )));
            }
            Ok(handle)
        };

        let handle = tokio::time::timeout(self.spec.startup_timeout(), launch)
            .await
            .map_err(|_| {
                EngineError::WorkerSpawnFailed(format!(
                    "worker {} not ready after {:?}",
                    worker_id,
                    self.spec.startup_timeout()
                ))
            })??;

        let now = Utc::now();
        info!(
            "Worker {} ready in pool {} (PID {:?})",
            worker_id, self.pool_id, handle.pid
        );
        Ok(WorkerProcess {
            id: worker_id,
            pool_id: self.pool_id.clone(),
            slot,
            process: handle,
            status: WorkerStatus::Idle,
            created_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            task_count: 0,
            failure_count: 0,
            current_task_id: None,
        })
    }

    /// Graceful stop, then force-kill
    pub async fn terminate_worker(&self, worker: &WorkerProcess) -> Result<()> {
        debug!("Terminating worker {} in pool {}", worker.id, self.pool_id);
        self.executor
            .terminate(
                &worker.process,
                self.shutdown.graceful_timeout(),
                self.shutdown.force_kill_timeout(),
            )
            .await
    }

    /// Terminate then create a fresh worker in the same slot.
    /// The old id is retired.
    pub async fn restart_worker(&self, worker: &WorkerProcess) -> Result<WorkerProcess> {
        if let Err(e) = self.terminate_worker(worker).await {
            warn!("Worker {} did not terminate cleanly: {}", worker.id, e);
        }
        self.create_worker(worker.slot).await
    }

    pub fn is_alive(&self, worker: &WorkerProcess) -> bool {
        self.executor.is_alive(&worker.process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::ScriptedExecutor;

    fn factory(executor: Arc<ScriptedExecutor>) -> WorkerFactory {
        let mut spec = WorkerSpec::new("worker");
        spec.startup_grace_ms = 1;
        WorkerFactory::new("pool", spec, ShutdownConfig::default(), executor)
    }

    #[tokio::test]
    async fn test_create_worker_is_idle() {
        let executor = Arc::new(ScriptedExecutor::new());
        let factory = factory(executor.clone());

        let worker = factory.create_worker(3).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.slot, 3);
        assert_eq!(worker.pool_id, "pool");
        assert!(factory.is_alive(&worker));
        assert_eq!(executor.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail_next_spawns(1);
        let factory = factory(executor);

        let result = factory.create_worker(0).await;
        assert!(matches!(result, Err(EngineError::WorkerSpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_restart_retires_id_and_keeps_slot() {
        let executor = Arc::new(ScriptedExecutor::new());
        let factory = factory(executor.clone());

        let old = factory.create_worker(1).await.unwrap();
        let new = factory.restart_worker(&old).await.unwrap();

        assert_ne!(old.id, new.id);
        assert_eq!(new.slot, 1);
        assert!(!factory.is_alive(&old));
        assert!(factory.is_alive(&new));
        assert_eq!(executor.termination_count(), 1);
    }
}
