use chrono::Utc;

use podscale_common::config::Config;
use podscale_common::types::{Worker, WorkerMetadata, WorkerStatus};
use podscale_common::WorkerId;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::health::{self, HealthSignals};
use crate::provider::{PodSpec, ProviderClient};
use crate::reconciler::ReconcilerDecision;
use crate::store::Store;

/// Outcome of one cycle's actuation, folded into the cycle record.
#[derive(Debug, Default)]
pub struct ActuationResult {
    pub workers_spawned: u32,
    pub workers_terminated: u32,
    pub tasks_reset: u32,
}

/// Applies a [`ReconcilerDecision`] plus [`HealthSignals`]-driven forced
/// terminations against the store and provider.
pub struct Actuator<'a> {
    store: &'a dyn Store,
    provider: &'a dyn ProviderClient,
    circuit_breakers: &'a CircuitBreakerRegistry,
    cfg: &'a Config,
}

impl<'a> Actuator<'a> {
    pub fn new(
        store: &'a dyn Store,
        provider: &'a dyn ProviderClient,
        circuit_breakers: &'a CircuitBreakerRegistry,
        cfg: &'a Config,
    ) -> Self {
        Self {
            store,
            provider,
            circuit_breakers,
            cfg,
        }
    }

    /// Runs the full per-cycle actuation sequence: forced terminations,
    /// stuck-task recovery, promotions, then the reconciler's scale delta.
    pub async fn act(
        &self,
        decision: &ReconcilerDecision,
        signals: &HealthSignals,
        workers: &[Worker],
    ) -> ActuationResult {
        let mut result = ActuationResult::default();

        self.mark_stale_workers_error(signals, &mut result).await;
        self.recover_stuck_tasks(signals, &mut result).await;
        self.promote_spawning_workers(workers).await;
        self.cleanup_error_workers(workers, &mut result).await;
        self.cleanup_spawning_timeouts(signals, &mut result).await;
        self.reconcile_terminating_workers(workers, &mut result).await;

        if decision.delta > 0 {
            self.scale_up(decision.delta as u32, &mut result).await;
        } else if decision.delta < 0 {
            self.scale_down((-decision.delta) as u32, workers, &mut result)
                .await;
        }

        result
    }

    /// Drives every given worker through the termination sequence once,
    /// regardless of its current grace period or timeout. Used only for the
    /// shutdown-time sweep of rows stuck in `terminating`.
    pub async fn finish_terminating(&self, workers: &[Worker]) -> ActuationResult {
        let mut result = ActuationResult::default();
        for worker in workers {
            self.terminate_worker(worker, &mut result).await;
        }
        result
    }

    async fn mark_stale_workers_error(&self, signals: &HealthSignals, result: &mut ActuationResult) {
        if signals.stale_workers.is_empty() {
            return;
        }

        let failed_ids = health::failed_worker_ids(signals);
        match self.store.reset_orphaned_tasks(&failed_ids).await {
            Ok(n) => {
                result.tasks_reset += n;
                self.circuit_breakers.store.record_success();
            }
            Err(e) => {
                self.circuit_breakers.store.record_failure();
                tracing::warn!(error = %e, "failed to reset orphaned tasks for failed workers");
            }
        }

        for worker in &signals.stale_workers {
            let patch = WorkerMetadata {
                error_reason: Some("heartbeat_timeout".to_string()),
                error_timestamp: Some(Utc::now()),
                ..Default::default()
            };
            if let Err(e) = self
                .store
                .update_worker_status(&worker.id, WorkerStatus::Error, patch)
                .await
            {
                tracing::warn!(worker = %worker.id, error = %e, "failed to mark stale worker as error");
            }
        }
    }

    async fn recover_stuck_tasks(&self, signals: &HealthSignals, result: &mut ActuationResult) {
        let worker_ids: Vec<WorkerId> = signals
            .stuck_tasks
            .iter()
            .filter_map(|t| t.worker_id.clone())
            .collect();

        if worker_ids.is_empty() {
            return;
        }

        match self.store.reset_orphaned_tasks(&worker_ids).await {
            Ok(n) => result.tasks_reset += n,
            Err(e) => {
                self.circuit_breakers.store.record_failure();
                tracing::warn!(error = %e, "failed to reset stuck tasks");
                return;
            }
        }
        self.circuit_breakers.store.record_success();

        for id in &worker_ids {
            let patch = WorkerMetadata {
                error_reason: Some("stuck_task".to_string()),
                error_timestamp: Some(Utc::now()),
                ..Default::default()
            };
            let _ = self
                .store
                .update_worker_status(id, WorkerStatus::Error, patch)
                .await;
        }
    }

    async fn promote_spawning_workers(&self, workers: &[Worker]) {
        for worker in workers.iter().filter(|w| w.status == WorkerStatus::Spawning) {
            let heartbeat_fresh = worker
                .last_heartbeat
                .map(|h| Utc::now() - h < chrono::Duration::from_std(self.cfg.heartbeat_timeout()).unwrap())
                .unwrap_or(false);

            let processed = self
                .store
                .has_processed_tasks(&worker.id)
                .await
                .unwrap_or(false);

            if heartbeat_fresh || processed {
                let patch = WorkerMetadata {
                    promoted_to_active_at: Some(Utc::now()),
                    ..Default::default()
                };
                let _ = self
                    .store
                    .update_worker_status(&worker.id, WorkerStatus::Active, patch)
                    .await;
            }
        }
    }

    async fn cleanup_error_workers(&self, workers: &[Worker], result: &mut ActuationResult) {
        let grace = chrono::Duration::from_std(self.cfg.error_cleanup_grace_period()).unwrap();
        for worker in workers.iter().filter(|w| w.status == WorkerStatus::Error) {
            let past_grace = worker
                .metadata
                .error_timestamp
                .map(|t| Utc::now() - t > grace)
                .unwrap_or(true);
            if past_grace {
                self.terminate_worker(worker, result).await;
            }
        }
    }

    async fn cleanup_spawning_timeouts(&self, signals: &HealthSignals, result: &mut ActuationResult) {
        for worker in &signals.spawning_timeouts {
            let patch = WorkerMetadata {
                error_reason: Some("spawn_timeout".to_string()),
                error_timestamp: Some(Utc::now()),
                ..Default::default()
            };
            let _ = self
                .store
                .update_worker_status(&worker.id, WorkerStatus::Error, patch)
                .await;
            self.terminate_worker(worker, result).await;
        }
    }

    /// Re-drives every row still in `terminating`: rows within the timeout
    /// get a fresh attempt at the termination sequence (the provider call
    /// may have failed transiently last cycle), rows past it are forced to
    /// `terminated` without waiting on the provider any further.
    async fn reconcile_terminating_workers(&self, workers: &[Worker], result: &mut ActuationResult) {
        let timeout = chrono::Duration::from_std(self.cfg.terminating_timeout()).unwrap();
        for worker in workers.iter().filter(|w| w.status == WorkerStatus::Terminating) {
            let age = worker.metadata.terminated_at.map(|t| Utc::now() - t);
            let stuck = age.map(|a| a > timeout).unwrap_or(true);
            if stuck {
                let patch = WorkerMetadata {
                    error_reason: Some("terminating_timeout".to_string()),
                    ..Default::default()
                };
                let _ = self
                    .store
                    .update_worker_status(&worker.id, WorkerStatus::Terminated, patch)
                    .await;
                result.workers_terminated += 1;
            } else {
                self.terminate_worker(worker, result).await;
            }
        }
    }

    async fn scale_up(&self, count: u32, result: &mut ActuationResult) {
        if !self.circuit_breakers.provider.allow() {
            tracing::warn!("provider circuit open, skipping scale-up this cycle");
            return;
        }

        for _ in 0..count {
            let worker = Worker::new("default");

            if let Err(e) = self.store.create_worker(&worker).await {
                tracing::warn!(error = %e, "failed to create worker row, aborting scale-up this cycle");
                self.circuit_breakers.store.record_failure();
                return;
            }
            self.circuit_breakers.store.record_success();

            let spec = PodSpec {
                instance_type: worker.instance_type.clone(),
            };

            match self.provider.create_pod(&spec).await {
                Ok(pod_id) => {
                    self.circuit_breakers.provider.record_success();
                    let patch = WorkerMetadata {
                        provider_pod_id: Some(pod_id),
                        ..Default::default()
                    };
                    let _ = self
                        .store
                        .update_worker_status(&worker.id, WorkerStatus::Spawning, patch)
                        .await;
                    result.workers_spawned += 1;
                }
                Err(e) => {
                    self.circuit_breakers.provider.record_failure();
                    tracing::warn!(worker = %worker.id, error = %e, "spawn failed, stopping scale-up this cycle");
                    let patch = WorkerMetadata {
                        error_reason: Some(format!("spawn_failed:{e}")),
                        error_timestamp: Some(Utc::now()),
                        ..Default::default()
                    };
                    let _ = self
                        .store
                        .update_worker_status(&worker.id, WorkerStatus::Error, patch)
                        .await;
                    return;
                }
            }
        }
    }

    async fn scale_down(&self, count: u32, workers: &[Worker], result: &mut ActuationResult) {
        let victims = self.select_victims(count, workers).await;
        for worker in victims {
            self.terminate_worker(&worker, result).await;
        }
    }

    /// Victim selection per the configured policy: timed-out spawning
    /// workers first, then idle active workers oldest-first. Never selects
    /// a worker with a running task.
    async fn select_victims(&self, count: u32, workers: &[Worker]) -> Vec<Worker> {
        let spawn_cutoff = Utc::now() - chrono::Duration::from_std(self.cfg.spawn_timeout()).unwrap();
        let grace = chrono::Duration::from_std(self.cfg.worker_grace_period()).unwrap();

        let mut timed_out_spawning: Vec<Worker> = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Spawning && w.created_at < spawn_cutoff)
            .cloned()
            .collect();
        timed_out_spawning.sort_by_key(|w| w.created_at);

        let mut idle_active = Vec::new();
        for worker in workers.iter().filter(|w| w.status == WorkerStatus::Active) {
            let in_grace = worker
                .metadata
                .promoted_to_active_at
                .map(|t| Utc::now() - t < grace)
                .unwrap_or(false);
            if in_grace {
                continue;
            }
            let has_running = self
                .store
                .has_running_tasks(&worker.id)
                .await
                .unwrap_or(true);
            if worker.is_idle(has_running) {
                idle_active.push(worker.clone());
            }
        }
        idle_active.sort_by_key(|w| w.created_at);

        timed_out_spawning
            .into_iter()
            .chain(idle_active)
            .take(count as usize)
            .collect()
    }

    /// Runs the termination sequence for one worker: mark terminating,
    /// reset orphaned tasks (must precede the provider call), terminate the
    /// pod, then mark terminated.
    async fn terminate_worker(&self, worker: &Worker, result: &mut ActuationResult) {
        // Only stamp terminated_at on first entry into the state; retrying an
        // already-terminating row must not push its timeout clock back out.
        if worker.status != WorkerStatus::Terminating {
            let _ = self
                .store
                .update_worker_status(
                    &worker.id,
                    WorkerStatus::Terminating,
                    WorkerMetadata {
                        terminated_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await;
        }

        if let Err(e) = self.store.reset_orphaned_tasks(&[worker.id.clone()]).await {
            tracing::warn!(worker = %worker.id, error = %e, "failed to reset orphaned tasks before termination");
        }

        let pod_id = worker.metadata.provider_pod_id.clone();
        let terminate_outcome = if let Some(pod_id) = pod_id {
            if self.circuit_breakers.provider.allow() {
                self.provider.terminate_pod(&pod_id).await
            } else {
                Err(crate::provider::ProviderError::Transient(
                    "provider circuit open".to_string(),
                ))
            }
        } else {
            // No pod was ever created (failed before step 3 of scale-up); nothing to terminate.
            Ok(())
        };

        match terminate_outcome {
            Ok(()) => {
                self.circuit_breakers.provider.record_success();
                let _ = self
                    .store
                    .update_worker_status(&worker.id, WorkerStatus::Terminated, WorkerMetadata::default())
                    .await;
                result.workers_terminated += 1;
            }
            Err(e) => {
                self.circuit_breakers.provider.record_failure();
                tracing::warn!(worker = %worker.id, error = %e, "provider termination failed, deferring to next cycle");
            }
        }
    }
}
