use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use podscale_common::config::Config;
use podscale_common::types::{Task, TaskStatus, Worker, WorkerMetadata, WorkerStatus};
use podscale_common::TaskId;
use podscale_orchestrator::circuit_breaker::CircuitBreakerRegistry;
use podscale_orchestrator::control_loop::ControlLoop;
use podscale_orchestrator::demand::{DemandOracle, DemandOracleError};
use podscale_orchestrator::provider::InMemoryProviderClient;
use podscale_orchestrator::store::{InMemoryStore, Store};

/// Reports a fixed dispatchable count, set by the test.
struct FixedDemandOracle(AtomicU32);

impl FixedDemandOracle {
    fn new(count: u32) -> Self {
        Self(AtomicU32::new(count))
    }
}

#[async_trait]
impl DemandOracle for FixedDemandOracle {
    async fn dispatchable_task_count(&self, _run_type: &str) -> Result<u32, DemandOracleError> {
        Ok(self.0.load(Ordering::Relaxed))
    }
}

fn test_config() -> Config {
    let mut cfg = Config::from_env();
    cfg.provider_api_key = Some("test-key".to_string());
    cfg.min_active_gpus = 1;
    cfg.max_active_gpus = 10;
    cfg.tasks_per_gpu_threshold = 3;
    cfg.idle_buffer = 0;
    cfg.allow_zero_floor = false;
    cfg.heartbeat_timeout_sec = 300;
    cfg.spawn_timeout_sec = 300;
    cfg.stuck_task_timeout_sec = 600;
    cfg.error_cleanup_grace_period_sec = 600;
    cfg
}

fn harness(cfg: Config, demand: u32) -> (Arc<ControlLoop>, Arc<InMemoryStore>, Arc<InMemoryProviderClient>) {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(InMemoryProviderClient::new());
    let oracle: Arc<dyn DemandOracle> = Arc::new(FixedDemandOracle::new(demand));
    let breakers = Arc::new(CircuitBreakerRegistry::new());

    let store_dyn: Arc<dyn Store> = store.clone();
    let provider_dyn: Arc<dyn podscale_orchestrator::provider::ProviderClient> = provider.clone();

    let loop_ = Arc::new(ControlLoop::new(store_dyn, provider_dyn, oracle, breakers, cfg));

    (loop_, store, provider)
}

/// S1: cold start, demand 0, floor 1 — cycle 1 spawns exactly one worker.
#[tokio::test]
async fn s1_cold_start_spawns_floor_worker() {
    let (loop_, store, provider) = harness(test_config(), 0);

    loop_.tick().await;

    let workers = store.get_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].status, WorkerStatus::Spawning);
    assert_eq!(provider.pod_count().await, 1);

    // Cycle 2, still no heartbeat: no additional spawn, capacity already at floor.
    loop_.tick().await;
    let workers = store.get_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
}

/// S4: a stuck task's worker is reset to queued and the worker errors, then
/// is eventually terminated once past the error grace period.
#[tokio::test]
async fn s4_stuck_task_recovers_and_errors_worker() {
    let cfg = test_config();
    let (loop_, store, _provider) = harness(cfg.clone(), 0);

    let mut worker = Worker::new("a100");
    worker.status = WorkerStatus::Active;
    worker.last_heartbeat = Some(Utc::now());
    let worker_id = worker.id.clone();
    store.seed_worker(worker).await;

    let task = Task {
        id: TaskId::new(),
        status: TaskStatus::Running,
        worker_id: Some(worker_id.clone()),
        task_type: "generate".to_string(),
        run_type: cfg.run_type.clone(),
        user_id: "u1".to_string(),
        generation_started_at: Some(Utc::now() - chrono::Duration::minutes(15)),
    };
    store.seed_task(task.clone()).await;

    loop_.tick().await;

    let reset_task = store.get_task(&task.id).await.unwrap();
    assert_eq!(reset_task.status, TaskStatus::Queued);
    assert!(reset_task.worker_id.is_none());

    let worker = store.get_worker(&worker_id).await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Error);
}

/// S5: a worker that stops heartbeating is marked errored with a reason
/// naming the heartbeat timeout.
#[tokio::test]
async fn s5_heartbeat_loss_marks_worker_error() {
    let (loop_, store, _provider) = harness(test_config(), 0);

    let mut worker = Worker::new("a100");
    worker.status = WorkerStatus::Active;
    worker.last_heartbeat = Some(Utc::now() - chrono::Duration::minutes(10));
    let worker_id = worker.id.clone();
    store.seed_worker(worker).await;

    loop_.tick().await;

    let worker = store.get_worker(&worker_id).await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Error);
    assert!(worker
        .metadata
        .error_reason
        .as_deref()
        .unwrap_or_default()
        .contains("heartbeat"));
}

/// S6: terminating a pod the provider no longer knows about is treated as a
/// successful termination, not retried. Exercised directly against the
/// actuator's unconditional termination path, the same one the shutdown-time
/// sweep uses for rows already sitting in `terminating`.
#[tokio::test]
async fn s6_provider_404_on_terminate_is_success() {
    let cfg = test_config();
    let store = InMemoryStore::new();
    let provider = InMemoryProviderClient::new();
    let breakers = CircuitBreakerRegistry::new();

    let mut worker = Worker::new("a100");
    worker.status = WorkerStatus::Terminating;
    worker.metadata = WorkerMetadata {
        provider_pod_id: Some("pod-already-gone".to_string()),
        ..Default::default()
    };
    let worker_id = worker.id.clone();
    store.seed_worker(worker.clone()).await;

    // The pod was never registered with the fake provider, so terminate_pod
    // behaves like a 404: it simply finds nothing to remove and succeeds.
    assert_eq!(provider.pod_count().await, 0);

    let actuator = podscale_orchestrator::actuator::Actuator::new(&store, &provider, &breakers, &cfg);
    let result = actuator.finish_terminating(&[worker]).await;
    assert_eq!(result.workers_terminated, 1);

    let worker = store.get_worker(&worker_id).await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Terminated);
}
