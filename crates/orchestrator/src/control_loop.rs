use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use podscale_common::config::Config;
use podscale_common::types::{CycleRecord, WorkerStatus};

use crate::actuator::Actuator;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::demand::DemandOracle;
use crate::health;
use crate::provider::ProviderClient;
use crate::reconciler::{reconcile, ReconcilerInput};
use crate::store::Store;

const STATUS_RING_BUFFER_CAPACITY: usize = 50;

/// The process-wide singleton driving `observe -> decide -> act -> record`
/// at a fixed cadence, with no drift: the next tick is scheduled from the
/// cycle's start time regardless of how long the cycle itself took.
pub struct ControlLoop {
    store: Arc<dyn Store>,
    provider: Arc<dyn ProviderClient>,
    demand_oracle: Arc<dyn DemandOracle>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    cfg: Config,
    cycle_number: AtomicU64,
    recent_cycles: RwLock<VecDeque<CycleRecord>>,
}

impl ControlLoop {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ProviderClient>,
        demand_oracle: Arc<dyn DemandOracle>,
        circuit_breakers: Arc<CircuitBreakerRegistry>,
        cfg: Config,
    ) -> Self {
        Self {
            store,
            provider,
            demand_oracle,
            circuit_breakers,
            cfg,
            cycle_number: AtomicU64::new(0),
            recent_cycles: RwLock::new(VecDeque::with_capacity(STATUS_RING_BUFFER_CAPACITY)),
        }
    }

    /// Returns the most recent cycle records, newest last, bounded to the
    /// ring buffer capacity. Backs the `/status` endpoint.
    pub async fn recent_cycles(&self) -> Vec<CycleRecord> {
        self.recent_cycles.read().await.iter().cloned().collect()
    }

    /// Runs forever at `POLL_INTERVAL`, until `shutdown` resolves. Never
    /// panics on a single cycle's failure; every external call is caught
    /// and folded into that cycle's record.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let cycle_start = tokio::time::Instant::now();
            self.tick().await;

            let elapsed = cycle_start.elapsed();
            let interval = self.cfg.poll_interval();
            let sleep_for = interval.saturating_sub(elapsed);

            if elapsed > interval {
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    interval_ms = interval.as_millis() as u64,
                    "cycle overran poll interval, proceeding immediately"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {},
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.final_termination_sweep().await;
    }

    /// Runs exactly one observe/decide/act/record cycle. Exposed publicly so
    /// integration tests can drive the loop deterministically instead of
    /// waiting on the poll interval.
    pub async fn tick(&self) {
        let cycle_number = self.cycle_number.fetch_add(1, Ordering::SeqCst) + 1;
        let span = tracing::info_span!("cycle", cycle_number);
        let _enter = span.enter();

        let cycle_start = Utc::now();
        let timer = tokio::time::Instant::now();

        let observe_budget = self.cfg.observe_budget();
        let observation = tokio::time::timeout(observe_budget, self.observe()).await;

        let Ok((workers, stuck_tasks, demand, degraded_demand_source)) = observation else {
            tracing::warn!("observe phase exceeded budget, skipping cycle");
            return;
        };

        let n_active = workers.iter().filter(|w| w.status == WorkerStatus::Active).count() as u32;
        let n_spawning = workers.iter().filter(|w| w.status == WorkerStatus::Spawning).count() as u32;
        let n_error = workers.iter().filter(|w| w.status == WorkerStatus::Error).count() as u32;
        let n_terminating = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Terminating)
            .count() as u32;

        let signals = health::assess(cycle_start, &workers, stuck_tasks, &self.cfg);

        let mut busy_workers = 0u32;
        for worker in workers.iter().filter(|w| w.status == WorkerStatus::Active) {
            let has_running = self.store.has_running_tasks(&worker.id).await.unwrap_or(false);
            if worker.is_busy(has_running) {
                busy_workers += 1;
            }
        }

        let input = ReconcilerInput {
            n_active,
            n_spawning,
            demand,
            busy_workers,
            failure_rate: signals.failure_rate,
        };
        let decision = reconcile(input, &self.cfg);

        let actuation = if let Some(open) = self.circuit_breakers.any_hard_open() {
            tracing::warn!(circuit = open, "hard dependency circuit open, skipping actuation this cycle");
            crate::actuator::ActuationResult::default()
        } else {
            let actuator = Actuator::new(
                self.store.as_ref(),
                self.provider.as_ref(),
                &self.circuit_breakers,
                &self.cfg,
            );
            actuator.act(&decision, &signals, &workers).await
        };

        let record = CycleRecord {
            cycle_number,
            timestamp: cycle_start,
            n_active,
            n_spawning,
            n_error,
            n_terminating,
            demand,
            busy: busy_workers,
            desired: decision.desired,
            delta: decision.delta,
            scale_up_blocked: decision.scale_up_blocked.map(|s| s.to_string()),
            workers_spawned: actuation.workers_spawned,
            workers_terminated: actuation.workers_terminated,
            tasks_reset: actuation.tasks_reset,
            failure_rate: signals.failure_rate,
            degraded_demand_source,
            duration_ms: timer.elapsed().as_millis() as u64,
        };

        tracing::info!(
            n_active,
            n_spawning,
            demand,
            desired = decision.desired,
            delta = decision.delta,
            workers_spawned = actuation.workers_spawned,
            workers_terminated = actuation.workers_terminated,
            tasks_reset = actuation.tasks_reset,
            "cycle complete"
        );

        self.publish_metrics(&record);
        self.push_record(record).await;
    }

    async fn observe(
        &self,
    ) -> (
        Vec<podscale_common::types::Worker>,
        Vec<podscale_common::types::Task>,
        u32,
        bool,
    ) {
        let workers_fut = self.store.get_workers();
        let stuck_fut = self.store.get_stuck_tasks(
            Utc::now() - chrono::Duration::from_std(self.cfg.stuck_task_timeout()).unwrap(),
            &self.cfg.orchestrator_task_markers,
        );
        let demand_fut = self.demand_oracle.dispatchable_task_count(&self.cfg.run_type);

        let (workers_res, stuck_res, demand_res) = tokio::join!(workers_fut, stuck_fut, demand_fut);

        let workers = match workers_res {
            Ok(w) => {
                self.circuit_breakers.store.record_success();
                w
            }
            Err(e) => {
                self.circuit_breakers.store.record_failure();
                tracing::warn!(error = %e, "failed to list workers this cycle");
                Vec::new()
            }
        };

        let stuck_tasks = stuck_res.unwrap_or_default();

        let (demand, degraded) = match demand_res {
            Ok(d) => {
                self.circuit_breakers.demand_oracle.record_success();
                (d, false)
            }
            Err(_) => {
                self.circuit_breakers.demand_oracle.record_failure();
                let fallback = self
                    .store
                    .count_dispatchable_queued(&self.cfg.run_type)
                    .await
                    .unwrap_or(0);
                (fallback, true)
            }
        };

        (workers, stuck_tasks, demand, degraded)
    }

    fn publish_metrics(&self, record: &CycleRecord) {
        metrics::gauge!("podscale.workers.active").set(record.n_active as f64);
        metrics::gauge!("podscale.workers.spawning").set(record.n_spawning as f64);
        metrics::gauge!("podscale.workers.error").set(record.n_error as f64);
        metrics::gauge!("podscale.workers.terminating").set(record.n_terminating as f64);
        metrics::gauge!("podscale.demand").set(record.demand as f64);
        metrics::gauge!("podscale.desired").set(record.desired as f64);
        metrics::counter!("podscale.cycles").increment(1);
        metrics::counter!("podscale.workers_spawned").increment(record.workers_spawned as u64);
        metrics::counter!("podscale.workers_terminated").increment(record.workers_terminated as u64);
        metrics::counter!("podscale.tasks_reset").increment(record.tasks_reset as u64);
        if let Some(rate) = record.failure_rate {
            metrics::gauge!("podscale.failure_rate").set(rate);
        }
        metrics::histogram!("podscale.cycle_duration_ms").record(record.duration_ms as f64);
    }

    async fn push_record(&self, record: CycleRecord) {
        let mut recent = self.recent_cycles.write().await;
        if recent.len() == STATUS_RING_BUFFER_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Runs once at shutdown: any row left `terminating` gets one last
    /// attempt to finish the termination sequence rather than being
    /// abandoned mid-flight.
    async fn final_termination_sweep(&self) {
        tracing::info!("running final termination sweep before shutdown");

        let workers = match self.store.get_workers().await {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, "final sweep: failed to list workers");
                return;
            }
        };

        let terminating: Vec<_> = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Terminating)
            .cloned()
            .collect();

        if terminating.is_empty() {
            return;
        }

        let actuator = Actuator::new(
            self.store.as_ref(),
            self.provider.as_ref(),
            &self.circuit_breakers,
            &self.cfg,
        );
        let _ = actuator.finish_terminating(&terminating).await;
    }
}
