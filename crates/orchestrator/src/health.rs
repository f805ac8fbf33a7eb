use chrono::{DateTime, Utc};

use podscale_common::config::Config;
use podscale_common::types::{Task, Worker, WorkerStatus};
use podscale_common::WorkerId;

/// Derived failure signals for one cycle. Pure data, computed from already
/// fetched store rows — no I/O of its own.
#[derive(Clone, Debug, Default)]
pub struct HealthSignals {
    pub stale_workers: Vec<Worker>,
    pub stuck_tasks: Vec<Task>,
    pub spawning_timeouts: Vec<Worker>,
    pub failure_rate: Option<f64>,
}

/// Computes [`HealthSignals`] from a snapshot of worker rows, a snapshot of
/// stuck tasks (already filtered by the store), and the worker history used
/// for the recent-window failure rate.
pub fn assess(
    now: DateTime<Utc>,
    workers: &[Worker],
    stuck_tasks: Vec<Task>,
    cfg: &Config,
) -> HealthSignals {
    let heartbeat_cutoff = now - chrono::Duration::from_std(cfg.heartbeat_timeout()).unwrap();
    let spawn_cutoff = now - chrono::Duration::from_std(cfg.spawn_timeout()).unwrap();
    let failure_window_start = now - chrono::Duration::from_std(cfg.failure_window()).unwrap();

    let stale_workers: Vec<Worker> = workers
        .iter()
        .filter(|w| {
            w.status == WorkerStatus::Active
                && w.last_heartbeat.map(|h| h < heartbeat_cutoff).unwrap_or(true)
        })
        .cloned()
        .collect();

    let spawning_timeouts: Vec<Worker> = workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Spawning && w.created_at < spawn_cutoff)
        .cloned()
        .collect();

    let recent: Vec<&Worker> = workers
        .iter()
        .filter(|w| w.created_at >= failure_window_start)
        .collect();

    let failure_rate = if recent.len() as u32 >= cfg.min_samples_for_rate {
        let failures = recent
            .iter()
            .filter(|w| {
                matches!(w.status, WorkerStatus::Error | WorkerStatus::Terminated)
                    && (w.metadata.error_reason.as_deref().map(|r| {
                        r.contains("heartbeat") || r.contains("stuck")
                    }).unwrap_or(false))
            })
            .count();
        Some(failures as f64 / recent.len() as f64)
    } else {
        None
    };

    HealthSignals {
        stale_workers,
        stuck_tasks,
        spawning_timeouts,
        failure_rate,
    }
}

/// Worker ids considered "failed" this cycle, for the actuator's orphaned
/// task reset and forced-error transitions.
pub fn failed_worker_ids(signals: &HealthSignals) -> Vec<WorkerId> {
    let mut ids: Vec<WorkerId> = signals.stale_workers.iter().map(|w| w.id.clone()).collect();
    for w in &signals.spawning_timeouts {
        if !ids.contains(&w.id) {
            ids.push(w.id.clone());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use podscale_common::types::WorkerMetadata;

    fn worker(status: WorkerStatus, created_at: DateTime<Utc>, last_heartbeat: Option<DateTime<Utc>>) -> Worker {
        Worker {
            id: WorkerId::generate(),
            instance_type: "a100".to_string(),
            status,
            created_at,
            last_heartbeat,
            metadata: WorkerMetadata::default(),
        }
    }

    #[test]
    fn detects_stale_active_worker() {
        let now = Utc::now();
        let cfg = Config::from_env();
        let stale = worker(WorkerStatus::Active, now, Some(now - chrono::Duration::seconds(9999)));
        let signals = assess(now, &[stale], vec![], &cfg);
        assert_eq!(signals.stale_workers.len(), 1);
    }

    #[test]
    fn detects_spawning_past_timeout() {
        let now = Utc::now();
        let cfg = Config::from_env();
        let w = worker(WorkerStatus::Spawning, now - chrono::Duration::seconds(9999), None);
        let signals = assess(now, &[w], vec![], &cfg);
        assert_eq!(signals.spawning_timeouts.len(), 1);
    }

    #[test]
    fn failure_rate_undefined_below_min_samples() {
        let now = Utc::now();
        let cfg = Config::from_env();
        let w = worker(WorkerStatus::Active, now, Some(now));
        let signals = assess(now, &[w], vec![], &cfg);
        assert!(signals.failure_rate.is_none());
    }
}
