use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-cycle diagnostic snapshot: what the reconciler observed, decided, and
/// the actuator actually did. Logged as one structured JSON event per cycle
/// and retained in the in-memory ring buffer backing `/status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,

    pub n_active: u32,
    pub n_spawning: u32,
    pub n_error: u32,
    pub n_terminating: u32,

    pub demand: u32,
    pub busy: u32,
    pub desired: u32,
    pub delta: i32,

    pub scale_up_blocked: Option<String>,
    pub workers_spawned: u32,
    pub workers_terminated: u32,
    pub tasks_reset: u32,

    pub failure_rate: Option<f64>,
    pub degraded_demand_source: bool,

    pub duration_ms: u64,
}
