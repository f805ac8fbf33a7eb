mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use podscale_common::types::{Task, Worker, WorkerMetadata, WorkerStatus};
use podscale_common::WorkerId;

/// Capability over the datastore holding worker and task rows. The
/// orchestrator never owns task scheduling — it only reads task state to
/// derive signals, and resets orphaned tasks back to `Queued`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_worker(&self, worker: &Worker) -> Result<(), StoreError>;

    async fn update_worker_status(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
        metadata_patch: WorkerMetadata,
    ) -> Result<(), StoreError>;

    async fn get_workers(&self) -> Result<Vec<Worker>, StoreError>;

    async fn count_workers(&self, status: WorkerStatus) -> Result<u32, StoreError>;

    async fn get_stale_workers(
        &self,
        heartbeat_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Worker>, StoreError>;

    async fn get_spawning_past_timeout(
        &self,
        created_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Worker>, StoreError>;

    async fn get_stuck_tasks(
        &self,
        started_cutoff: DateTime<Utc>,
        exclude_task_type_markers: &[String],
    ) -> Result<Vec<Task>, StoreError>;

    async fn has_running_tasks(&self, id: &WorkerId) -> Result<bool, StoreError>;

    async fn has_processed_tasks(&self, id: &WorkerId) -> Result<bool, StoreError>;

    async fn count_dispatchable_queued(&self, run_type: &str) -> Result<u32, StoreError>;

    /// Atomically moves every `Running` task owned by one of `failed_worker_ids`
    /// back to `Queued`, clearing `worker_id` and `generation_started_at`.
    /// Must be one transaction; partial completion is forbidden.
    async fn reset_orphaned_tasks(&self, failed_worker_ids: &[WorkerId])
        -> Result<u32, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store query error: {0}")]
    Query(String),

    #[error("store migration error: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for podscale_common::PodscaleError {
    fn from(e: StoreError) -> Self {
        podscale_common::PodscaleError::Store(e.to_string())
    }
}
