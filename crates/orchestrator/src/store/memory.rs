use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use podscale_common::types::{Task, TaskStatus, Worker, WorkerMetadata, WorkerStatus};
use podscale_common::WorkerId;

use super::{Store, StoreError};

/// In-memory fake store for tests, substitutable wherever a [`Store`] is
/// expected. Task rows are seeded directly by tests via [`InMemoryStore::seed_task`];
/// the orchestrator never creates tasks itself.
#[derive(Default)]
pub struct InMemoryStore {
    workers: Mutex<HashMap<WorkerId, Worker>>,
    tasks: Mutex<HashMap<podscale_common::TaskId, Task>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_worker(&self, worker: Worker) {
        self.workers.lock().await.insert(worker.id.clone(), worker);
    }

    pub async fn seed_task(&self, task: Task) {
        self.tasks.lock().await.insert(task.id, task);
    }

    pub async fn get_worker(&self, id: &WorkerId) -> Option<Worker> {
        self.workers.lock().await.get(id).cloned()
    }

    pub async fn get_task(&self, id: &podscale_common::TaskId) -> Option<Task> {
        self.tasks.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_worker(&self, worker: &Worker) -> Result<(), StoreError> {
        self.workers
            .lock()
            .await
            .insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn update_worker_status(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
        metadata_patch: WorkerMetadata,
    ) -> Result<(), StoreError> {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        worker.status = status;
        worker.metadata.merge(metadata_patch);
        Ok(())
    }

    async fn get_workers(&self) -> Result<Vec<Worker>, StoreError> {
        Ok(self.workers.lock().await.values().cloned().collect())
    }

    async fn count_workers(&self, status: WorkerStatus) -> Result<u32, StoreError> {
        Ok(self
            .workers
            .lock()
            .await
            .values()
            .filter(|w| w.status == status)
            .count() as u32)
    }

    async fn get_stale_workers(
        &self,
        heartbeat_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Worker>, StoreError> {
        Ok(self
            .workers
            .lock()
            .await
            .values()
            .filter(|w| {
                w.status == WorkerStatus::Active
                    && w.last_heartbeat.map(|h| h < heartbeat_cutoff).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn get_spawning_past_timeout(
        &self,
        created_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Worker>, StoreError> {
        Ok(self
            .workers
            .lock()
            .await
            .values()
            .filter(|w| w.status == WorkerStatus::Spawning && w.created_at < created_cutoff)
            .cloned()
            .collect())
    }

    async fn get_stuck_tasks(
        &self,
        started_cutoff: DateTime<Utc>,
        exclude_task_type_markers: &[String],
    ) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.generation_started_at.map(|s| s < started_cutoff).unwrap_or(false)
                    && !t.is_orchestrator_task(exclude_task_type_markers)
            })
            .cloned()
            .collect())
    }

    async fn has_running_tasks(&self, id: &WorkerId) -> Result<bool, StoreError> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .any(|t| t.worker_id.as_ref() == Some(id) && t.status == TaskStatus::Running))
    }

    async fn has_processed_tasks(&self, id: &WorkerId) -> Result<bool, StoreError> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .any(|t| t.worker_id.as_ref() == Some(id) && t.status != TaskStatus::Queued))
    }

    async fn count_dispatchable_queued(&self, run_type: &str) -> Result<u32, StoreError> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Queued && t.run_type == run_type)
            .count() as u32)
    }

    async fn reset_orphaned_tasks(
        &self,
        failed_worker_ids: &[WorkerId],
    ) -> Result<u32, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let mut count = 0;
        for task in tasks.values_mut() {
            if task.status == TaskStatus::Running
                && task
                    .worker_id
                    .as_ref()
                    .map(|w| failed_worker_ids.contains(w))
                    .unwrap_or(false)
            {
                task.status = TaskStatus::Queued;
                task.worker_id = None;
                task.generation_started_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reset_orphaned_tasks_clears_worker_and_timestamp() {
        let store = InMemoryStore::new();
        let worker_id = WorkerId::generate();
        let mut task = Task {
            id: podscale_common::TaskId::new(),
            status: TaskStatus::Running,
            worker_id: Some(worker_id.clone()),
            task_type: "generate".to_string(),
            run_type: "cloud".to_string(),
            user_id: "u1".to_string(),
            generation_started_at: Some(Utc::now()),
        };
        store.seed_task(task.clone()).await;

        let reset = store.reset_orphaned_tasks(&[worker_id]).await.unwrap();
        assert_eq!(reset, 1);

        task = store.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.worker_id.is_none());
        assert!(task.generation_started_at.is_none());
    }

    #[tokio::test]
    async fn reset_orphaned_tasks_is_idempotent() {
        let store = InMemoryStore::new();
        let worker_id = WorkerId::generate();
        let task = Task {
            id: podscale_common::TaskId::new(),
            status: TaskStatus::Running,
            worker_id: Some(worker_id.clone()),
            task_type: "generate".to_string(),
            run_type: "cloud".to_string(),
            user_id: "u1".to_string(),
            generation_started_at: Some(Utc::now()),
        };
        store.seed_task(task).await;

        let first = store.reset_orphaned_tasks(&[worker_id.clone()]).await.unwrap();
        let second = store.reset_orphaned_tasks(&[worker_id]).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
