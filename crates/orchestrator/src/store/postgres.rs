use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use podscale_common::types::{Task, TaskStatus, Worker, WorkerMetadata, WorkerStatus};
use podscale_common::WorkerId;

use super::{Store, StoreError};

/// PostgreSQL-backed implementation of [`Store`].
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to PostgreSQL and return a client with a connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        tracing::info!("connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let client = Self { pool };
        client.health_check().await?;
        tracing::info!("PostgreSQL connection established");

        Ok(client)
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        tracing::info!("running PostgreSQL migrations");

        sqlx::migrate!("src/store/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::info!("PostgreSQL migrations complete");
        Ok(())
    }

    #[allow(dead_code)]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    instance_type: String,
    status: String,
    created_at: DateTime<Utc>,
    last_heartbeat: Option<DateTime<Utc>>,
    metadata: serde_json::Value,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = StoreError;

    fn try_from(row: WorkerRow) -> Result<Self, StoreError> {
        Ok(Worker {
            id: WorkerId(row.id),
            instance_type: row.instance_type,
            status: parse_worker_status(&row.status),
            created_at: row.created_at,
            last_heartbeat: row.last_heartbeat,
            metadata: serde_json::from_value(row.metadata).unwrap_or_default(),
        })
    }
}

fn parse_worker_status(raw: &str) -> WorkerStatus {
    match raw {
        "spawning" => WorkerStatus::Spawning,
        "active" => WorkerStatus::Active,
        "error" => WorkerStatus::Error,
        "terminating" => WorkerStatus::Terminating,
        "terminated" => WorkerStatus::Terminated,
        other => {
            tracing::warn!(status = other, "unrecognized worker status, defaulting to error");
            WorkerStatus::Error
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: uuid::Uuid,
    status: String,
    worker_id: Option<String>,
    task_type: String,
    run_type: String,
    user_id: String,
    generation_started_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id.into(),
            status: parse_task_status(&row.status),
            worker_id: row.worker_id.map(WorkerId),
            task_type: row.task_type,
            run_type: row.run_type,
            user_id: row.user_id,
            generation_started_at: row.generation_started_at,
        }
    }
}

fn parse_task_status(raw: &str) -> TaskStatus {
    match raw {
        "queued" => TaskStatus::Queued,
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        other => {
            tracing::warn!(status = other, "unrecognized task status, defaulting to failed");
            TaskStatus::Failed
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_worker(&self, worker: &Worker) -> Result<(), StoreError> {
        let metadata = serde_json::to_value(&worker.metadata).map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workers (id, instance_type, status, created_at, last_heartbeat, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&worker.id.0)
        .bind(&worker.instance_type)
        .bind(worker.status.as_db_str())
        .bind(worker.created_at)
        .bind(worker.last_heartbeat)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update_worker_status(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
        metadata_patch: WorkerMetadata,
    ) -> Result<(), StoreError> {
        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(id.0.clone()))?;

        let mut worker: Worker = row.try_into()?;
        worker.metadata.merge(metadata_patch);
        let metadata = serde_json::to_value(&worker.metadata).map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE workers
            SET status = $2, metadata = $3
            WHERE id = $1
            "#,
        )
        .bind(&id.0)
        .bind(status.as_db_str())
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let rows = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn count_workers(&self, status: WorkerStatus) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM workers WHERE status = $1")
            .bind(status.as_db_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let n: i64 = row.try_get("n").map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(n as u32)
    }

    async fn get_stale_workers(
        &self,
        heartbeat_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Worker>, StoreError> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            "SELECT * FROM workers WHERE status = 'active' AND (last_heartbeat IS NULL OR last_heartbeat < $1)",
        )
        .bind(heartbeat_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn get_spawning_past_timeout(
        &self,
        created_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Worker>, StoreError> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            "SELECT * FROM workers WHERE status = 'spawning' AND created_at < $1",
        )
        .bind(created_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn get_stuck_tasks(
        &self,
        started_cutoff: DateTime<Utc>,
        exclude_task_type_markers: &[String],
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE status = 'running' AND generation_started_at < $1",
        )
        .bind(started_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(Task::from)
            .filter(|t| !t.is_orchestrator_task(exclude_task_type_markers))
            .collect())
    }

    async fn has_running_tasks(&self, id: &WorkerId) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE worker_id = $1 AND status = 'running') AS present",
        )
        .bind(&id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        row.try_get("present").map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn has_processed_tasks(&self, id: &WorkerId) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE worker_id = $1 AND status != 'queued') AS present",
        )
        .bind(&id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        row.try_get("present").map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn count_dispatchable_queued(&self, run_type: &str) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM tasks WHERE status = 'queued' AND run_type = $1",
        )
        .bind(run_type)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let n: i64 = row.try_get("n").map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(n as u32)
    }

    async fn reset_orphaned_tasks(
        &self,
        failed_worker_ids: &[WorkerId],
    ) -> Result<u32, StoreError> {
        if failed_worker_ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = failed_worker_ids.iter().map(|w| w.0.clone()).collect();

        let row = sqlx::query("SELECT reset_orphaned_tasks($1) AS n")
            .bind(&ids)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let n: i32 = row.try_get("n").map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(n as u32)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }
}
