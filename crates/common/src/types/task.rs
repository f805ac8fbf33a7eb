use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{TaskId, WorkerId};

/// Task lifecycle status, as owned by the task store. The orchestrator only
/// reads and resets tasks; it never drives a task to a terminal status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A task row, reduced to the fields the orchestrator needs to observe and
/// reset orphaned work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub worker_id: Option<WorkerId>,
    pub task_type: String,
    pub run_type: String,
    pub user_id: String,
    pub generation_started_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether this task's `task_type` matches one of the configured
    /// orchestrator-task marker substrings (these may legitimately run long
    /// and are excluded from stuck-task detection).
    pub fn is_orchestrator_task(&self, markers: &[String]) -> bool {
        markers.iter().any(|m| self.task_type.contains(m.as_str()))
    }
}
