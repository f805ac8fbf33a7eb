use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::WorkerId;

/// Lifecycle status of a provisioned GPU worker.
///
/// Allowed transitions: `Spawning -> Active`, `Spawning -> Error`,
/// `Active -> Error`, `Error -> Terminating`, `Terminating -> Terminated`.
/// `Terminated` is absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Spawning,
    Active,
    Error,
    Terminating,
    Terminated,
}

impl WorkerStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Active => "active",
            Self::Error => "error",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// Recognized metadata keys are promoted to typed fields; anything else is
/// preserved verbatim via the flattened remainder, mirroring how the store
/// actually persists this column (a single JSON blob).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_pod_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_to_active_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_terminated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl WorkerMetadata {
    /// Shallow-merges `patch` over `self`, preserving any key not present in
    /// `patch`. This is the update semantics the store's read-modify-write
    /// relies on.
    pub fn merge(&mut self, patch: WorkerMetadata) {
        if patch.provider_pod_id.is_some() {
            self.provider_pod_id = patch.provider_pod_id;
        }
        if patch.error_reason.is_some() {
            self.error_reason = patch.error_reason;
        }
        if patch.error_timestamp.is_some() {
            self.error_timestamp = patch.error_timestamp;
        }
        if patch.promoted_to_active_at.is_some() {
            self.promoted_to_active_at = patch.promoted_to_active_at;
        }
        if patch.terminated_at.is_some() {
            self.terminated_at = patch.terminated_at;
        }
        if patch.self_terminated.is_some() {
            self.self_terminated = patch.self_terminated;
        }
        if patch.diagnostics.is_some() {
            self.diagnostics = patch.diagnostics;
        }
        for (k, v) in patch.extra {
            self.extra.insert(k, v);
        }
    }
}

/// One provisioned GPU instance and its control-plane state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub instance_type: String,
    pub status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metadata: WorkerMetadata,
}

impl Worker {
    pub fn new(instance_type: impl Into<String>) -> Self {
        Self {
            id: WorkerId::generate(),
            instance_type: instance_type.into(),
            status: WorkerStatus::Spawning,
            created_at: Utc::now(),
            last_heartbeat: None,
            metadata: WorkerMetadata::default(),
        }
    }

    pub fn is_busy(&self, has_running_task: bool) -> bool {
        self.status == WorkerStatus::Active && has_running_task
    }

    pub fn is_idle(&self, has_running_task: bool) -> bool {
        self.status == WorkerStatus::Active && !has_running_task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_is_terminal_only_state() {
        assert!(WorkerStatus::Terminated.is_terminal());
        assert!(!WorkerStatus::Spawning.is_terminal());
        assert!(!WorkerStatus::Active.is_terminal());
        assert!(!WorkerStatus::Error.is_terminal());
        assert!(!WorkerStatus::Terminating.is_terminal());
    }

    #[test]
    fn metadata_merge_preserves_untouched_keys() {
        let mut base = WorkerMetadata {
            provider_pod_id: Some("pod-1".to_string()),
            ..Default::default()
        };
        let patch = WorkerMetadata {
            error_reason: Some("heartbeat_timeout".to_string()),
            ..Default::default()
        };
        base.merge(patch);
        assert_eq!(base.provider_pod_id.as_deref(), Some("pod-1"));
        assert_eq!(base.error_reason.as_deref(), Some("heartbeat_timeout"));
    }
}
