use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{PodInfo, PodSpec, ProviderClient, ProviderError};

/// In-memory fake provider for tests. Every created pod is tracked until
/// terminated; `fail_create`/`fail_terminate` let a test force a specific
/// failure mode.
#[derive(Default)]
pub struct InMemoryProviderClient {
    pods: Mutex<HashMap<String, PodInfo>>,
    pub fail_create: std::sync::atomic::AtomicBool,
    pub fail_terminate: std::sync::atomic::AtomicBool,
}

impl InMemoryProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pod_count(&self) -> usize {
        self.pods.lock().await.len()
    }
}

#[async_trait]
impl ProviderClient for InMemoryProviderClient {
    async fn create_pod(&self, spec: &PodSpec) -> Result<String, ProviderError> {
        if self.fail_create.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(ProviderError::Transient("forced failure".to_string()));
        }

        let pod_id = format!("pod-{}", Uuid::new_v4().simple());
        self.pods.lock().await.insert(
            pod_id.clone(),
            PodInfo {
                pod_id: pod_id.clone(),
                desired_status: "running".to_string(),
                actual_status: "running".to_string(),
                uptime_s: 0,
                cost_per_hr: Some(0.5),
            },
        );
        let _ = &spec.instance_type;
        Ok(pod_id)
    }

    async fn list_pods(&self) -> Result<Vec<PodInfo>, ProviderError> {
        Ok(self.pods.lock().await.values().cloned().collect())
    }

    async fn get_pod(&self, pod_id: &str) -> Result<Option<PodInfo>, ProviderError> {
        Ok(self.pods.lock().await.get(pod_id).cloned())
    }

    async fn terminate_pod(&self, pod_id: &str) -> Result<(), ProviderError> {
        if self.fail_terminate.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(ProviderError::Transient("forced failure".to_string()));
        }
        self.pods.lock().await.remove(pod_id);
        Ok(())
    }
}
