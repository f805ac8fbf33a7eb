mod http;
mod memory;

pub use http::HttpProviderClient;
pub use memory::InMemoryProviderClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Specification for a new pod, passed to [`ProviderClient::create_pod`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PodSpec {
    pub instance_type: String,
}

/// A provider-reported pod observation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PodInfo {
    pub pod_id: String,
    pub desired_status: String,
    pub actual_status: String,
    pub uptime_s: u64,
    #[serde(default)]
    pub cost_per_hr: Option<f64>,
}

/// Capability over the cloud GPU provider's pod lifecycle API. Every call
/// may fail transiently; the production implementation classifies and
/// retries such failures internally, so callers only see the final
/// transient/permanent/fatal outcome.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn create_pod(&self, spec: &PodSpec) -> Result<String, ProviderError>;

    async fn list_pods(&self) -> Result<Vec<PodInfo>, ProviderError>;

    async fn get_pod(&self, pod_id: &str) -> Result<Option<PodInfo>, ProviderError>;

    /// Idempotent: terminating an already-gone pod is success, not error.
    async fn terminate_pod(&self, pod_id: &str) -> Result<(), ProviderError>;
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum ProviderError {
    #[error("provider network/transient error: {0}")]
    Transient(String),

    #[error("provider rejected request: {0}")]
    Permanent(String),

    #[error("provider authentication failed: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_non_retryable(&self) -> bool {
        matches!(self, Self::Permanent(_) | Self::Fatal(_))
    }
}

impl From<ProviderError> for podscale_common::PodscaleError {
    fn from(e: ProviderError) -> Self {
        podscale_common::PodscaleError::Provider(e.to_string())
    }
}
