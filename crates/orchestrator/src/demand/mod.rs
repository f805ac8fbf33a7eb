mod http;

pub use http::HttpDemandOracle;

use async_trait::async_trait;

/// Capability over the external endpoint reporting how many queued tasks
/// are currently dispatchable (i.e. honouring per-user concurrency caps).
/// Distinct from a raw count of `status = Queued` rows.
#[async_trait]
pub trait DemandOracle: Send + Sync {
    async fn dispatchable_task_count(&self, run_type: &str) -> Result<u32, DemandOracleError>;
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum DemandOracleError {
    #[error("demand oracle not configured")]
    NotConfigured,

    #[error("demand oracle request failed: {0}")]
    Transient(String),
}

impl From<DemandOracleError> for podscale_common::PodscaleError {
    fn from(e: DemandOracleError) -> Self {
        podscale_common::PodscaleError::DemandOracle(e.to_string())
    }
}
