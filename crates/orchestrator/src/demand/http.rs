use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{DemandOracle, DemandOracleError};

/// HTTP GET client against a configured demand-oracle base URL. When
/// unconfigured it always reports [`DemandOracleError::NotConfigured`], which
/// the caller treats as a legitimate, loggable degraded-source condition
/// rather than an error to retry.
pub struct HttpDemandOracle {
    http: reqwest::Client,
    base_url: Option<String>,
    call_timeout: Duration,
}

impl HttpDemandOracle {
    pub fn new(base_url: Option<String>, call_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            call_timeout,
        }
    }
}

#[derive(Deserialize)]
struct DemandResponse {
    dispatchable_count: u32,
}

#[async_trait]
impl DemandOracle for HttpDemandOracle {
    async fn dispatchable_task_count(&self, run_type: &str) -> Result<u32, DemandOracleError> {
        let Some(base_url) = &self.base_url else {
            return Err(DemandOracleError::NotConfigured);
        };

        let url = format!("{base_url}/demand?run_type={run_type}");

        let resp = tokio::time::timeout(self.call_timeout, self.http.get(&url).send())
            .await
            .map_err(|_| DemandOracleError::Transient("request timed out".to_string()))?
            .map_err(|e| DemandOracleError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(DemandOracleError::Transient(format!(
                "unexpected status: {}",
                resp.status()
            )));
        }

        let body: DemandResponse = resp
            .json()
            .await
            .map_err(|e| DemandOracleError::Transient(e.to_string()))?;

        Ok(body.dispatchable_count)
    }
}
