use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use podscale_common::config::RetryConfig;

use super::{PodInfo, PodSpec, ProviderClient, ProviderError};

/// HTTP client against a RunPod-shaped REST API for pod lifecycle
/// management. Retries transient failures with exponential backoff and
/// hash-based jitter, mirroring the retry shape used for other outbound
/// dependency calls in this codebase.
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl HttpProviderClient {
    pub fn new(base_url: String, api_key: String, retry: RetryConfig, call_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            retry,
            call_timeout,
        }
    }

    async fn execute<T, F, Fut>(&self, op_name: &str, attempt_salt: u64, f: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut backoff_ms = self.retry.initial_backoff_ms;

        for attempt in 1..=self.retry.max_attempts {
            let result = tokio::time::timeout(self.call_timeout, f())
                .await
                .map_err(|_| ProviderError::Transient(format!("{op_name} timed out")))
                .and_then(|r| r);

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_non_retryable() => return Err(e),
                Err(e) if attempt == self.retry.max_attempts => return Err(e),
                Err(e) => {
                    let jitter = compute_jitter(attempt_salt.wrapping_add(attempt as u64), backoff_ms);
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        backoff_ms = jitter,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                    backoff_ms = ((backoff_ms as f64) * self.retry.backoff_multiplier) as u64;
                    backoff_ms = backoff_ms.min(self.retry.max_backoff_ms);
                }
            }
        }

        unreachable!("loop always returns by the final attempt")
    }
}

/// Deterministic, allocation-free jitter derived from the attempt counter —
/// avoids pulling in a `rand` dependency for a simple +/-25% spread.
fn compute_jitter(salt: u64, base_ms: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    salt.hash(&mut hasher);
    let h = hasher.finish();
    let spread = (base_ms / 4).max(1);
    let offset = (h % (spread * 2)) as i64 - spread as i64;
    (base_ms as i64 + offset).max(0) as u64
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn create_pod(&self, spec: &PodSpec) -> Result<String, ProviderError> {
        let url = format!("{}/pods", self.base_url);
        let salt = spec.instance_type.len() as u64;

        self.execute("create_pod", salt, || async {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(spec)
                .send()
                .await
                .map_err(|e| ProviderError::Transient(e.to_string()))?;

            classify_and_parse::<CreatePodResponse>(resp)
                .await
                .map(|r| r.pod_id)
        })
        .await
    }

    async fn list_pods(&self) -> Result<Vec<PodInfo>, ProviderError> {
        let url = format!("{}/pods", self.base_url);

        self.execute("list_pods", 1, || async {
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| ProviderError::Transient(e.to_string()))?;

            classify_and_parse::<Vec<PodInfo>>(resp).await
        })
        .await
    }

    async fn get_pod(&self, pod_id: &str) -> Result<Option<PodInfo>, ProviderError> {
        let url = format!("{}/pods/{}", self.base_url, pod_id);
        let salt = pod_id.len() as u64;

        self.execute("get_pod", salt, || async {
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| ProviderError::Transient(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }

            classify_and_parse::<PodInfo>(resp).await.map(Some)
        })
        .await
    }

    async fn terminate_pod(&self, pod_id: &str) -> Result<(), ProviderError> {
        let url = format!("{}/pods/{}", self.base_url, pod_id);
        let salt = pod_id.len() as u64;

        self.execute("terminate_pod", salt, || async {
            let resp = self
                .http
                .delete(&url)
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| ProviderError::Transient(e.to_string()))?;

            // A pod the provider no longer knows about is a successful
            // termination from the orchestrator's point of view.
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(());
            }

            let status = resp.status();
            if status.is_success() {
                Ok(())
            } else if status.is_client_error() {
                Err(ProviderError::Permanent(format!("terminate_pod: {status}")))
            } else {
                Err(ProviderError::Transient(format!("terminate_pod: {status}")))
            }
        })
        .await
    }
}

#[derive(serde::Deserialize)]
struct CreatePodResponse {
    pod_id: String,
}

async fn classify_and_parse<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = resp.status();

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ProviderError::Fatal(format!("authentication failed: {status}")));
    }

    if status.is_client_error() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Permanent(format!("{status}: {body}")));
    }

    if status.is_server_error() {
        return Err(ProviderError::Transient(format!("server error: {status}")));
    }

    resp.json::<T>()
        .await
        .map_err(|e| ProviderError::Transient(format!("failed to parse response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_quarter_spread() {
        for salt in 0..50 {
            let j = compute_jitter(salt, 1000);
            assert!(j <= 1250);
        }
    }
}
