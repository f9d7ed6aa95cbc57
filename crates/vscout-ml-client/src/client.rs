//! Analysis service HTTP client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::error::{MlError, MlResult};
use crate::types::{
    AnalysisRequest, AnalysisResponse, HealthResponse, SubmitResponse, TaskState, TaskStatusResponse,
};

/// Wall time of one analysis task, submission to settled poll.
pub const TASK_DURATION_SECONDS: &str = "vscout_ml_task_duration_seconds";

/// Analyses one chunk artifact.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> MlResult<AnalysisResponse>;
}

/// Configuration for the analysis client.
#[derive(Debug, Clone)]
pub struct AnalysisClientConfig {
    /// Base URL of the analysis service
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retries for transient submission/poll failures
    pub max_retries: u32,
    /// Delay between task polls
    pub poll_interval: Duration,
    /// Polls before giving up on a task
    pub max_polls: u32,
}

impl Default for AnalysisClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            timeout: Duration::from_secs(60),
            max_retries: 2,
            poll_interval: Duration::from_secs(5),
            max_polls: 360,
        }
    }
}

impl AnalysisClientConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("ANALYSIS_SERVICE_URL").unwrap_or(defaults.base_url),
            timeout: std::env::var("ANALYSIS_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_retries: std::env::var("ANALYSIS_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            poll_interval: std::env::var("ANALYSIS_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            max_polls: std::env::var("ANALYSIS_MAX_POLLS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_polls),
        }
    }
}

/// HTTP client: submit, then poll until the task settles.
pub struct HttpAnalysisClient {
    http: Client,
    config: AnalysisClientConfig,
}

impl HttpAnalysisClient {
    /// Create a new analysis client.
    pub fn new(config: AnalysisClientConfig) -> MlResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(MlError::Network)?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> MlResult<Self> {
        Self::new(AnalysisClientConfig::from_env())
    }

    /// Check if the analysis service is healthy.
    pub async fn health_check(&self) -> MlResult<bool> {
        let url = format!("{}/health", self.config.base_url);

        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.json::<HealthResponse>().await {
                Ok(health) => Ok(health.status == "healthy" || health.status == "ok"),
                Err(e) => {
                    warn!("Analysis service health body unreadable: {}", e);
                    Ok(false)
                }
            },
            Ok(response) => {
                warn!("Analysis service health check failed: {}", response.status());
                Ok(false)
            }
            Err(e) => {
                warn!("Analysis service health check error: {}", e);
                Ok(false)
            }
        }
    }

    async fn submit(&self, request: &AnalysisRequest) -> MlResult<String> {
        let url = format!("{}/analyze", self.config.base_url);
        debug!(sequence = request.chunk_sequence, "Submitting chunk analysis to {}", url);

        let body = self
            .with_retry(|| async {
                let response = self.http.post(&url).json(request).send().await?;
                read_success_body(response).await
            })
            .await?;

        let submitted: SubmitResponse = serde_json::from_str(&body)
            .map_err(|e| MlError::InvalidResponse(format!("submission body: {}", e)))?;
        Ok(submitted.task_id)
    }

    async fn poll(&self, task_id: &str) -> MlResult<(TaskStatusResponse, String)> {
        let url = format!("{}/analyze/{}", self.config.base_url, task_id);

        let body = self
            .with_retry(|| async {
                let response = self.http.get(&url).send().await?;
                read_success_body(response).await
            })
            .await?;

        let status: TaskStatusResponse = serde_json::from_str(&body)
            .map_err(|e| MlError::InvalidResponse(format!("task {} body: {}", task_id, e)))?;
        Ok((status, body))
    }

    /// Execute with retry logic.
    async fn with_retry<F, Fut, T>(&self, operation: F) -> MlResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = MlResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(
                        "Analysis request failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl AnalysisClient for HttpAnalysisClient {
    async fn analyze(&self, request: &AnalysisRequest) -> MlResult<AnalysisResponse> {
        let started = Instant::now();
        let task_id = self.submit(request).await?;

        for poll in 0..self.config.max_polls {
            let (status, body) = self.poll(&task_id).await?;
            match status.status {
                TaskState::Succeeded => {
                    let elapsed = started.elapsed();
                    metrics::histogram!(TASK_DURATION_SECONDS).record(elapsed.as_secs_f64());
                    info!(
                        task_id = %task_id,
                        sequence = request.chunk_sequence,
                        events = status.events.len(),
                        polls = poll + 1,
                        "Chunk analysis succeeded in {:.1}s",
                        elapsed.as_secs_f64()
                    );
                    return Ok(AnalysisResponse {
                        events: status.events,
                        continuation_token: status.continuation_token,
                        raw_response: body,
                    });
                }
                TaskState::Failed => {
                    let reason = status.error.unwrap_or_else(|| "no error message".to_string());
                    return Err(MlError::Rejected(reason));
                }
                TaskState::Pending | TaskState::Running => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        Err(MlError::Timeout(started.elapsed().as_secs()))
    }
}

async fn read_success_body(response: reqwest::Response) -> MlResult<String> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(MlError::from_status(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> AnalysisClientConfig {
        AnalysisClientConfig {
            base_url,
            timeout: Duration::from_secs(5),
            max_retries: 2,
            poll_interval: Duration::from_millis(10),
            max_polls: 5,
        }
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            artifact_path: "/tmp/vscout/job_1/chunk_00000.mp4".to_string(),
            chunk_sequence: 0,
            known_entities: Vec::new(),
            continuation_token: None,
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = AnalysisClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:8001");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_health_check_reads_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
            .mount(&server)
            .await;

        let client = HttpAnalysisClient::new(test_config(server.uri())).unwrap();
        assert!(client.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_health_body_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let client = HttpAnalysisClient::new(test_config(server.uri())).unwrap();
        assert!(!client.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_analyze_polls_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"task_id": "t-1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/analyze/t-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "running"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/analyze/t-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "succeeded",
                "events": [{"event_type": "goal", "timestamp": "01:10", "team_side": "home"}],
                "continuation_token": "ctx-1"
            })))
            .mount(&server)
            .await;

        let client = HttpAnalysisClient::new(test_config(server.uri())).unwrap();
        let response = client.analyze(&request()).await.unwrap();
        assert_eq!(response.events.len(), 1);
        assert_eq!(response.events[0].event_type, "goal");
        assert_eq!(response.continuation_token.as_deref(), Some("ctx-1"));
        assert!(response.raw_response.contains("succeeded"));
    }

    #[tokio::test]
    async fn test_failed_task_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"task_id": "t-2"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/analyze/t-2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "failed", "error": "unreadable video"})),
            )
            .mount(&server)
            .await;

        let client = HttpAnalysisClient::new(test_config(server.uri())).unwrap();
        let err = client.analyze(&request()).await.unwrap_err();
        assert!(matches!(err, MlError::Rejected(ref msg) if msg == "unreadable video"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_transient_submission_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"task_id": "t-3"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/analyze/t-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "succeeded"})))
            .mount(&server)
            .await;

        let client = HttpAnalysisClient::new(test_config(server.uri())).unwrap();
        let response = client.analyze(&request()).await.unwrap();
        assert!(response.events.is_empty());
    }

    #[tokio::test]
    async fn test_poll_budget_exhaustion_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"task_id": "t-4"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/analyze/t-4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "pending"})))
            .mount(&server)
            .await;

        let client = HttpAnalysisClient::new(test_config(server.uri())).unwrap();
        let err = client.analyze(&request()).await.unwrap_err();
        assert!(matches!(err, MlError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_submission_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = HttpAnalysisClient::new(test_config(server.uri())).unwrap();
        let err = client.analyze(&request()).await.unwrap_err();
        assert!(matches!(err, MlError::InvalidResponse(_)));
    }
}
