//! HTTP client for the runner job protocol

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::Deserialize;

use super::types::{CompleteRequest, PollRequest, PollResponse, TelemetryRequest};
use super::{ControlPlane, ExecutionContext, Job, ProtocolError};
use crate::executor::RunOutcome;

/// Longest pause between completion retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Connection settings for the control plane
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://app.example.com`
    pub url: String,
    /// Runner credential sent as `Authorization: Bearer`
    pub token: String,
    /// Job group this runner serves
    pub group: String,
    /// Server-side long-poll wait
    pub poll_wait_secs: u64,
    /// Timeout for every call except poll
    pub request_timeout_secs: u64,
    /// Attempts for the completion report
    pub complete_attempts: u32,
    /// First retry delay, doubled per attempt
    pub retry_base_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            group: "default".to_string(),
            poll_wait_secs: 30,
            request_timeout_secs: 30,
            complete_attempts: 6,
            retry_base_ms: 500,
        }
    }
}

impl ApiConfig {
    /// Client-side bound on a poll: server wait plus slack
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs + 10)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
    }
}

/// Control plane client over HTTPS
#[derive(Clone)]
pub struct ApiClient {
    config: ApiConfig,
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `config` - base URL, runner token, group and timeouts
    pub fn new(config: ApiConfig) -> Result<Self, ProtocolError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sandbox-runner/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let base_url = config.url.trim_end_matches('/').to_string();
        Ok(Self {
            config,
            base_url,
            client,
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, endpoint: &str, timeout: Duration) -> reqwest::RequestBuilder {
        self.client
            .post(endpoint)
            .bearer_auth(&self.config.token)
            .timeout(timeout)
    }

    async fn send_complete(&self, run_id: &str, outcome: &RunOutcome) -> Result<(), ProtocolError> {
        let endpoint = self.endpoint("/api/webhooks/agent/complete");
        let response = self
            .post(&endpoint, self.config.request_timeout())
            .json(&CompleteRequest {
                run_id,
                exit_code: outcome.exit_code,
                error: outcome.error.as_deref(),
            })
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            // Already terminal: a previous attempt landed
            StatusCode::CONFLICT => {
                tracing::debug!(run_id, "completion already recorded");
                Ok(())
            }
            _ => Err(status_error(&endpoint, run_id, response).await),
        }
    }
}

/// Map a non-success response to the protocol taxonomy
async fn status_error(endpoint: &str, run_id: &str, response: Response) -> ProtocolError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::CONFLICT => ProtocolError::Conflict(run_id.to_string()),
        StatusCode::NOT_FOUND => ProtocolError::NotFound(run_id.to_string()),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => ProtocolError::Forbidden(body),
        _ => ProtocolError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        },
    }
}

#[async_trait::async_trait]
impl ControlPlane for ApiClient {
    async fn poll(&self, group: &str) -> Result<Option<Job>, ProtocolError> {
        let endpoint = self.endpoint("/api/runners/poll");
        let response = self
            .post(&endpoint, self.config.poll_timeout())
            .json(&PollRequest { group })
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let body: PollResponse = response
                    .json()
                    .await
                    .map_err(|e| ProtocolError::Decode(e.to_string()))?;
                Ok(body.job)
            }
            _ => Err(status_error(&endpoint, "", response).await),
        }
    }

    async fn claim(&self, run_id: &str) -> Result<ExecutionContext, ProtocolError> {
        let endpoint = self.endpoint(&format!("/api/runners/jobs/{}/claim", run_id));
        let response = self
            .post(&endpoint, self.config.request_timeout())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(&endpoint, run_id, response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Retries transport errors and 5xx with exponential backoff
    async fn complete(&self, run_id: &str, outcome: &RunOutcome) -> Result<(), ProtocolError> {
        let attempts = self.config.complete_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send_complete(run_id, outcome).await {
                Ok(()) => {
                    tracing::info!(run_id, exit_code = outcome.exit_code, attempt, "run completion reported");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.config.retry_delay(attempt);
                    tracing::warn!(run_id, attempt, error = %e, ?delay, "completion report failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upload_network_logs(
        &self,
        run_id: &str,
        entries: &[serde_json::Value],
    ) -> Result<(), ProtocolError> {
        if entries.is_empty() {
            return Ok(());
        }
        let endpoint = self.endpoint("/api/webhooks/agent/telemetry");
        let response = self
            .post(&endpoint, self.config.request_timeout())
            .json(&TelemetryRequest {
                run_id,
                network_logs: entries,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(&endpoint, run_id, response).await);
        }
        tracing::debug!(run_id, entries = entries.len(), "network logs uploaded");
        Ok(())
    }
}
