//! HTTP client for the serverless queueing API.

use std::time::Duration;

use atelier_core::config::{token_hint, ServerlessConfig};
use atelier_core::error::{CoreError, ErrorKind};
use atelier_core::types::Artifact;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::output::{content_type_for, normalize, JobOutput};
use crate::status::{EndpointHealth, RemoteStatus, RunResponse, StatusResponse};

/// Bound on the initial `run` request; large inline inputs upload slowly.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(30);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Wait before re-reading a COMPLETED status that arrived without output.
pub const OUTPUT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ServerlessError {
    #[error("Serverless configuration error: {0}")]
    Configuration(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Serverless API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The provider no longer knows the job id.
    #[error("Job not found - it may have expired")]
    NotFound(String),

    #[error("No job ID returned from serverless API")]
    MissingJobId,

    #[error("Job completed but no output was found")]
    NoOutput,

    #[error("Invalid serverless response: {0}")]
    InvalidResponse(String),
}

impl ServerlessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::NotFound(_) => ErrorKind::JobNotFound,
            _ => ErrorKind::JobBackend,
        }
    }
}

impl From<CoreError> for ServerlessError {
    fn from(e: CoreError) -> Self {
        Self::Configuration(e.to_string())
    }
}

/// Terminal or in-flight state of one remote job, with output resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Completed(Artifact),
    /// The provider's error message, verbatim.
    Failed(String),
    Cancelled,
    TimedOut,
}

#[derive(Clone)]
pub struct ServerlessClient {
    client: reqwest::Client,
    base_url: String,
    endpoint_id: String,
    api_key: String,
    output_retry_delay: Duration,
}

impl std::fmt::Debug for ServerlessClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerlessClient")
            .field("base_url", &self.base_url)
            .field("endpoint_id", &self.endpoint_id)
            .field("api_key", &token_hint(&self.api_key))
            .finish()
    }
}

impl ServerlessClient {
    pub fn new(
        base_url: impl Into<String>,
        endpoint_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            endpoint_id: endpoint_id.into(),
            api_key: api_key.into(),
            output_retry_delay: OUTPUT_RETRY_DELAY,
        }
    }

    /// Build from configuration; fails when credentials are missing.
    pub fn from_config(config: &ServerlessConfig) -> Result<Self, ServerlessError> {
        let (api_key, endpoint_id) = config.credentials()?;
        Ok(Self::new(config.base_url.as_str(), endpoint_id, api_key))
    }

    pub fn with_output_retry_delay(mut self, delay: Duration) -> Self {
        self.output_retry_delay = delay;
        self
    }

    pub fn endpoint_url(&self) -> String {
        format!("{}/{}", self.base_url, self.endpoint_id)
    }

    /// Queue a job. `input` becomes the `input` member of the request body.
    pub async fn run(&self, input: Value) -> Result<String, ServerlessError> {
        let response = self
            .client
            .post(format!("{}/run", self.endpoint_url()))
            .bearer_auth(&self.api_key)
            .timeout(RUN_TIMEOUT)
            .json(&json!({ "input": input }))
            .send()
            .await?;
        let body: RunResponse = Self::parse_response(response).await?;
        let id = body.id.filter(|id| !id.is_empty()).ok_or(ServerlessError::MissingJobId)?;

        tracing::info!(endpoint_id = %self.endpoint_id, remote_job_id = %id, "Serverless job queued");
        Ok(id)
    }

    /// Raw status of a job.
    pub async fn status(&self, job_id: &str) -> Result<StatusResponse, ServerlessError> {
        let response = self
            .client
            .get(format!("{}/status/{job_id}", self.endpoint_url()))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ServerlessError::NotFound(job_id.to_string()));
        }
        Self::parse_response(response).await
    }

    /// Status with completed output normalised into an artifact.
    ///
    /// A COMPLETED status without output is re-read once after
    /// [`OUTPUT_RETRY_DELAY`], since output can land slightly after the
    /// state flips.
    pub async fn poll(&self, job_id: &str) -> Result<JobState, ServerlessError> {
        let mut status = self.status(job_id).await?;

        if status.status == RemoteStatus::Completed && !status.has_output() {
            tracing::debug!(remote_job_id = %job_id, "Completed without output, retrying once");
            tokio::time::sleep(self.output_retry_delay).await;
            status = self.status(job_id).await?;
        }

        match status.status {
            RemoteStatus::InQueue | RemoteStatus::InProgress | RemoteStatus::Unknown => {
                Ok(JobState::Pending)
            }
            RemoteStatus::Failed => Ok(JobState::Failed(
                status.error.clone().unwrap_or_else(|| "Job failed".to_string()),
            )),
            RemoteStatus::Cancelled => Ok(JobState::Cancelled),
            RemoteStatus::TimedOut => Ok(JobState::TimedOut),
            RemoteStatus::Completed => match normalize(job_id, &status)? {
                Some(JobOutput::Inline(artifact)) => Ok(JobState::Completed(artifact)),
                Some(JobOutput::Reference { url, filename }) => {
                    Ok(JobState::Completed(self.fetch_reference(&url, filename).await?))
                }
                Some(JobOutput::Error(message)) => Ok(JobState::Failed(message)),
                None => Err(ServerlessError::NoOutput),
            },
        }
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), ServerlessError> {
        let response = self
            .client
            .post(format!("{}/cancel/{job_id}", self.endpoint_url()))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ServerlessError::NotFound(job_id.to_string()));
        }
        Self::ensure_success(response).await?;
        tracing::info!(remote_job_id = %job_id, "Serverless job cancelled");
        Ok(())
    }

    pub async fn health(&self) -> Result<EndpointHealth, ServerlessError> {
        let response = self
            .client
            .get(format!("{}/health", self.endpoint_url()))
            .bearer_auth(&self.api_key)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Download an output the worker uploaded to object storage.
    ///
    /// The URL is pre-signed; the API key is not sent.
    async fn fetch_reference(&self, url: &str, filename: String) -> Result<Artifact, ServerlessError> {
        let response = Self::ensure_success(self.client.get(url).send().await?).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| content_type_for(&filename).to_string());
        let bytes = response.bytes().await?;
        Ok(Artifact::new(filename, bytes.to_vec()).with_content_type(content_type))
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ServerlessError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ServerlessError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ServerlessError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
