//! Backend for the containerized service on a fixed local address.
//!
//! | Call                 | Meaning                                  |
//! |----------------------|------------------------------------------|
//! | `POST /{route}`      | queue a job, returns `{"job_id": ...}`   |
//! | `GET /job/{id}`      | `{status, progress, error}`              |
//! | `GET /image/{id}`    | raw bytes of the finished image          |
//! | `GET /`              | health                                   |
//!
//! There is no event stream; completion is found by polling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atelier_core::job::JobFailure;
use atelier_core::monitor::{CompletionProbe, ProbeError, ProbeStatus};
use atelier_core::types::{Artifact, BackendKind};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::backend::Backend;
use crate::error::DispatchError;
use crate::request::JobRequest;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct SubmitBody {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobBody {
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteServiceBackend {
    client: reqwest::Client,
    base_url: String,
    probe: Arc<RemoteServiceProbe>,
}

impl RemoteServiceBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::new();
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let probe = Arc::new(RemoteServiceProbe {
            client: client.clone(),
            base_url: base_url.clone(),
        });
        Self {
            client,
            base_url,
            probe,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn is_reachable(&self) -> bool {
        match self
            .client
            .get(format!("{}/", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Backend for RemoteServiceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteService
    }

    async fn submit(&self, request: &JobRequest) -> Result<String, DispatchError> {
        let route = request.route.trim_start_matches('/');
        let response = self
            .client
            .post(format!("{}/{route}", self.base_url))
            .json(&request.payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DispatchError::RemoteService(error_detail(status, &text)));
        }

        let body: SubmitBody = response.json().await?;
        let job_id = body
            .job_id
            .or(body.id)
            .ok_or_else(|| DispatchError::RemoteService("No job ID returned".to_string()))?;

        tracing::info!(remote_job_id = %job_id, route, "Job queued on remote service");
        Ok(job_id)
    }

    fn probe(&self) -> Arc<dyn CompletionProbe> {
        self.probe.clone()
    }

    /// The service exposes no cancel call; the job is only abandoned.
    async fn cancel(&self, handle: &str) -> Result<(), DispatchError> {
        tracing::debug!(remote_job_id = %handle, "Remote service has no cancel endpoint");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RemoteServiceProbe {
    client: reqwest::Client,
    base_url: String,
}

#[async_trait]
impl CompletionProbe for RemoteServiceProbe {
    async fn check(&self, job_id: &str) -> Result<ProbeStatus, ProbeError> {
        let response = self
            .client
            .get(format!("{}/job/{job_id}", self.base_url))
            .send()
            .await
            .map_err(|e| ProbeError(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(ProbeStatus::Failed(JobFailure::not_found(format!(
                "Job not found: {job_id}"
            ))));
        }
        if !response.status().is_success() {
            return Err(ProbeError(format!("status check returned {}", response.status())));
        }

        let body: JobBody = response.json().await.map_err(|e| ProbeError(e.to_string()))?;
        let progress = body.progress.map(|p| p.clamp(0.0, 100.0).round() as u8);

        match body.status.to_ascii_lowercase().as_str() {
            "completed" | "success" => {
                let artifact = self.image(job_id).await?;
                Ok(ProbeStatus::Completed(artifact))
            }
            "failed" | "error" => Ok(ProbeStatus::Failed(JobFailure::backend(
                body.error.unwrap_or_else(|| "Job failed".to_string()),
            ))),
            _ => Ok(ProbeStatus::Pending { progress }),
        }
    }
}

impl RemoteServiceProbe {
    async fn image(&self, job_id: &str) -> Result<Artifact, ProbeError> {
        let response = self
            .client
            .get(format!("{}/image/{job_id}", self.base_url))
            .send()
            .await
            .map_err(|e| ProbeError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProbeError(format!("image fetch returned {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = response.bytes().await.map_err(|e| ProbeError(e.to_string()))?;
        Ok(Artifact::new(format!("{job_id}.png"), bytes.to_vec()).with_content_type(content_type))
    }
}

// ---- private helpers ----

/// The service reports errors as `{"detail": ...}`.
fn error_detail(status: StatusCode, body: &str) -> String {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    match parsed.and_then(|b| b.detail.or(b.error)) {
        Some(detail) => detail,
        None if body.is_empty() => format!("HTTP {}", status.as_u16()),
        None => format!("HTTP {}: {body}", status.as_u16()),
    }
}
