//! Job-monitor adapter: polls the status endpoint.

use async_trait::async_trait;
use atelier_core::job::JobFailure;
use atelier_core::monitor::{CompletionProbe, ProbeError, ProbeStatus};

use crate::client::{JobState, ServerlessClient, ServerlessError};

#[derive(Debug, Clone)]
pub struct ServerlessProbe {
    client: ServerlessClient,
}

impl ServerlessProbe {
    pub fn new(client: ServerlessClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CompletionProbe for ServerlessProbe {
    async fn check(&self, remote_job_id: &str) -> Result<ProbeStatus, ProbeError> {
        match self.client.poll(remote_job_id).await {
            Ok(JobState::Pending) => Ok(ProbeStatus::Pending { progress: None }),
            Ok(JobState::Completed(artifact)) => Ok(ProbeStatus::Completed(artifact)),
            Ok(JobState::Failed(message)) => Ok(ProbeStatus::Failed(JobFailure::backend(message))),
            Ok(JobState::Cancelled) => Ok(ProbeStatus::Failed(JobFailure::cancelled())),
            Ok(JobState::TimedOut) => Ok(ProbeStatus::Failed(JobFailure::timeout(
                "Job timed out on the serverless endpoint",
            ))),
            Err(e @ ServerlessError::NotFound(_)) => {
                Ok(ProbeStatus::Failed(JobFailure::not_found(e.to_string())))
            }
            // The job finished but what it returned is unusable; polling
            // again will not change that.
            Err(e @ (ServerlessError::NoOutput | ServerlessError::InvalidResponse(_))) => {
                Ok(ProbeStatus::Failed(JobFailure::backend(e.to_string())))
            }
            Err(e) => Err(ProbeError(e.to_string())),
        }
    }
}
