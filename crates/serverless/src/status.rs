//! Wire types for the queueing API's status endpoint.

use serde::Deserialize;
use serde_json::Value;

/// Lifecycle state reported by `GET /{endpoint}/status/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteStatus {
    InQueue,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    /// Anything newer than this client; treated as still running.
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// Body of a status response. Only the fields this crate reads.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub status: RemoteStatus,
    #[serde(default)]
    pub output: Option<Value>,
    /// Some worker images report under `outputs` or `result` instead.
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub transcription: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "delayTime", default)]
    pub delay_time: Option<u64>,
    #[serde(rename = "executionTime", default)]
    pub execution_time: Option<u64>,
}

impl StatusResponse {
    /// The first non-null output location.
    pub fn output(&self) -> Option<&Value> {
        [&self.output, &self.outputs, &self.result]
            .into_iter()
            .flatten()
            .find(|v| !v.is_null())
    }

    pub fn has_output(&self) -> bool {
        self.output().is_some() || self.transcription.is_some() || self.text.is_some()
    }
}

/// Body of `POST /{endpoint}/run`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<RemoteStatus>,
}

/// Body of `GET /{endpoint}/health`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EndpointHealth {
    #[serde(default)]
    pub jobs: JobCounts,
    #[serde(default)]
    pub workers: WorkerCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobCounts {
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(rename = "inProgress", default)]
    pub in_progress: u64,
    #[serde(rename = "inQueue", default)]
    pub in_queue: u64,
    #[serde(default)]
    pub retried: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WorkerCounts {
    #[serde(default)]
    pub idle: u64,
    #[serde(default)]
    pub running: u64,
}
