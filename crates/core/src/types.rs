use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Dispatcher-assigned job identifier (UUID v4, string form).
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Which kind of backend executes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// The locally supervised engine process.
    LocalProcess,
    /// A containerized service on a fixed local address.
    RemoteService,
    /// A remote pay-per-use queueing API.
    Serverless,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalProcess => "local_process",
            Self::RemoteService => "remote_service",
            Self::Serverless => "serverless",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finished output produced by a backend.
///
/// The payload is reference-counted so the job store can hand out
/// copies to any number of readers without cloning the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Arc<[u8]>,
}

impl Artifact {
    pub fn new(filename: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
