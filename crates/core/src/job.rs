//! Write-once job store.
//!
//! Each job moves `Queued -> Processing -> {Completed | Failed | TimedOut}`.
//! The terminal transition happens at most once: the first resolution
//! wins and every later attempt is ignored (and reported as such to the
//! caller). Waiters blocked in [`JobStore::wait_terminal`] are woken on
//! that transition.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};

use crate::error::ErrorKind;
use crate::types::{Artifact, BackendKind, JobId, Timestamp};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The backend reported a failure.
    Backend,
    /// The backend no longer knows the correlation handle.
    NotFound,
    /// No terminal state before the deadline.
    Timeout,
    /// Monitoring was cancelled by the caller or by shutdown.
    Cancelled,
}

/// Structured failure stored as a job's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn backend(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Backend,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NotFound,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "Job cancelled".to_string(),
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self.kind {
            FailureKind::Backend | FailureKind::Cancelled => ErrorKind::JobBackend,
            FailureKind::NotFound => ErrorKind::JobNotFound,
            FailureKind::Timeout => ErrorKind::JobTimeout,
        }
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Artifact(Artifact),
    Failure(JobFailure),
}

impl JobResult {
    fn status(&self) -> JobStatus {
        match self {
            Self::Artifact(_) => JobStatus::Completed,
            Self::Failure(f) if f.kind == FailureKind::Timeout => JobStatus::TimedOut,
            Self::Failure(_) => JobStatus::Failed,
        }
    }
}

/// Everything the store knows about one job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub backend: BackendKind,
    /// Backend correlation handle (prompt id / remote job id).
    pub handle: Option<String>,
    pub submitted_at: Timestamp,
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub result: Option<JobResult>,
    pub resolved_at: Option<Timestamp>,
}

impl JobRecord {
    pub fn new(id: impl Into<JobId>, backend: BackendKind) -> Self {
        Self {
            id: id.into(),
            backend,
            handle: None,
            submitted_at: chrono::Utc::now(),
            status: JobStatus::Queued,
            progress: None,
            result: None,
            resolved_at: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }
}

struct Entry {
    record: JobRecord,
    resolved: Arc<Notify>,
}

/// Concurrent map of job records.
///
/// Shared via `Arc<JobStore>` between the dispatcher and the monitors it
/// spawns.
#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Entry>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. An existing record under the same id is replaced.
    pub async fn insert(&self, record: JobRecord) {
        let entry = Entry {
            record,
            resolved: Arc::new(Notify::new()),
        };
        self.jobs.write().await.insert(entry.record.id.clone(), entry);
    }

    pub async fn get(&self, id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(id).map(|e| e.record.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.jobs.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Record progress on a non-terminal job.
    ///
    /// Moves `Queued` to `Processing`. A `None` percent keeps the last
    /// known value. Returns `false` if the job is unknown or terminal.
    pub async fn mark_processing(&self, id: &str, progress: Option<u8>) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(id) else {
            return false;
        };
        if entry.record.status.is_terminal() {
            return false;
        }
        entry.record.status = JobStatus::Processing;
        if let Some(pct) = progress {
            entry.record.progress = Some(pct.min(100));
        }
        true
    }

    /// Commit the terminal result.
    ///
    /// Returns `true` if this call performed the transition, `false` if
    /// the job was already terminal or is unknown.
    pub async fn resolve(&self, id: &str, result: JobResult) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(id) else {
            return false;
        };
        if entry.record.status.is_terminal() {
            tracing::debug!(job_id = %id, "Ignoring second resolution of terminal job");
            return false;
        }
        entry.record.status = result.status();
        if matches!(result, JobResult::Artifact(_)) {
            entry.record.progress = Some(100);
        }
        entry.record.result = Some(result);
        entry.record.resolved_at = Some(chrono::Utc::now());
        entry.resolved.notify_waiters();
        true
    }

    /// Wait until the job reaches a terminal state.
    ///
    /// Returns `None` if the job is unknown (or removed while waiting).
    pub async fn wait_terminal(&self, id: &str) -> Option<JobRecord> {
        loop {
            let notify = {
                let jobs = self.jobs.read().await;
                let entry = jobs.get(id)?;
                if entry.record.status.is_terminal() {
                    return Some(entry.record.clone());
                }
                entry.resolved.clone()
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check after registering so a resolution between the read
            // above and `enable` is not missed.
            match self.get(id).await {
                Some(record) if record.status.is_terminal() => return Some(record),
                Some(_) => {}
                None => return None,
            }
            notified.await;
        }
    }

    pub async fn remove(&self, id: &str) -> Option<JobRecord> {
        self.jobs.write().await.remove(id).map(|e| e.record)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn artifact() -> Artifact {
        Artifact::new("out.png", vec![1u8, 2, 3])
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let store = JobStore::new();
        store.insert(JobRecord::new("j1", BackendKind::LocalProcess)).await;

        assert!(store.resolve("j1", JobResult::Artifact(artifact())).await);
        assert!(
            !store
                .resolve("j1", JobResult::Failure(JobFailure::backend("late")))
                .await
        );

        let record = store.get("j1").await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, Some(100));
        assert!(matches!(record.result, Some(JobResult::Artifact(_))));
    }

    #[tokio::test]
    async fn timeout_failure_maps_to_timed_out_status() {
        let store = JobStore::new();
        store.insert(JobRecord::new("j1", BackendKind::Serverless)).await;
        store
            .resolve("j1", JobResult::Failure(JobFailure::timeout("deadline")))
            .await;
        assert_eq!(store.get("j1").await.unwrap().status, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn progress_ignored_after_terminal() {
        let store = JobStore::new();
        store.insert(JobRecord::new("j1", BackendKind::RemoteService)).await;

        assert!(store.mark_processing("j1", Some(40)).await);
        assert_eq!(store.get("j1").await.unwrap().status, JobStatus::Processing);

        store
            .resolve("j1", JobResult::Failure(JobFailure::backend("boom")))
            .await;
        assert!(!store.mark_processing("j1", Some(90)).await);

        let record = store.get("j1").await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.progress, Some(40));
    }

    #[tokio::test]
    async fn unknown_job_operations_are_noops() {
        let store = JobStore::new();
        assert!(!store.mark_processing("nope", None).await);
        assert!(!store.resolve("nope", JobResult::Artifact(artifact())).await);
        assert!(store.wait_terminal("nope").await.is_none());
    }

    #[tokio::test]
    async fn waiters_wake_on_resolution() {
        let store = Arc::new(JobStore::new());
        store.insert(JobRecord::new("j1", BackendKind::LocalProcess)).await;

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_terminal("j1").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.resolve("j1", JobResult::Artifact(artifact())).await;

        let record = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[test]
    fn failure_kinds_map_to_error_taxonomy() {
        assert_eq!(JobFailure::not_found("x").error_kind(), ErrorKind::JobNotFound);
        assert_eq!(JobFailure::timeout("x").error_kind(), ErrorKind::JobTimeout);
        assert_eq!(JobFailure::cancelled().error_kind(), ErrorKind::JobBackend);
    }
}
