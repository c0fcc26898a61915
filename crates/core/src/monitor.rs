//! Hybrid push/poll job monitor.
//!
//! A job is watched by two independent paths that race toward one
//! completion check:
//!
//! - the **push path** runs a [`PushChannel`] (e.g. a WebSocket) and
//!   reacts to its [`PushSignal`]s;
//! - the **poll path** asks the [`CompletionProbe`] after an initial
//!   delay and then at a fixed interval.
//!
//! Both call the same `check_completion`, serialized behind an async
//! mutex that holds the resolution state. The first path to see a
//! terminal result commits it to the [`JobStore`] and the other path
//! becomes a no-op. When the monitor returns, both path tasks have been
//! cancelled and joined.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::job::{JobFailure, JobResult, JobStore};
use crate::types::Artifact;

/// Default overall deadline for one job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Delay between a push "finished" signal and the completion check.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Delay before the first poll.
pub const DEFAULT_INITIAL_CHECK_DELAY: Duration = Duration::from_secs(1);
/// Interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on joining a path task during teardown.
const TASK_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Buffer between a push channel and the push path.
const PUSH_SIGNAL_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// What a probe observed for a correlation handle.
#[derive(Debug, Clone)]
pub enum ProbeStatus {
    /// Not finished yet.
    Pending { progress: Option<u8> },
    Completed(Artifact),
    /// A terminal failure reported by the backend.
    Failed(JobFailure),
}

/// Transient probe failure. Logged, never terminal.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

/// One-shot status query against a backend.
#[async_trait]
pub trait CompletionProbe: Send + Sync {
    async fn check(&self, handle: &str) -> Result<ProbeStatus, ProbeError>;
}

/// Event pushed by a backend for a correlation handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushSignal {
    Started,
    Progress(u8),
    /// The backend finished executing; the result may not be readable yet.
    Finished,
    Failed(String),
}

/// Push-channel failure. Ends the push path only.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PushError(pub String);

/// Long-lived event source for one handle.
///
/// Implementations send signals until `cancel` fires or the underlying
/// transport gives up. Returning ends the push path; the poll path keeps
/// running regardless.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn run(
        &self,
        handle: &str,
        signals: mpsc::Sender<PushSignal>,
        cancel: CancellationToken,
    ) -> Result<(), PushError>;
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Which path resolved the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    Push,
    Poll,
}

impl CompletionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll => "poll",
        }
    }
}

/// How monitoring ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Completed {
        artifact: Artifact,
        source: CompletionSource,
    },
    Failed {
        failure: JobFailure,
        source: CompletionSource,
    },
    TimedOut,
    Cancelled,
}

impl MonitorOutcome {
    fn to_result(&self, timeout: Duration) -> JobResult {
        match self {
            Self::Completed { artifact, .. } => JobResult::Artifact(artifact.clone()),
            Self::Failed { failure, .. } => JobResult::Failure(failure.clone()),
            Self::TimedOut => JobResult::Failure(JobFailure::timeout(format!(
                "Job did not complete within {}s",
                timeout.as_secs()
            ))),
            Self::Cancelled => JobResult::Failure(JobFailure::cancelled()),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Timing knobs for the two paths.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub settle_delay: Duration,
    pub initial_check_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            initial_check_delay: DEFAULT_INITIAL_CHECK_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// JobMonitor
// ---------------------------------------------------------------------------

/// Watches jobs and commits their outcome to a shared [`JobStore`].
#[derive(Clone)]
pub struct JobMonitor {
    store: Arc<JobStore>,
    settings: MonitorSettings,
}

impl JobMonitor {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            settings: MonitorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: MonitorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Watch `job_id` until it resolves, times out or `cancel` fires.
    ///
    /// The outcome is committed to the store before this returns; a job
    /// that was already resolved elsewhere keeps its earlier result.
    pub async fn monitor(
        &self,
        job_id: &str,
        handle: &str,
        timeout: Duration,
        probe: Arc<dyn CompletionProbe>,
        push: Option<Arc<dyn PushChannel>>,
        cancel: CancellationToken,
    ) -> MonitorOutcome {
        let resolver = Arc::new(Resolver {
            store: Arc::clone(&self.store),
            job_id: job_id.to_string(),
            handle: handle.to_string(),
            probe,
            timeout,
            state: Mutex::new(None),
            done: CancellationToken::new(),
        });
        let paths = CancellationToken::new();

        tracing::info!(
            job_id = %job_id,
            handle = %handle,
            timeout_secs = timeout.as_secs(),
            push = push.is_some(),
            "Monitoring job",
        );

        let poll_task = tokio::spawn(poll_path(
            Arc::clone(&resolver),
            self.settings,
            paths.clone(),
        ));
        let push_task = push.map(|channel| {
            tokio::spawn(push_path(
                Arc::clone(&resolver),
                channel,
                self.settings,
                paths.clone(),
            ))
        });

        let fallback = tokio::select! {
            _ = resolver.done.cancelled() => MonitorOutcome::TimedOut,
            _ = tokio::time::sleep(timeout) => MonitorOutcome::TimedOut,
            _ = cancel.cancelled() => MonitorOutcome::Cancelled,
        };

        paths.cancel();
        join_path(job_id, "poll", poll_task).await;
        if let Some(task) = push_task {
            join_path(job_id, "push", task).await;
        }

        let outcome = resolver.finish(fallback).await;
        match &outcome {
            MonitorOutcome::Completed { source, artifact } => tracing::info!(
                job_id = %job_id,
                source = source.as_str(),
                bytes = artifact.len(),
                "Job completed",
            ),
            MonitorOutcome::Failed { source, failure } => tracing::warn!(
                job_id = %job_id,
                source = source.as_str(),
                error = %failure.message,
                "Job failed",
            ),
            MonitorOutcome::TimedOut => tracing::warn!(
                job_id = %job_id,
                timeout_secs = timeout.as_secs(),
                "Job timed out",
            ),
            MonitorOutcome::Cancelled => tracing::info!(job_id = %job_id, "Job monitoring cancelled"),
        }
        outcome
    }
}

// ---- private helpers ----

/// Shared resolution state for one monitored job.
struct Resolver {
    store: Arc<JobStore>,
    job_id: String,
    handle: String,
    probe: Arc<dyn CompletionProbe>,
    timeout: Duration,
    /// `Some` once resolved. Doubles as the compare-and-set flag.
    state: Mutex<Option<MonitorOutcome>>,
    /// Fires when `state` becomes `Some`.
    done: CancellationToken,
}

impl Resolver {
    /// Query the probe and commit a terminal result if it has one.
    ///
    /// Returns `true` once the job is resolved (by this call or earlier).
    async fn check_completion(&self, source: CompletionSource) -> bool {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return true;
        }

        match self.probe.check(&self.handle).await {
            Ok(ProbeStatus::Pending { progress }) => {
                self.store.mark_processing(&self.job_id, progress).await;
                false
            }
            Ok(ProbeStatus::Completed(artifact)) => {
                self.commit(&mut state, MonitorOutcome::Completed { artifact, source })
                    .await;
                true
            }
            Ok(ProbeStatus::Failed(failure)) => {
                self.commit(&mut state, MonitorOutcome::Failed { failure, source })
                    .await;
                true
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    source = source.as_str(),
                    error = %e,
                    "Completion check failed",
                );
                false
            }
        }
    }

    /// Commit `candidate` unless already resolved; return the final outcome.
    async fn finish(&self, candidate: MonitorOutcome) -> MonitorOutcome {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.as_ref() {
            return existing.clone();
        }
        self.commit(&mut state, candidate.clone()).await;
        candidate
    }

    async fn commit(&self, state: &mut Option<MonitorOutcome>, outcome: MonitorOutcome) {
        self.store
            .resolve(&self.job_id, outcome.to_result(self.timeout))
            .await;
        *state = Some(outcome);
        self.done.cancel();
    }
}

async fn poll_path(resolver: Arc<Resolver>, settings: MonitorSettings, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(settings.initial_check_delay) => {}
    }
    loop {
        let resolved = tokio::select! {
            _ = cancel.cancelled() => return,
            resolved = resolver.check_completion(CompletionSource::Poll) => resolved,
        };
        if resolved {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }
}

async fn push_path(
    resolver: Arc<Resolver>,
    channel: Arc<dyn PushChannel>,
    settings: MonitorSettings,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel(PUSH_SIGNAL_BUFFER);
    let run = channel.run(&resolver.handle, tx, cancel.child_token());
    tokio::pin!(run);
    let mut run_finished = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = &mut run, if !run_finished => {
                run_finished = true;
                if let Err(e) = result {
                    tracing::warn!(
                        job_id = %resolver.job_id,
                        error = %e,
                        "Push channel ended, relying on polling",
                    );
                }
            }
            signal = rx.recv() => {
                let Some(signal) = signal else {
                    return;
                };
                match signal {
                    PushSignal::Started => {
                        resolver.store.mark_processing(&resolver.job_id, None).await;
                    }
                    PushSignal::Progress(pct) => {
                        resolver.store.mark_processing(&resolver.job_id, Some(pct)).await;
                    }
                    PushSignal::Finished => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(settings.settle_delay) => {}
                        }
                        let resolved = tokio::select! {
                            _ = cancel.cancelled() => return,
                            resolved = resolver.check_completion(CompletionSource::Push) => resolved,
                        };
                        if resolved {
                            return;
                        }
                    }
                    PushSignal::Failed(message) => {
                        resolver
                            .finish(MonitorOutcome::Failed {
                                failure: JobFailure::backend(message),
                                source: CompletionSource::Push,
                            })
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

async fn join_path(job_id: &str, path: &str, task: JoinHandle<()>) {
    let abort = task.abort_handle();
    match tokio::time::timeout(TASK_JOIN_GRACE, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(job_id = %job_id, path, error = %e, "Monitor path panicked");
        }
        Err(_) => {
            tracing::warn!(job_id = %job_id, path, "Monitor path did not stop in time, aborting");
            abort.abort();
        }
    }
}
