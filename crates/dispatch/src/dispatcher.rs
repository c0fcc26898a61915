//! Backend selection and the job lifecycle around it.
//!
//! Every [`Dispatcher::submit`] reads a fresh configuration snapshot and
//! picks a backend in this order:
//!
//! 1. the serverless API when it is the preferred backend (missing
//!    credentials are a configuration error, not a reason to fall back);
//! 2. the local engine when an installation is configured and the engine
//!    is running, already healthy, or may be autostarted;
//! 3. the containerized service.
//!
//! Accepted jobs get a dispatcher-issued id. A tracked task monitors each
//! one and commits the outcome to the [`JobStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use atelier_comfyui::supervisor::{EngineState, EngineSupervisor};
use atelier_core::config::{BackendConfig, ConfigStore, EngineConfig, PreferredBackend};
use atelier_core::job::{FailureKind, JobFailure, JobRecord, JobResult, JobStatus, JobStore};
use atelier_core::monitor::{JobMonitor, MonitorOutcome, MonitorSettings, DEFAULT_JOB_TIMEOUT};
use atelier_core::types::{Artifact, BackendKind, JobId};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backend::Backend;
use crate::error::DispatchError;
use crate::events::{DispatchEvent, EventBus};
use crate::local::LocalBackend;
use crate::remote::RemoteServiceBackend;
use crate::request::JobRequest;
use crate::serverless::ServerlessBackend;

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    /// Used when a request carries no timeout of its own.
    pub job_timeout: Duration,
    pub monitor: MonitorSettings,
    /// How long `shutdown` waits for monitor tasks to wind down.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            job_timeout: DEFAULT_JOB_TIMEOUT,
            monitor: MonitorSettings::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// What `poll_status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub backend: BackendKind,
}

impl From<&JobRecord> for JobStatusView {
    fn from(record: &JobRecord) -> Self {
        let error = match &record.result {
            Some(JobResult::Failure(failure)) => Some(failure.message.clone()),
            _ => None,
        };
        Self {
            status: record.status,
            progress: record.progress,
            error,
            backend: record.backend,
        }
    }
}

struct ActiveJob {
    backend: Arc<dyn Backend>,
    handle: String,
    cancel: CancellationToken,
}

/// Cheap to clone; clones share jobs, events and the engine supervisor.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConfigStore,
    store: Arc<JobStore>,
    monitor: JobMonitor,
    events: EventBus,
    settings: DispatcherSettings,
    /// Shared by every local submission and its WebSocket.
    client_id: String,
    engine: Mutex<Option<(EngineConfig, EngineSupervisor)>>,
    active: Mutex<HashMap<JobId, ActiveJob>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(config: ConfigStore) -> Self {
        Self::with_settings(config, DispatcherSettings::default())
    }

    pub fn with_settings(config: ConfigStore, settings: DispatcherSettings) -> Self {
        let store = Arc::new(JobStore::new());
        let monitor = JobMonitor::new(Arc::clone(&store)).with_settings(settings.monitor);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                monitor,
                events: EventBus::default(),
                settings,
                client_id: uuid::Uuid::new_v4().to_string(),
                engine: Mutex::new(None),
                active: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DispatchEvent> {
        self.inner.events.subscribe()
    }

    /// The supervisor for the currently configured installation, if any
    /// submission or [`engine`](Self::engine) call has created one.
    pub async fn engine_supervisor(&self) -> Option<EngineSupervisor> {
        self.inner
            .engine
            .lock()
            .await
            .as_ref()
            .map(|(_, supervisor)| supervisor.clone())
    }

    /// Supervisor for the installation in the current snapshot, created
    /// on first use. `None` when no installation is configured.
    pub async fn engine(&self) -> Option<EngineSupervisor> {
        let config = self.inner.config.snapshot();
        let engine = config.engine.as_ref()?;
        Some(self.supervisor_for(engine).await)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Submit a job to the backend the current configuration selects.
    ///
    /// Returns once the backend has accepted the job; completion is
    /// observed through [`poll_status`](Self::poll_status),
    /// [`await_result`](Self::await_result) or the event stream.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, DispatchError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DispatchError::ShutDown);
        }

        let config = self.inner.config.snapshot();
        let backend = self.select_backend(&config).await?;
        let kind = backend.kind();

        let handle = backend.submit(&request).await.map_err(|e| {
            tracing::warn!(backend = kind.as_str(), error = %e, "Submission rejected");
            e
        })?;

        let job_id: JobId = uuid::Uuid::new_v4().to_string();
        self.inner
            .store
            .insert(JobRecord::new(job_id.clone(), kind).with_handle(handle.clone()))
            .await;

        let cancel = self.inner.shutdown.child_token();
        self.inner.active.lock().await.insert(
            job_id.clone(),
            ActiveJob {
                backend: Arc::clone(&backend),
                handle: handle.clone(),
                cancel: cancel.clone(),
            },
        );

        tracing::info!(
            job_id = %job_id,
            backend = kind.as_str(),
            handle = %handle,
            "Job submitted",
        );
        self.inner.events.publish(DispatchEvent::Submitted {
            job_id: job_id.clone(),
            backend: kind,
            handle: handle.clone(),
        });

        let timeout = request.timeout().unwrap_or(self.inner.settings.job_timeout);
        let inner = Arc::clone(&self.inner);
        let id = job_id.clone();
        self.inner.tracker.spawn(async move {
            let outcome = inner
                .monitor
                .monitor(
                    &id,
                    &handle,
                    timeout,
                    backend.probe(),
                    backend.push_channel(),
                    cancel,
                )
                .await;
            inner.active.lock().await.remove(&id);
            inner.publish_outcome(&id, kind, outcome);
        });

        Ok(job_id)
    }

    pub async fn poll_status(&self, job_id: &str) -> Result<JobStatusView, DispatchError> {
        let record = self.record(job_id).await?;
        Ok(JobStatusView::from(&record))
    }

    /// The artifact of a completed job.
    ///
    /// `NotReady` while the job is in flight; a failed job returns its
    /// failure as [`DispatchError::Job`].
    pub async fn fetch_result(&self, job_id: &str) -> Result<Artifact, DispatchError> {
        let record = self.record(job_id).await?;
        result_of(record)
    }

    /// Wait for the job to reach a terminal state, then behave like
    /// [`fetch_result`](Self::fetch_result).
    pub async fn await_result(&self, job_id: &str) -> Result<Artifact, DispatchError> {
        let record = self
            .inner
            .store
            .wait_terminal(job_id)
            .await
            .ok_or_else(|| DispatchError::UnknownJob(job_id.to_string()))?;
        result_of(record)
    }

    /// Stop monitoring a job and ask its backend to drop it.
    ///
    /// Returns `true` when the job resolved as a cancelled failure and
    /// `false` when it had already finished, including a completion that
    /// won the race against this call.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, DispatchError> {
        if !self.inner.store.contains(job_id).await {
            return Err(DispatchError::UnknownJob(job_id.to_string()));
        }
        let Some(active) = self.inner.active.lock().await.remove(job_id) else {
            return Ok(false);
        };

        if let Err(e) = active.backend.cancel(&active.handle).await {
            tracing::warn!(
                job_id = %job_id,
                handle = %active.handle,
                error = %e,
                "Backend cancel failed; abandoning job",
            );
        }
        active.cancel.cancel();

        let cancelled = self
            .inner
            .store
            .wait_terminal(job_id)
            .await
            .is_some_and(|record| {
                matches!(
                    record.result,
                    Some(JobResult::Failure(ref failure)) if failure.kind == FailureKind::Cancelled
                )
            });
        if cancelled {
            tracing::info!(job_id = %job_id, "Job cancelled");
        } else {
            tracing::info!(job_id = %job_id, "Job finished before cancellation took effect");
        }
        Ok(cancelled)
    }

    /// Drop a finished job and its artifact from the store.
    ///
    /// Returns `false` while the job is still in flight.
    pub async fn forget(&self, job_id: &str) -> Result<bool, DispatchError> {
        let record = self.record(job_id).await?;
        if !record.status.is_terminal() {
            return Ok(false);
        }
        self.inner.store.remove(job_id).await;
        tracing::debug!(job_id = %job_id, "Job forgotten");
        Ok(true)
    }

    /// Cancel every monitor, wait up to the grace period for them to
    /// finish, then stop the local engine if this dispatcher started it.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        if tokio::time::timeout(self.inner.settings.shutdown_grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.inner.tracker.len(),
                "Monitor tasks still running after shutdown grace",
            );
        }

        let engine = self.inner.engine.lock().await.take();
        if let Some((_, supervisor)) = engine {
            supervisor.stop().await?;
        }
        tracing::info!("Dispatcher shut down");
        Ok(())
    }

    // ---- private helpers ----

    async fn record(&self, job_id: &str) -> Result<JobRecord, DispatchError> {
        self.inner
            .store
            .get(job_id)
            .await
            .ok_or_else(|| DispatchError::UnknownJob(job_id.to_string()))
    }

    async fn select_backend(
        &self,
        config: &BackendConfig,
    ) -> Result<Arc<dyn Backend>, DispatchError> {
        if config.preferred == PreferredBackend::Serverless {
            let backend =
                ServerlessBackend::from_config(&config.serverless, config.huggingface_token.clone())?;
            tracing::debug!("Selected serverless backend");
            return Ok(Arc::new(backend));
        }

        if let Some(engine) = &config.engine {
            let supervisor = self.supervisor_for(engine).await;
            if self.engine_usable(&supervisor, engine).await? {
                tracing::debug!(base_url = %engine.base_url(), "Selected local engine");
                return Ok(Arc::new(LocalBackend::new(
                    supervisor,
                    engine.ws_url(),
                    self.inner.client_id.clone(),
                )));
            }
            tracing::info!(
                base_url = %engine.base_url(),
                "Local engine not running and autostart disabled; using remote service",
            );
        }

        tracing::debug!(base_url = %config.remote_service_url, "Selected remote service");
        Ok(Arc::new(RemoteServiceBackend::new(
            config.remote_service_url.as_str(),
        )))
    }

    /// Running, or made running by adopting a healthy engine or by
    /// autostart. Start failures propagate.
    async fn engine_usable(
        &self,
        supervisor: &EngineSupervisor,
        engine: &EngineConfig,
    ) -> Result<bool, DispatchError> {
        if supervisor.state() == EngineState::Running {
            return Ok(true);
        }
        if engine.autostart || supervisor.is_healthy().await {
            supervisor.start().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Reuse the supervisor while the installation settings are unchanged.
    /// A changed installation replaces it and stops the old engine.
    async fn supervisor_for(&self, engine: &EngineConfig) -> EngineSupervisor {
        let (supervisor, replaced) = {
            let mut slot = self.inner.engine.lock().await;
            match slot.as_ref() {
                Some((current, supervisor)) if current == engine => (supervisor.clone(), None),
                _ => {
                    let supervisor = EngineSupervisor::from_config(engine);
                    let previous = slot.replace((engine.clone(), supervisor.clone()));
                    (supervisor, previous)
                }
            }
        };

        if let Some((old_config, old)) = replaced {
            tracing::info!(
                install_path = %old_config.install_path.display(),
                "Engine configuration changed; stopping previous engine",
            );
            if let Err(e) = old.stop().await {
                tracing::warn!(error = %e, "Failed to stop previous engine");
            }
        }
        supervisor
    }
}

impl Inner {
    fn publish_outcome(&self, job_id: &str, backend: BackendKind, outcome: MonitorOutcome) {
        let job_id = job_id.to_string();
        let event = match outcome {
            MonitorOutcome::Completed { source, .. } => DispatchEvent::Completed {
                job_id,
                backend,
                source,
            },
            MonitorOutcome::Failed { failure, .. } => failed_event(job_id, backend, failure),
            MonitorOutcome::Cancelled => failed_event(job_id, backend, JobFailure::cancelled()),
            MonitorOutcome::TimedOut => DispatchEvent::TimedOut { job_id, backend },
        };
        self.events.publish(event);
    }
}

fn failed_event(job_id: JobId, backend: BackendKind, failure: JobFailure) -> DispatchEvent {
    DispatchEvent::Failed {
        job_id,
        backend,
        kind: failure.error_kind(),
        message: failure.message,
    }
}

fn result_of(record: JobRecord) -> Result<Artifact, DispatchError> {
    match record.result {
        Some(JobResult::Artifact(artifact)) => Ok(artifact),
        Some(JobResult::Failure(failure)) => Err(DispatchError::Job(failure)),
        None => Err(DispatchError::NotReady(record.id)),
    }
}
