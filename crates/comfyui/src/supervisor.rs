//! Local ComfyUI process supervisor.
//!
//! [`EngineSupervisor`] owns at most one engine process and drives it
//! through `Stopped -> Starting -> HealthVerifying -> Running -> Stopping
//! -> Stopped`. `Failed` is entered when startup fails or the process
//! exits on its own after reaching `Running`; a later [`start`] is a
//! fresh attempt.
//!
//! The `Child` is owned by a reaper task. Everything else talks to it
//! through a kill channel and an exit watch, so there is exactly one
//! place that waits on the process.
//!
//! [`start`]: EngineSupervisor::start

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use atelier_core::classifier::{ClassCounters, LineClass, OutputClassifier};
use atelier_core::config::EngineConfig;
use atelier_core::error::ErrorKind;
use atelier_core::layout::ModelLayout;
use atelier_core::progress::{Progress, ProgressReporter};
use atelier_core::types::Timestamp;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::api::ComfyUIApi;

/// Engine entry point, relative to the installation root.
pub const ENTRY_POINT: &str = "main.py";
/// Custom-node directory, relative to the installation root.
pub const CUSTOM_NODES_DIR: &str = "custom_nodes";
/// File whose presence means the Kontext nodes are installed.
pub const KONTEXT_NODES_FILE: &str = "custom_nodes/ComfyUI-Flux-Kontext/nodes.py";

/// Output markers that advance startup progress.
const STARTUP_MARKERS: &[(&str, u8, &str)] = &[
    ("Starting server", 50, "ComfyUI server starting..."),
    ("To see the GUI go to", 70, "ComfyUI server ready, verifying..."),
];

/// Bound on the acceleration probe command.
const GPU_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long output still in flight is read after the process exits.
const EXIT_OUTPUT_DRAIN: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle state of the supervised engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    HealthVerifying,
    Running,
    Stopping,
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::HealthVerifying => "health_verifying",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }
}

/// Errors raised by the supervisor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    /// Required files or directories are missing.
    #[error("Invalid ComfyUI installation: {0}")]
    InstallationInvalid(String),

    /// The process could not be spawned.
    #[error("Failed to start ComfyUI: {0}")]
    Spawn(String),

    /// The engine printed an unrecognized error line during startup.
    #[error("ComfyUI error: {0}")]
    FatalOutput(String),

    /// The engine reported stale Python requirements.
    #[error("ComfyUI needs dependency updates: {0}")]
    DependencyUpdateRequired(String),

    /// The process exited before it became healthy.
    #[error("ComfyUI exited with code {}", display_code(.code))]
    ProcessExited { code: Option<i32> },

    /// Health verification exceeded its attempt or time budget.
    #[error("ComfyUI failed to start within {elapsed_secs}s ({attempts} health checks)")]
    StartupTimeout { attempts: u32, elapsed_secs: u64 },

    /// The process did not exit after being killed.
    #[error("ComfyUI did not exit after being killed")]
    ShutdownTimeout,
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string())
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InstallationInvalid(_) => ErrorKind::InstallationInvalid,
            Self::Spawn(_) | Self::ProcessExited { .. } => ErrorKind::ProcessSpawn,
            Self::FatalOutput(_) | Self::DependencyUpdateRequired(_) => {
                ErrorKind::ProcessFatalOutput
            }
            Self::StartupTimeout { .. } | Self::ShutdownTimeout => ErrorKind::ProcessTimeout,
        }
    }
}

/// Result of [`EngineSupervisor::validate_installation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallationReport {
    pub install_path: PathBuf,
    pub models_dir: PathBuf,
    pub has_kontext_nodes: bool,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: EngineState,
    pub pid: Option<u32>,
    pub started_at: Option<Timestamp>,
    pub output: ClassCounters,
    /// Processes spawned over the supervisor's lifetime.
    pub spawn_count: u64,
    pub last_error: Option<String>,
}

/// Process launch and timing parameters.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub install_path: PathBuf,
    /// Interpreter that runs the entry point.
    pub program: String,
    pub entry_point: String,
    pub listen_host: String,
    pub port: u16,
    /// HTTP base URL probed for health.
    pub base_url: String,
    /// Command whose success means GPU acceleration is available.
    /// Empty disables the probe and always runs on CPU.
    pub gpu_probe: Vec<String>,
    pub health_interval: Duration,
    pub max_health_attempts: u32,
    pub startup_timeout: Duration,
    /// Wait between SIGTERM and a forced kill.
    pub stop_grace: Duration,
    /// Wait for the exit event after a forced kill.
    pub kill_timeout: Duration,
    pub classifier: OutputClassifier,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            install_path: config.install_path.clone(),
            program: config.python.clone(),
            entry_point: ENTRY_POINT.to_string(),
            listen_host: config.host.clone(),
            port: config.port,
            base_url: config.base_url(),
            gpu_probe: vec!["nvidia-smi".to_string()],
            health_interval: Duration::from_secs(1),
            max_health_attempts: 30,
            startup_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            classifier: OutputClassifier::default(),
        }
    }

    /// Launch arguments, including `--cpu` unless acceleration is available.
    pub fn launch_args(&self, accelerated: bool) -> Vec<String> {
        let mut args = vec![
            self.entry_point.clone(),
            "--listen".to_string(),
            self.listen_host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--disable-auto-launch".to_string(),
            "--disable-metadata".to_string(),
        ];
        if !accelerated {
            args.push("--cpu".to_string());
        }
        args
    }
}

// ---------------------------------------------------------------------------
// EngineSupervisor
// ---------------------------------------------------------------------------

/// Supervises a single local ComfyUI process. Cheap to clone.
#[derive(Clone)]
pub struct EngineSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: EngineSettings,
    api: ComfyUIApi,
    state: watch::Sender<EngineState>,
    progress: ProgressReporter,
    process: Mutex<Option<ProcessHandle>>,
    /// Serializes `start` calls.
    start_lock: Mutex<()>,
    counters: Arc<StdMutex<ClassCounters>>,
    last_error: StdMutex<Option<String>>,
    spawn_count: AtomicU64,
}

/// Supervisor-side view of a spawned process. The `Child` itself lives
/// in the reaper task.
struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    started_at: Timestamp,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

#[derive(Debug, Clone, Copy)]
struct ExitInfo {
    code: Option<i32>,
}

/// Something a stream reader saw that matters to `start`.
enum StartupSignal {
    Fatal(String),
    DependencyUpdate(String),
    Marker(u8, &'static str),
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl EngineSupervisor {
    pub fn new(settings: EngineSettings) -> Self {
        let api = ComfyUIApi::new(settings.base_url.clone());
        let (state, _) = watch::channel(EngineState::Stopped);
        Self {
            inner: Arc::new(Inner {
                settings,
                api,
                state,
                progress: ProgressReporter::new(),
                process: Mutex::new(None),
                start_lock: Mutex::new(()),
                counters: Arc::new(StdMutex::new(ClassCounters::default())),
                last_error: StdMutex::new(None),
                spawn_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(EngineSettings::from_config(config))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.inner.api
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.inner.progress.subscribe()
    }

    pub fn spawn_count(&self) -> u64 {
        self.inner.spawn_count.load(Ordering::SeqCst)
    }

    /// Check required paths and create the model directories.
    pub fn validate_installation(&self) -> Result<InstallationReport, SupervisorError> {
        let root = &self.inner.settings.install_path;
        if !root.is_dir() {
            return Err(SupervisorError::InstallationInvalid(format!(
                "ComfyUI path does not exist: {}",
                root.display()
            )));
        }
        let entry = root.join(&self.inner.settings.entry_point);
        if !entry.is_file() {
            return Err(SupervisorError::InstallationInvalid(format!(
                "{} not found in {}",
                self.inner.settings.entry_point,
                root.display()
            )));
        }
        if !root.join(CUSTOM_NODES_DIR).is_dir() {
            return Err(SupervisorError::InstallationInvalid(format!(
                "{CUSTOM_NODES_DIR} directory not found in {}",
                root.display()
            )));
        }

        let layout = ModelLayout::new(root);
        layout.ensure_dirs().map_err(|e| {
            SupervisorError::InstallationInvalid(format!(
                "Failed to create model directories under {}: {e}",
                layout.models_dir().display()
            ))
        })?;

        let has_kontext_nodes = root.join(KONTEXT_NODES_FILE).is_file();
        if !has_kontext_nodes {
            tracing::warn!(
                install_path = %root.display(),
                "Kontext custom nodes not installed",
            );
        }

        Ok(InstallationReport {
            install_path: root.clone(),
            models_dir: layout.models_dir(),
            has_kontext_nodes,
        })
    }

    /// Side-effect-free health check against the engine base URL.
    pub async fn is_healthy(&self) -> bool {
        self.inner.api.is_reachable().await
    }

    /// Start the engine and wait until it answers health checks.
    ///
    /// A no-op when already `Running`. An engine that is already
    /// reachable (started outside this supervisor) is adopted without
    /// spawning.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _guard = self.inner.start_lock.lock().await;

        if self.state() == EngineState::Running {
            return Ok(());
        }

        let progress = &self.inner.progress;
        progress.reset("Starting ComfyUI...");
        progress.report(10, "Starting ComfyUI...");

        if let Err(e) = self.validate_installation() {
            return Err(self.fail_start(e));
        }

        if self.is_healthy().await {
            tracing::info!(base_url = %self.inner.settings.base_url, "ComfyUI already running");
            self.set_state(EngineState::Running);
            progress.report(100, "ComfyUI is already running");
            return Ok(());
        }

        self.set_state(EngineState::Starting);
        *self.inner.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;

        let accelerated = self.probe_acceleration().await;
        progress.report(
            20,
            if accelerated {
                "GPU detected, starting ComfyUI..."
            } else {
                "No GPU detected, starting ComfyUI in CPU mode..."
            },
        );

        let (signal_tx, signal_rx) = mpsc::channel(64);
        let mut exit_rx = match self.spawn_process(accelerated, signal_tx).await {
            Ok(rx) => rx,
            Err(e) => return Err(self.fail_start(e)),
        };

        self.set_state(EngineState::HealthVerifying);

        match self.verify_startup(signal_rx, &mut exit_rx).await {
            Ok(()) => {
                self.set_state(EngineState::Running);
                progress.report(100, "ComfyUI is ready!");
                let pid = self.pid().await;
                tracing::info!(
                    base_url = %self.inner.settings.base_url,
                    pid = ?pid,
                    "ComfyUI started",
                );
                Ok(())
            }
            Err(e) => {
                if let Some(handle) = self.inner.process.lock().await.take() {
                    if let Err(stop_err) = self.terminate(handle).await {
                        tracing::error!(error = %stop_err, "Failed to stop ComfyUI after startup failure");
                    }
                }
                Err(self.fail_start(e))
            }
        }
    }

    /// Stop the engine: SIGTERM, grace period, then forced kill.
    ///
    /// Resolves after the process has exited. Trivially succeeds when no
    /// process is owned.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let handle = self.inner.process.lock().await.take();
        let Some(handle) = handle else {
            if self.state() != EngineState::Stopped {
                self.set_state(EngineState::Stopped);
            }
            return Ok(());
        };

        self.set_state(EngineState::Stopping);
        tracing::info!(pid = ?handle.pid, "Stopping ComfyUI");

        match self.terminate(handle).await {
            Ok(()) => {
                self.set_state(EngineState::Stopped);
                tracing::info!("ComfyUI stopped");
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                self.set_state(EngineState::Failed);
                Err(e)
            }
        }
    }

    pub async fn status(&self) -> SupervisorStatus {
        let (pid, started_at) = match self.inner.process.lock().await.as_ref() {
            Some(h) => (h.pid, Some(h.started_at)),
            None => (None, None),
        };
        SupervisorStatus {
            state: self.state(),
            pid,
            started_at,
            output: *self.inner.counters.lock().unwrap_or_else(|e| e.into_inner()),
            spawn_count: self.spawn_count(),
            last_error: self
                .inner
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    // ---- private helpers ----

    async fn pid(&self) -> Option<u32> {
        self.inner.process.lock().await.as_ref().and_then(|h| h.pid)
    }

    fn set_state(&self, next: EngineState) {
        let previous = self.inner.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = previous.as_str(), to = next.as_str(), "Engine state changed");
        }
    }

    fn record_error(&self, err: &SupervisorError) {
        *self.inner.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
    }

    fn fail_start(&self, err: SupervisorError) -> SupervisorError {
        tracing::error!(error = %err, kind = %err.kind(), "ComfyUI startup failed");
        self.record_error(&err);
        let message = match &err {
            SupervisorError::DependencyUpdateRequired(_) => {
                "ComfyUI needs dependency updates - see log for instructions".to_string()
            }
            other => other.to_string(),
        };
        self.inner.progress.report(0, message);
        // A concurrent `stop` owns the final state.
        self.inner.state.send_if_modified(|state| {
            if matches!(state, EngineState::Stopping | EngineState::Stopped) {
                false
            } else {
                *state = EngineState::Failed;
                true
            }
        });
        err
    }

    async fn probe_acceleration(&self) -> bool {
        let Some((program, args)) = self.inner.settings.gpu_probe.split_first() else {
            return false;
        };
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(GPU_PROBE_TIMEOUT, status).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!(probe = %program, error = %e, "GPU probe unavailable");
                false
            }
            Err(_) => {
                tracing::warn!(probe = %program, "GPU probe timed out");
                false
            }
        }
    }

    async fn spawn_process(
        &self,
        accelerated: bool,
        signal_tx: mpsc::Sender<StartupSignal>,
    ) -> Result<watch::Receiver<Option<ExitInfo>>, SupervisorError> {
        let settings = &self.inner.settings;
        let args = settings.launch_args(accelerated);

        tracing::info!(
            program = %settings.program,
            args = ?args,
            cwd = %settings.install_path.display(),
            "Spawning ComfyUI",
        );

        let mut child = Command::new(&settings.program)
            .args(&args)
            .current_dir(&settings.install_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {e}", settings.program)))?;

        let generation = self.inner.spawn_count.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.counters.lock().unwrap_or_else(|e| e.into_inner()) = ClassCounters::default();

        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(stdout, Stream::Stdout, signal_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(stderr, Stream::Stderr, signal_tx);
        }

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(reap(
            Arc::downgrade(&self.inner),
            child,
            kill_rx,
            exit_tx,
            generation,
        ));

        *self.inner.process.lock().await = Some(ProcessHandle {
            generation,
            pid,
            started_at: chrono::Utc::now(),
            kill_tx: Some(kill_tx),
            exit_rx: exit_rx.clone(),
        });

        Ok(exit_rx)
    }

    fn spawn_reader<R>(&self, stream: R, which: Stream, signals: mpsc::Sender<StartupSignal>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let classifier = self.inner.settings.classifier.clone();
        let counters = Arc::clone(&self.inner.counters);
        let install_path = self.inner.settings.install_path.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(stream = which.as_str(), error = %e, "Engine output read failed");
                        break;
                    }
                };

                let class = classifier.classify(&line);
                counters.lock().unwrap_or_else(|e| e.into_inner()).record(class);

                for (marker, percent, message) in STARTUP_MARKERS {
                    if line.contains(marker) {
                        let _ = signals.try_send(StartupSignal::Marker(*percent, *message));
                    }
                }

                if classifier.requires_dependency_update(&line) {
                    log_dependency_hint(&install_path);
                    let _ = signals.try_send(StartupSignal::DependencyUpdate(line));
                    continue;
                }

                match class {
                    LineClass::Informational => {
                        tracing::info!(stream = which.as_str(), "[ComfyUI] {line}");
                    }
                    LineClass::Suppressible => {
                        tracing::trace!(stream = which.as_str(), "[ComfyUI] {line}");
                    }
                    LineClass::Fatal => {
                        tracing::error!(stream = which.as_str(), "[ComfyUI Error] {line}");
                        let _ = signals.try_send(StartupSignal::Fatal(line));
                    }
                }
            }
        });
    }

    /// Race health checks against fatal output, process exit and the
    /// overall deadline.
    async fn verify_startup(
        &self,
        mut signals: mpsc::Receiver<StartupSignal>,
        exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
    ) -> Result<(), SupervisorError> {
        let settings = &self.inner.settings;
        let started = tokio::time::Instant::now();
        let deadline = tokio::time::sleep(settings.startup_timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval_at(
            started + settings.health_interval,
            settings.health_interval,
        );
        let mut attempts = 0u32;

        let timeout_error = |attempts: u32| SupervisorError::StartupTimeout {
            attempts,
            elapsed_secs: started.elapsed().as_secs(),
        };

        loop {
            tokio::select! {
                biased;

                Some(signal) = signals.recv() => match signal {
                    StartupSignal::Fatal(line) => return Err(SupervisorError::FatalOutput(line)),
                    StartupSignal::DependencyUpdate(line) => {
                        return Err(SupervisorError::DependencyUpdateRequired(line));
                    }
                    StartupSignal::Marker(percent, message) => {
                        self.inner.progress.report(percent, message);
                    }
                },
                _ = exit_rx.changed() => {
                    // The readers may not have forwarded the last lines yet.
                    if let Some(cause) = self.drain_output_cause(&mut signals).await {
                        return Err(cause);
                    }
                    let code = exit_rx.borrow().and_then(|e| e.code);
                    return Err(SupervisorError::ProcessExited { code });
                }
                _ = &mut deadline => return Err(timeout_error(attempts)),
                _ = ticker.tick() => {
                    attempts += 1;
                    if self.is_healthy().await {
                        return Ok(());
                    }
                    if attempts >= settings.max_health_attempts {
                        return Err(timeout_error(attempts));
                    }
                }
            }
        }
    }

    /// Read signals until both stream readers hit EOF, bounded by
    /// [`EXIT_OUTPUT_DRAIN`]. Returns the first fatal cause seen.
    async fn drain_output_cause(
        &self,
        signals: &mut mpsc::Receiver<StartupSignal>,
    ) -> Option<SupervisorError> {
        let drain = async {
            while let Some(signal) = signals.recv().await {
                match signal {
                    StartupSignal::Fatal(line) => return Some(SupervisorError::FatalOutput(line)),
                    StartupSignal::DependencyUpdate(line) => {
                        return Some(SupervisorError::DependencyUpdateRequired(line));
                    }
                    StartupSignal::Marker(percent, message) => {
                        self.inner.progress.report(percent, message);
                    }
                }
            }
            None
        };
        tokio::time::timeout(EXIT_OUTPUT_DRAIN, drain)
            .await
            .ok()
            .flatten()
    }

    /// Graceful-then-forced termination of a handle taken out of `process`.
    async fn terminate(&self, mut handle: ProcessHandle) -> Result<(), SupervisorError> {
        let settings = &self.inner.settings;
        if handle.exit_rx.borrow().is_some() {
            return Ok(());
        }

        send_sigterm(handle.pid);
        if wait_for_exit(&mut handle.exit_rx, settings.stop_grace).await {
            return Ok(());
        }

        tracing::warn!(
            pid = ?handle.pid,
            grace_secs = settings.stop_grace.as_secs(),
            "ComfyUI ignored SIGTERM, killing",
        );
        if let Some(kill_tx) = handle.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if wait_for_exit(&mut handle.exit_rx, settings.kill_timeout).await {
            Ok(())
        } else {
            Err(SupervisorError::ShutdownTimeout)
        }
    }
}

/// Sole owner of the `Child`. Waits for exit (or a kill request),
/// publishes the exit and updates supervisor state.
async fn reap(
    inner: Weak<Inner>,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    generation: u64,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on an explicit kill request and when the handle is dropped.
        _ = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "Failed to kill ComfyUI");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(error = %e, "Failed waiting on ComfyUI process");
            None
        }
    };
    exit_tx.send_replace(Some(ExitInfo { code }));

    let Some(inner) = inner.upgrade() else {
        return;
    };
    {
        let mut process = inner.process.lock().await;
        if process.as_ref().is_some_and(|h| h.generation == generation) {
            *process = None;
        }
    }

    let was_running = inner.state.send_if_modified(|state| {
        if *state == EngineState::Running {
            *state = EngineState::Failed;
            true
        } else {
            false
        }
    });
    if was_running {
        let message = format!("ComfyUI exited unexpectedly with code {}", display_code(&code));
        tracing::error!(code = ?code, "ComfyUI exited unexpectedly");
        *inner.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    } else {
        tracing::debug!(code = ?code, "ComfyUI process exited");
    }
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<ExitInfo>>, within: Duration) -> bool {
    let wait = async {
        loop {
            if exit_rx.borrow_and_update().is_some() {
                return;
            }
            if exit_rx.changed().await.is_err() {
                return;
            }
        }
    };
    tokio::time::timeout(within, wait).await.is_ok()
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}

fn log_dependency_hint(install_path: &Path) {
    tracing::warn!("[ComfyUI] Dependency update required. Please run:");
    tracing::warn!(
        "[ComfyUI] cd {} && python -m pip install -r requirements.txt",
        install_path.display()
    );
}
