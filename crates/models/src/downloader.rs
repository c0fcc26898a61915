//! Redirect-aware artifact downloads with one transfer per key.
//!
//! A transfer streams into `<target>.tmp` and is renamed into place only
//! after the byte count checks out, so a partially written file never
//! appears at the target path. Every caller asking for the same key while
//! a transfer is active shares that transfer's watch channel and sees the
//! same final status.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use atelier_core::error::ErrorKind;
use atelier_core::progress::percent_of;
use atelier_core::types::Timestamp;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, LOCATION, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

/// Suffix appended to the target path while a transfer is in flight.
pub const TEMP_SUFFIX: &str = ".tmp";
/// A transfer that receives no bytes for this long is abandoned.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_USER_AGENT: &str = concat!("atelier/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    /// The source answered 401.
    #[error("Unauthorized. Please provide a valid HuggingFace token.")]
    AuthRequired,

    /// The source answered 403, usually an unaccepted model license.
    #[error("Access forbidden. Make sure you have accepted the model license.")]
    Forbidden,

    #[error("Download incomplete. Expected {expected} bytes, got {actual} bytes.")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Any other non-success status.
    #[error("HTTP {status}: {reason}")]
    Http { status: u16, reason: String },

    #[error("Redirect failed: {0}")]
    Redirect(String),

    #[error("No data received for {0} seconds")]
    Stalled(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Filesystem error: {0}")]
    Io(String),

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthRequired => ErrorKind::DownloadAuthRequired,
            Self::Forbidden => ErrorKind::DownloadForbidden,
            Self::SizeMismatch { .. } => ErrorKind::DownloadSizeMismatch,
            _ => ErrorKind::DownloadTransport,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Idle,
    Downloading,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Observable state of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub key: String,
    pub url: String,
    pub target: PathBuf,
    pub temp: PathBuf,
    /// Content-length of the final response, when the source sent one.
    pub expected_size: Option<u64>,
    pub bytes_transferred: u64,
    pub percent: Option<u8>,
    pub status: DownloadStatus,
    pub error: Option<DownloadError>,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

impl DownloadTask {
    fn start(key: &str, url: &str, target: PathBuf) -> Self {
        Self {
            key: key.to_string(),
            url: url.to_string(),
            temp: temp_path(&target),
            target,
            expected_size: None,
            bytes_transferred: 0,
            percent: None,
            status: DownloadStatus::Downloading,
            error: None,
            started_at: chrono::Utc::now(),
            finished_at: None,
        }
    }

    fn into_result(self) -> Result<Self, DownloadError> {
        match self.status {
            DownloadStatus::Completed => Ok(self),
            _ => Err(self.error.clone().unwrap_or(DownloadError::Cancelled)),
        }
    }
}

/// `<target>.tmp`, next to the target so the final rename stays on one
/// filesystem.
pub fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// DownloadManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DownloaderSettings {
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

struct TaskEntry {
    state: Arc<watch::Sender<DownloadTask>>,
    cancel: CancellationToken,
}

/// Owns every download started through it.
pub struct DownloadManager {
    client: reqwest::Client,
    settings: DownloaderSettings,
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl DownloadManager {
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_settings(DownloaderSettings::default())
    }

    pub fn with_settings(settings: DownloaderSettings) -> Result<Self, DownloadError> {
        // Redirects are followed by hand so the credential is not forwarded.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(settings.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            settings,
            tasks: RwLock::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &DownloaderSettings {
        &self.settings
    }

    /// Download `url` to `target` under `key` and wait for the outcome.
    ///
    /// If a transfer for `key` is already running this joins it instead of
    /// starting a second one; `url`, `target` and `token` are then ignored.
    pub async fn download(
        &self,
        key: &str,
        url: &str,
        target: impl Into<PathBuf>,
        token: Option<&str>,
    ) -> Result<DownloadTask, DownloadError> {
        let mut rx = self.begin(key, url, target.into(), token).await;
        let task = rx
            .wait_for(|t| t.status.is_terminal())
            .await
            .map(|t| t.clone())
            .map_err(|_| DownloadError::Cancelled)?;
        task.into_result()
    }

    /// Latest state of the most recent transfer for `key`.
    pub async fn status(&self, key: &str) -> Option<DownloadTask> {
        let tasks = self.tasks.read().await;
        tasks.get(key).map(|entry| entry.state.borrow().clone())
    }

    /// Follow progress of the most recent transfer for `key`.
    pub async fn subscribe(&self, key: &str) -> Option<watch::Receiver<DownloadTask>> {
        let tasks = self.tasks.read().await;
        tasks.get(key).map(|entry| entry.state.subscribe())
    }

    /// Cancel the active transfer for `key`. Returns `false` when nothing
    /// was running.
    pub async fn cancel(&self, key: &str) -> bool {
        let tasks = self.tasks.read().await;
        match tasks.get(key) {
            Some(entry) if !entry.state.borrow().status.is_terminal() => {
                tracing::info!(key, "Cancelling download");
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    async fn begin(
        &self,
        key: &str,
        url: &str,
        target: PathBuf,
        token: Option<&str>,
    ) -> watch::Receiver<DownloadTask> {
        let mut tasks = self.tasks.write().await;

        if let Some(entry) = tasks.get(key) {
            if entry.state.borrow().status == DownloadStatus::Downloading {
                tracing::info!(key, "Download already in progress, joining");
                return entry.state.subscribe();
            }
        }

        let task = DownloadTask::start(key, url, target);
        tracing::info!(
            key,
            url = %url,
            target = %task.target.display(),
            authenticated = token.is_some(),
            "Starting download",
        );

        let transfer = Transfer {
            client: self.client.clone(),
            idle_timeout: self.settings.idle_timeout,
            user_agent: self.settings.user_agent.clone(),
            key: key.to_string(),
            url: url.to_string(),
            token: token.map(str::to_string),
            target: task.target.clone(),
            temp: task.temp.clone(),
            state: Arc::new(watch::channel(task).0),
        };
        let cancel = CancellationToken::new();
        let rx = transfer.state.subscribe();
        tasks.insert(
            key.to_string(),
            TaskEntry {
                state: Arc::clone(&transfer.state),
                cancel: cancel.clone(),
            },
        );
        drop(tasks);

        tokio::spawn(transfer.run(cancel));
        rx
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

struct Transfer {
    client: reqwest::Client,
    idle_timeout: Duration,
    user_agent: String,
    key: String,
    url: String,
    token: Option<String>,
    target: PathBuf,
    temp: PathBuf,
    state: Arc<watch::Sender<DownloadTask>>,
}

impl Transfer {
    async fn run(self, cancel: CancellationToken) {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            result = self.fetch() => result,
        };

        match outcome {
            Ok(bytes) => {
                tracing::info!(key = %self.key, bytes, target = %self.target.display(), "Download complete");
                self.state.send_modify(|t| {
                    t.status = DownloadStatus::Completed;
                    t.percent = Some(100);
                    t.finished_at = Some(chrono::Utc::now());
                });
            }
            Err(e) => {
                remove_temp(&self.temp).await;
                tracing::warn!(key = %self.key, error = %e, "Download failed");
                self.state.send_modify(|t| {
                    t.status = DownloadStatus::Failed;
                    t.error = Some(e);
                    t.finished_at = Some(chrono::Utc::now());
                });
            }
        }
    }

    async fn fetch(&self) -> Result<u64, DownloadError> {
        if let Some(parent) = self.target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut response = self.get(&self.url, self.token.as_deref()).await?;
        if response.status().is_redirection() {
            let next = redirect_target(&response)?;
            remove_temp(&self.temp).await;
            tracing::debug!(key = %self.key, location = %next, "Following redirect");
            response = self.get(next.as_str(), None).await?;
            if response.status().is_redirection() {
                return Err(DownloadError::Redirect(format!(
                    "too many redirects for {}",
                    self.url
                )));
            }
        }
        check_status(response.status())?;

        let expected = response.content_length();
        self.state.send_modify(|t| t.expected_size = expected);

        let mut file = tokio::fs::File::create(&self.temp).await?;
        let mut stream = response.bytes_stream();
        let mut transferred = 0u64;

        loop {
            let chunk = match tokio::time::timeout(self.idle_timeout, stream.next()).await {
                Err(_) => return Err(DownloadError::Stalled(self.idle_timeout.as_secs())),
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => chunk,
                // With a known length, an early close is a short transfer
                // and is reported by the size check below.
                Ok(Some(Err(e))) if expected.is_some_and(|n| transferred < n) => {
                    tracing::debug!(key = %self.key, error = %e, "Stream ended early");
                    break;
                }
                Ok(Some(Err(e))) => return Err(e.into()),
            };

            file.write_all(&chunk).await?;
            transferred += chunk.len() as u64;
            let percent = percent_of(transferred, expected);
            self.state.send_modify(|t| {
                t.bytes_transferred = transferred;
                t.percent = percent;
            });
        }

        file.flush().await?;
        drop(file);

        if let Some(expected) = expected {
            if transferred != expected {
                return Err(DownloadError::SizeMismatch {
                    expected,
                    actual: transferred,
                });
            }
        }

        tokio::fs::rename(&self.temp, &self.target).await?;
        Ok(transferred)
    }

    async fn get(&self, url: &str, token: Option<&str>) -> Result<reqwest::Response, DownloadError> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, self.user_agent.as_str());
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        Ok(request.send().await?)
    }
}

// ---- private helpers ----

/// Resolve a redirect's `Location` against the URL that produced it.
fn redirect_target(response: &reqwest::Response) -> Result<Url, DownloadError> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            DownloadError::Redirect(format!(
                "HTTP {} without a Location header",
                response.status().as_u16()
            ))
        })?;
    response
        .url()
        .join(location)
        .map_err(|e| DownloadError::Redirect(format!("invalid Location '{location}': {e}")))
}

fn check_status(status: StatusCode) -> Result<(), DownloadError> {
    match status {
        StatusCode::UNAUTHORIZED => Err(DownloadError::AuthRequired),
        StatusCode::FORBIDDEN => Err(DownloadError::Forbidden),
        s if s.is_success() => Ok(()),
        s => Err(DownloadError::Http {
            status: s.as_u16(),
            reason: s.canonical_reason().unwrap_or("Unknown").to_string(),
        }),
    }
}

async fn remove_temp(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
    }
}
