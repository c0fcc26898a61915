use std::fmt;

use serde::Serialize;

/// Distinguishing kind carried by every failure surfaced to callers.
///
/// Component errors (`SupervisorError`, `DownloadError`, `DispatchError`,
/// ...) stay separate types but all map onto this taxonomy via their
/// `kind()` method, so callers can branch on the remediation path
/// without matching on crate-specific variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A required path, credential or endpoint is missing or malformed.
    Configuration,
    /// Required engine files or directories are absent.
    InstallationInvalid,
    /// The engine process could not be spawned or exited unexpectedly.
    ProcessSpawn,
    /// The engine printed output classified as fatal.
    ProcessFatalOutput,
    /// The engine did not start or stop within its time budget.
    ProcessTimeout,
    /// The artifact source requires a credential.
    DownloadAuthRequired,
    /// The credential was rejected or the license was not accepted.
    DownloadForbidden,
    /// The transfer ended with a byte count different from content-length.
    DownloadSizeMismatch,
    /// Network or filesystem failure during a transfer.
    DownloadTransport,
    /// A job did not reach a terminal state before its deadline.
    JobTimeout,
    /// The backend reported the job as failed.
    JobBackend,
    /// The backend does not know the correlation handle (expired/unknown).
    JobNotFound,
    /// Anything not covered above.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration_error",
            Self::InstallationInvalid => "installation_invalid",
            Self::ProcessSpawn => "process_spawn_error",
            Self::ProcessFatalOutput => "process_fatal_output",
            Self::ProcessTimeout => "process_timeout",
            Self::DownloadAuthRequired => "download_auth_required",
            Self::DownloadForbidden => "download_forbidden",
            Self::DownloadSizeMismatch => "download_size_mismatch",
            Self::DownloadTransport => "download_transport_error",
            Self::JobTimeout => "job_timeout",
            Self::JobBackend => "job_backend_error",
            Self::JobNotFound => "job_not_found",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Installation invalid: {0}")]
    InstallationInvalid(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Validation(_) => ErrorKind::Configuration,
            Self::InstallationInvalid(_) => ErrorKind::InstallationInvalid,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
