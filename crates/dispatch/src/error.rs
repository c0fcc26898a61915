use atelier_comfyui::api::ComfyUIApiError;
use atelier_comfyui::supervisor::{EngineState, SupervisorError};
use atelier_core::error::{CoreError, ErrorKind};
use atelier_core::job::JobFailure;
use atelier_serverless::client::ServerlessError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Starting the local engine failed.
    #[error(transparent)]
    Engine(#[from] SupervisorError),

    #[error("Local engine is not running (state: {})", .0.as_str())]
    EngineNotRunning(EngineState),

    #[error("Local engine request failed: {0}")]
    EngineApi(#[from] ComfyUIApiError),

    #[error(transparent)]
    Serverless(#[from] ServerlessError),

    #[error("Remote service error: {0}")]
    RemoteService(String),

    /// The dispatcher has no job with this id.
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job {0} has not finished yet")]
    NotReady(String),

    /// The job reached a terminal failure. Displays the backend's message
    /// unchanged.
    #[error("{}", .0.message)]
    Job(JobFailure),

    #[error("Dispatcher is shut down")]
    ShutDown,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Core(e) => e.kind(),
            Self::Engine(e) => e.kind(),
            Self::EngineNotRunning(_) => ErrorKind::ProcessSpawn,
            Self::EngineApi(e) => e.kind(),
            Self::Serverless(e) => e.kind(),
            Self::RemoteService(_) => ErrorKind::JobBackend,
            Self::UnknownJob(_) => ErrorKind::JobNotFound,
            Self::Job(failure) => failure.error_kind(),
            Self::NotReady(_) | Self::ShutDown => ErrorKind::Internal,
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        Self::RemoteService(e.to_string())
    }
}
