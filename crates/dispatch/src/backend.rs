//! The seam between the dispatcher and a concrete execution backend.

use std::sync::Arc;

use async_trait::async_trait;
use atelier_core::monitor::{CompletionProbe, PushChannel};
use atelier_core::types::BackendKind;

use crate::error::DispatchError;
use crate::request::JobRequest;

/// One way of executing jobs.
///
/// `submit` returns the backend's correlation handle; the dispatcher
/// passes it to the probe and push channel when monitoring.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn submit(&self, request: &JobRequest) -> Result<String, DispatchError>;

    fn probe(&self) -> Arc<dyn CompletionProbe>;

    /// Event source for backends that push completion. Polling-only
    /// backends return `None`.
    fn push_channel(&self) -> Option<Arc<dyn PushChannel>> {
        None
    }

    /// Best-effort cancellation of a submitted job.
    async fn cancel(&self, handle: &str) -> Result<(), DispatchError>;
}
