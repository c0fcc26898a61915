//! Job lifecycle notifications fanned out over a `tokio::sync::broadcast`
//! channel.

use atelier_core::error::ErrorKind;
use atelier_core::monitor::CompletionSource;
use atelier_core::types::{BackendKind, JobId};
use serde::Serialize;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// DispatchEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// The backend accepted the job and returned its correlation handle.
    Submitted {
        job_id: JobId,
        backend: BackendKind,
        handle: String,
    },
    Completed {
        job_id: JobId,
        backend: BackendKind,
        source: CompletionSource,
    },
    Failed {
        job_id: JobId,
        backend: BackendKind,
        kind: ErrorKind,
        message: String,
    },
    TimedOut {
        job_id: JobId,
        backend: BackendKind,
    },
}

impl DispatchEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Submitted { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::TimedOut { job_id, .. } => job_id,
        }
    }

    /// True for every event except `Submitted`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Submitted { .. })
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

pub const DEFAULT_CAPACITY: usize = 256;

/// Slow receivers observe `RecvError::Lagged` once the buffer is full.
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: DispatchEvent) {
        // Only fails when nobody is subscribed.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
