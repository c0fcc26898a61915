//! Progress reporting over `tokio::sync::watch`.
//!
//! Long operations (engine startup, downloads) publish their latest
//! progress instead of invoking callbacks. Late subscribers see the most
//! recent value immediately; intermediate values may be skipped.

use serde::Serialize;
use tokio::sync::watch;

/// A percent (0-100) paired with a human-readable message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

impl Progress {
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

/// Publisher side of a progress channel.
///
/// Percent never moves backwards within one reporter's lifetime; a lower
/// value only updates the message. Call [`reset`](Self::reset) to start
/// a new run.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<Progress>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Progress::default());
        Self { tx }
    }

    pub fn report(&self, percent: u8, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|current| {
            current.percent = current.percent.max(percent.min(100));
            current.message = message;
        });
    }

    pub fn reset(&self, message: impl Into<String>) {
        self.tx.send_replace(Progress::new(0, message));
    }

    pub fn current(&self) -> Progress {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }
}

/// Integer percent of `done` out of `total`.
///
/// Returns `None` when the total is unknown or zero. Capped at 100.
pub fn percent_of(done: u64, total: Option<u64>) -> Option<u8> {
    match total {
        Some(t) if t > 0 => {
            let pct = done.saturating_mul(100) / t;
            Some(pct.min(100) as u8)
        }
        _ => None,
    }
}
