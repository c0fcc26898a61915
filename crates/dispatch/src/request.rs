use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Route used on the containerized service when none is given.
pub const DEFAULT_SERVICE_ROUTE: &str = "generate/text-to-image";

/// A unit of work as handed to [`Dispatcher::submit`](crate::dispatcher::Dispatcher::submit).
///
/// `payload` is opaque here: a workflow graph for the local engine, the
/// `input` object for the serverless API, or the request body for the
/// containerized service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub payload: Value,
    /// Path on the containerized service, e.g. `edit/image`.
    #[serde(default = "default_route")]
    pub route: String,
    /// Overrides the dispatcher's job timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_route() -> String {
    DEFAULT_SERVICE_ROUTE.to_string()
}

impl JobRequest {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            route: default_route(),
            timeout_secs: None,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
