//! Backend for the locally supervised ComfyUI engine.

use std::sync::Arc;

use async_trait::async_trait;
use atelier_comfyui::client::ComfyUIClient;
use atelier_comfyui::probe::{HistoryProbe, WebSocketPush};
use atelier_comfyui::supervisor::{EngineState, EngineSupervisor};
use atelier_core::monitor::{CompletionProbe, PushChannel};
use atelier_core::types::BackendKind;

use crate::backend::Backend;
use crate::error::DispatchError;
use crate::request::JobRequest;

/// Submits workflow graphs to `POST /prompt` and watches them over both
/// `/history` and the WebSocket.
///
/// Prompts are submitted with the same client id the push channel
/// connects with, otherwise the engine sends their events elsewhere.
pub struct LocalBackend {
    supervisor: EngineSupervisor,
    client_id: String,
    probe: Arc<HistoryProbe>,
    push: Arc<WebSocketPush>,
}

impl LocalBackend {
    pub fn new(supervisor: EngineSupervisor, ws_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        let probe = Arc::new(HistoryProbe::new(supervisor.api().clone()));
        let push = Arc::new(WebSocketPush::new(ComfyUIClient::new(ws_url, client_id.clone())));
        Self {
            supervisor,
            client_id,
            probe,
            push,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalProcess
    }

    async fn submit(&self, request: &JobRequest) -> Result<String, DispatchError> {
        let state = self.supervisor.state();
        if state != EngineState::Running {
            return Err(DispatchError::EngineNotRunning(state));
        }

        let response = self
            .supervisor
            .api()
            .submit_workflow(&request.payload, &self.client_id)
            .await?;

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            client_id = %self.client_id,
            "Workflow queued on local engine",
        );
        Ok(response.prompt_id)
    }

    fn probe(&self) -> Arc<dyn CompletionProbe> {
        self.probe.clone()
    }

    fn push_channel(&self) -> Option<Arc<dyn PushChannel>> {
        Some(self.push.clone())
    }

    /// Removes the prompt from the engine queue. A prompt that is already
    /// executing runs to completion; its result is discarded.
    async fn cancel(&self, prompt_id: &str) -> Result<(), DispatchError> {
        self.supervisor.api().cancel_execution(prompt_id).await?;
        Ok(())
    }
}
