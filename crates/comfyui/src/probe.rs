//! Job-monitor adapters for locally executed prompts.
//!
//! [`HistoryProbe`] answers "is it done?" from `/history`, and
//! [`WebSocketPush`] turns the engine's WebSocket events into
//! [`PushSignal`]s. The monitor races the two.

use async_trait::async_trait;
use atelier_core::job::JobFailure;
use atelier_core::monitor::{
    CompletionProbe, ProbeError, ProbeStatus, PushChannel, PushError, PushSignal,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;
use crate::client::{ComfyUIClient, ComfyUIStream};
use crate::messages::{parse_message, ComfyUIMessage};
use crate::reconnect::{reconnect_loop, ReconnectConfig};

// ---------------------------------------------------------------------------
// HistoryProbe
// ---------------------------------------------------------------------------

/// Completion probe backed by `GET /history/{id}` and `GET /view`.
#[derive(Debug, Clone)]
pub struct HistoryProbe {
    api: ComfyUIApi,
}

impl HistoryProbe {
    pub fn new(api: ComfyUIApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl CompletionProbe for HistoryProbe {
    async fn check(&self, prompt_id: &str) -> Result<ProbeStatus, ProbeError> {
        let history = self
            .api
            .get_history(prompt_id)
            .await
            .map_err(|e| ProbeError(e.to_string()))?;

        let Some(history) = history else {
            return Ok(ProbeStatus::Pending { progress: None });
        };

        if history.is_error() {
            let message = history
                .error_message()
                .unwrap_or_else(|| "ComfyUI execution failed".to_string());
            return Ok(ProbeStatus::Failed(JobFailure::backend(message)));
        }

        match history.first_output() {
            Some(file) => {
                let artifact = self
                    .api
                    .view(file)
                    .await
                    .map_err(|e| ProbeError(format!("fetching {}: {e}", file.filename)))?;
                Ok(ProbeStatus::Completed(artifact))
            }
            None if history.status.as_ref().is_some_and(|s| s.completed) => Ok(
                ProbeStatus::Failed(JobFailure::backend("Prompt finished without an output file")),
            ),
            // Outputs are written progressively; keep waiting.
            None => Ok(ProbeStatus::Pending { progress: None }),
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocketPush
// ---------------------------------------------------------------------------

/// Push channel over the ComfyUI WebSocket.
///
/// The client id must be the one the prompt was submitted with, or the
/// engine will not route execution events to this socket.
#[derive(Debug, Clone)]
pub struct WebSocketPush {
    client: ComfyUIClient,
    reconnect: ReconnectConfig,
}

impl WebSocketPush {
    pub fn new(client: ComfyUIClient) -> Self {
        Self {
            client,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[async_trait]
impl PushChannel for WebSocketPush {
    async fn run(
        &self,
        prompt_id: &str,
        signals: mpsc::Sender<PushSignal>,
        cancel: CancellationToken,
    ) -> Result<(), PushError> {
        loop {
            let Some(conn) = reconnect_loop(&self.client, &self.reconnect, &cancel).await else {
                return Ok(());
            };
            let mut ws = conn.ws_stream;

            match pump(&mut ws, prompt_id, &signals, &cancel).await {
                Pump::Done => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                Pump::Disconnected => {
                    tracing::debug!(
                        prompt_id = %prompt_id,
                        client_id = %self.client.client_id(),
                        "ComfyUI WebSocket dropped, reconnecting",
                    );
                }
            }
        }
    }
}

/// How a connection's message loop ended.
enum Pump {
    /// Cancelled, terminal signal sent, or nobody listening.
    Done,
    Disconnected,
}

async fn pump(
    ws: &mut ComfyUIStream,
    prompt_id: &str,
    signals: &mpsc::Sender<PushSignal>,
    cancel: &CancellationToken,
) -> Pump {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Pump::Done,
            frame = ws.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let Some(signal) = translate(&text, prompt_id) else {
                    continue;
                };
                let terminal = matches!(signal, PushSignal::Finished | PushSignal::Failed(_));
                if signals.send(signal).await.is_err() || terminal {
                    return Pump::Done;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(?frame, "ComfyUI WebSocket closed by server");
                return Pump::Disconnected;
            }
            // Binary frames are preview images.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(prompt_id = %prompt_id, error = %e, "WebSocket receive error");
                return Pump::Disconnected;
            }
            None => return Pump::Disconnected,
        }
    }
}

/// Map one text frame to a signal for `prompt_id`, ignoring other prompts.
pub fn translate(text: &str, prompt_id: &str) -> Option<PushSignal> {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::trace!(error = %e, "Skipping unrecognized ComfyUI message");
            return None;
        }
    };

    // Progress frames from older engines carry no prompt id; there is
    // only one prompt executing at a time so they are attributed to ours.
    if let ComfyUIMessage::Progress(p) = &msg {
        return match p.prompt_id.as_deref() {
            None => Some(PushSignal::Progress(p.percent())),
            Some(id) if id == prompt_id => Some(PushSignal::Progress(p.percent())),
            Some(_) => None,
        };
    }

    if msg.prompt_id() != Some(prompt_id) {
        return None;
    }

    match msg {
        ComfyUIMessage::ExecutionStart(_) => Some(PushSignal::Started),
        ComfyUIMessage::Executing(data) if data.node.is_none() => Some(PushSignal::Finished),
        ComfyUIMessage::ExecutionSuccess(_) => Some(PushSignal::Finished),
        ComfyUIMessage::ExecutionError(data) => {
            let message = data.exception_message.trim();
            Some(PushSignal::Failed(if message.is_empty() {
                format!("ComfyUI execution failed ({})", data.exception_type)
            } else {
                message.to_string()
            }))
        }
        ComfyUIMessage::ExecutionInterrupted(_) => {
            Some(PushSignal::Failed("Execution interrupted".to_string()))
        }
        _ => None,
    }
}
