//! Backend for the serverless queueing API.

use std::sync::Arc;

use async_trait::async_trait;
use atelier_core::config::ServerlessConfig;
use atelier_core::monitor::CompletionProbe;
use atelier_core::types::BackendKind;
use atelier_serverless::client::ServerlessClient;
use atelier_serverless::probe::ServerlessProbe;
use serde_json::Value;

use crate::backend::Backend;
use crate::error::DispatchError;
use crate::request::JobRequest;

pub struct ServerlessBackend {
    client: ServerlessClient,
    probe: Arc<ServerlessProbe>,
    /// Added to the input so workers can fetch gated weights.
    hf_token: Option<String>,
}

impl ServerlessBackend {
    pub fn new(client: ServerlessClient, hf_token: Option<String>) -> Self {
        let probe = Arc::new(ServerlessProbe::new(client.clone()));
        Self {
            client,
            probe,
            hf_token,
        }
    }

    /// Fails with a configuration error when credentials are missing.
    pub fn from_config(
        config: &ServerlessConfig,
        hf_token: Option<String>,
    ) -> Result<Self, DispatchError> {
        Ok(Self::new(ServerlessClient::from_config(config)?, hf_token))
    }

    pub fn client(&self) -> &ServerlessClient {
        &self.client
    }

    fn input_for(&self, payload: &Value) -> Result<Value, DispatchError> {
        let Value::Object(map) = payload else {
            return Err(DispatchError::Core(atelier_core::error::CoreError::Validation(
                "serverless payload must be a JSON object".to_string(),
            )));
        };
        let mut input = map.clone();
        if let Some(token) = &self.hf_token {
            input
                .entry("hf_token")
                .or_insert_with(|| Value::String(token.clone()));
        }
        Ok(Value::Object(input))
    }
}

#[async_trait]
impl Backend for ServerlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Serverless
    }

    async fn submit(&self, request: &JobRequest) -> Result<String, DispatchError> {
        let input = self.input_for(&request.payload)?;
        Ok(self.client.run(input).await?)
    }

    fn probe(&self) -> Arc<dyn CompletionProbe> {
        self.probe.clone()
    }

    async fn cancel(&self, handle: &str) -> Result<(), DispatchError> {
        self.client.cancel(handle).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend(token: Option<&str>) -> ServerlessBackend {
        ServerlessBackend::new(
            ServerlessClient::new("http://127.0.0.1:9", "ep", "key"),
            token.map(str::to_string),
        )
    }

    #[test]
    fn token_is_added_when_absent() {
        let input = backend(Some("hf_abc")).input_for(&json!({"workflow": {}})).unwrap();
        assert_eq!(input, json!({"workflow": {}, "hf_token": "hf_abc"}));
    }

    #[test]
    fn explicit_token_wins() {
        let input = backend(Some("hf_abc"))
            .input_for(&json!({"hf_token": "hf_mine"}))
            .unwrap();
        assert_eq!(input["hf_token"], "hf_mine");
    }

    #[test]
    fn no_token_configured() {
        let input = backend(None).input_for(&json!({"audio": "..."})).unwrap();
        assert!(input.get("hf_token").is_none());
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert!(backend(None).input_for(&json!([1, 2])).is_err());
    }
}
