//! Backend configuration snapshots.
//!
//! [`BackendConfig`] is immutable once built. [`ConfigStore`] hands out
//! `Arc` snapshots and replaces them wholesale, so a dispatch that
//! already read a snapshot never observes a half-applied change.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::CoreError;

/// Default engine listen host.
pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
/// Default engine HTTP/WebSocket port.
pub const DEFAULT_ENGINE_PORT: u16 = 8188;
/// Default interpreter used to launch the engine entry point.
pub const DEFAULT_ENGINE_PYTHON: &str = "python3";
/// Address of the containerized fallback service.
pub const DEFAULT_REMOTE_SERVICE_URL: &str = "http://localhost:8001";
/// Base URL of the serverless queueing API.
pub const DEFAULT_SERVERLESS_BASE_URL: &str = "https://api.runpod.ai/v2";

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Weight precision of the diffusion / text-encoder models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelPrecision {
    #[default]
    Fp8,
    Fp16,
}

impl ModelPrecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fp8 => "fp8",
            Self::Fp16 => "fp16",
        }
    }
}

impl FromStr for ModelPrecision {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp8" => Ok(Self::Fp8),
            "fp16" => Ok(Self::Fp16),
            other => Err(CoreError::Configuration(format!(
                "Unknown model precision: '{other}'. Valid values: fp8, fp16"
            ))),
        }
    }
}

/// The backend the user explicitly selected.
///
/// `Local` means "no explicit remote choice": the dispatcher then falls
/// through local engine -> containerized service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredBackend {
    #[default]
    Local,
    Serverless,
}

impl FromStr for PreferredBackend {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "serverless" | "runpod" => Ok(Self::Serverless),
            other => Err(CoreError::Configuration(format!(
                "Unknown generation backend: '{other}'. Valid values: local, serverless"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Local engine installation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root of the engine installation (contains `main.py`).
    pub install_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Interpreter used to run the entry point.
    pub python: String,
    /// Start the engine on demand when a submission needs it.
    pub autostart: bool,
}

impl EngineConfig {
    pub fn new(install_path: impl Into<PathBuf>) -> Self {
        Self {
            install_path: install_path.into(),
            host: DEFAULT_ENGINE_HOST.to_string(),
            port: DEFAULT_ENGINE_PORT,
            python: DEFAULT_ENGINE_PYTHON.to_string(),
            autostart: true,
        }
    }

    /// HTTP base URL, e.g. `http://127.0.0.1:8188`.
    ///
    /// A wildcard listen address is probed through loopback.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.probe_host(), self.port)
    }

    /// WebSocket base URL, e.g. `ws://127.0.0.1:8188`.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.probe_host(), self.port)
    }

    fn probe_host(&self) -> &str {
        if self.host == "0.0.0.0" {
            "127.0.0.1"
        } else {
            &self.host
        }
    }
}

/// Serverless API credentials and endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerlessConfig {
    pub api_key: Option<String>,
    pub endpoint_id: Option<String>,
    pub base_url: String,
}

impl Default for ServerlessConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint_id: None,
            base_url: DEFAULT_SERVERLESS_BASE_URL.to_string(),
        }
    }
}

impl ServerlessConfig {
    /// True when both the API key and the endpoint id are present.
    pub fn is_configured(&self) -> bool {
        self.credentials().is_ok()
    }

    /// Return `(api_key, endpoint_id)` or a configuration error naming
    /// the missing piece.
    pub fn credentials(&self) -> Result<(&str, &str), CoreError> {
        let key = self
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| CoreError::Configuration("Serverless API key not configured".into()))?;
        let endpoint = self
            .endpoint_id
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                CoreError::Configuration("Serverless endpoint id not configured".into())
            })?;
        Ok((key, endpoint))
    }
}

impl fmt::Debug for ServerlessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerlessConfig")
            .field("api_key", &self.api_key.as_deref().map(token_hint))
            .field("endpoint_id", &self.endpoint_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BackendConfig
// ---------------------------------------------------------------------------

/// Immutable routing configuration consumed by the dispatcher.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// `None` when no local installation is configured.
    pub engine: Option<EngineConfig>,
    pub remote_service_url: String,
    pub serverless: ServerlessConfig,
    pub preferred: PreferredBackend,
    pub model_precision: ModelPrecision,
    /// Credential for gated model downloads.
    pub huggingface_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            engine: None,
            remote_service_url: DEFAULT_REMOTE_SERVICE_URL.to_string(),
            serverless: ServerlessConfig::default(),
            preferred: PreferredBackend::Local,
            model_precision: ModelPrecision::Fp8,
            huggingface_token: None,
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("engine", &self.engine)
            .field("remote_service_url", &self.remote_service_url)
            .field("serverless", &self.serverless)
            .field("preferred", &self.preferred)
            .field("model_precision", &self.model_precision)
            .field(
                "huggingface_token",
                &self.huggingface_token.as_deref().map(token_hint),
            )
            .finish()
    }
}

impl BackendConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                      |
    /// |--------------------------|------------------------------|
    /// | `ENGINE_INSTALL_PATH`    | unset (no local engine)      |
    /// | `ENGINE_HOST`            | `127.0.0.1`                  |
    /// | `ENGINE_PORT`            | `8188`                       |
    /// | `ENGINE_PYTHON`          | `python3`                    |
    /// | `ENGINE_AUTOSTART`       | `true`                       |
    /// | `REMOTE_SERVICE_URL`     | `http://localhost:8001`      |
    /// | `GENERATION_BACKEND`     | `local`                      |
    /// | `SERVERLESS_API_KEY`     | unset                        |
    /// | `SERVERLESS_ENDPOINT_ID` | unset                        |
    /// | `SERVERLESS_BASE_URL`    | `https://api.runpod.ai/v2`   |
    /// | `MODEL_PRECISION`        | `fp8`                        |
    /// | `HF_TOKEN`               | unset                        |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let engine = match get("ENGINE_INSTALL_PATH") {
            Some(path) => {
                let mut engine = EngineConfig::new(path);
                if let Some(host) = get("ENGINE_HOST") {
                    engine.host = host;
                }
                if let Some(port) = get("ENGINE_PORT") {
                    engine.port = port.parse().map_err(|_| {
                        CoreError::Configuration(format!("ENGINE_PORT must be a valid u16, got '{port}'"))
                    })?;
                }
                if let Some(python) = get("ENGINE_PYTHON") {
                    engine.python = python;
                }
                if let Some(autostart) = get("ENGINE_AUTOSTART") {
                    engine.autostart = parse_bool("ENGINE_AUTOSTART", &autostart)?;
                }
                Some(engine)
            }
            None => None,
        };

        let preferred = get("GENERATION_BACKEND")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default();
        let model_precision = get("MODEL_PRECISION")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default();

        let remote_service_url = get("REMOTE_SERVICE_URL")
            .unwrap_or_else(|| DEFAULT_REMOTE_SERVICE_URL.to_string());
        validate_http_url("REMOTE_SERVICE_URL", &remote_service_url)?;

        let serverless = ServerlessConfig {
            api_key: get("SERVERLESS_API_KEY"),
            endpoint_id: get("SERVERLESS_ENDPOINT_ID"),
            base_url: get("SERVERLESS_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SERVERLESS_BASE_URL.to_string()),
        };
        validate_http_url("SERVERLESS_BASE_URL", &serverless.base_url)?;

        Ok(Self {
            engine,
            remote_service_url: remote_service_url.trim_end_matches('/').to_string(),
            serverless: ServerlessConfig {
                base_url: serverless.base_url.trim_end_matches('/').to_string(),
                ..serverless
            },
            preferred,
            model_precision,
            huggingface_token: get("HF_TOKEN"),
        })
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, CoreError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CoreError::Configuration(format!(
            "{name} must be a boolean, got '{value}'"
        ))),
    }
}

/// Validate that a URL is non-empty and starts with `http`.
pub fn validate_http_url(name: &str, url: &str) -> Result<(), CoreError> {
    let trimmed = url.trim();
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(CoreError::Configuration(format!(
            "{name} must start with http:// or https://, got: '{trimmed}'"
        )));
    }
    Ok(())
}

/// Show only the last 4 characters of a secret.
///
/// Returns `"...XXXX"` if the token is long enough, or `"****"` if too short.
pub fn token_hint(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() >= 4 {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("...{tail}")
    } else {
        "****".to_string()
    }
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

/// Holder of the current configuration snapshot.
///
/// Cheap to clone; all clones observe the same replacements.
#[derive(Clone)]
pub struct ConfigStore {
    tx: Arc<watch::Sender<Arc<BackendConfig>>>,
}

impl ConfigStore {
    pub fn new(config: BackendConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// The current snapshot. Later replacements do not affect it.
    pub fn snapshot(&self) -> Arc<BackendConfig> {
        self.tx.borrow().clone()
    }

    /// Publish a new snapshot.
    pub fn replace(&self, config: BackendConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Derive a new snapshot from the current one and publish it.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&BackendConfig) -> BackendConfig,
    {
        let next = f(&self.snapshot());
        self.replace(next);
    }

    /// Receive every future replacement.
    pub fn subscribe(&self) -> watch::Receiver<Arc<BackendConfig>> {
        self.tx.subscribe()
    }
}
