//! Command-line front end for the dispatcher, the engine supervisor and
//! the model catalog.
//!
//! ```text
//! atelier-worker start-engine
//! atelier-worker models
//! atelier-worker download <model_key | required>
//! atelier-worker run <request.json> <output_path>
//! ```
//!
//! Configuration comes from the environment (a `.env` file is honoured);
//! see `BackendConfig::from_env` for the variables. `RUST_LOG` overrides
//! the default log filter.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use atelier_core::config::{BackendConfig, ConfigStore};
use atelier_core::layout::ModelLayout;
use atelier_dispatch::dispatcher::Dispatcher;
use atelier_dispatch::request::JobRequest;
use atelier_models::catalog::{self, Ensured};
use atelier_models::downloader::DownloadManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: atelier-worker <start-engine | models | download <model_key|required> | run <request.json> <output_path>>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "atelier_worker=info,atelier_dispatch=info,atelier_comfyui=info,atelier_models=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BackendConfig::from_env().context("Invalid configuration")?;
    tracing::debug!(config = ?config, "Loaded configuration");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["start-engine"] => start_engine(config).await,
        ["models"] => models(&config).await,
        ["download", key] => download(&config, key).await,
        ["run", request, output] => run(config, Path::new(request), Path::new(output)).await,
        _ => bail!(USAGE),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn start_engine(config: BackendConfig) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(ConfigStore::new(config));
    let Some(supervisor) = dispatcher.engine().await else {
        bail!("ENGINE_INSTALL_PATH is not set");
    };

    let mut progress = supervisor.subscribe_progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = progress.borrow_and_update().clone();
            tracing::info!(percent = p.percent, "{}", p.message);
        }
    });

    supervisor.start().await.context("Engine failed to start")?;
    tracing::info!(base_url = %supervisor.settings().base_url, "Engine running; waiting for shutdown signal");

    shutdown_signal().await;

    dispatcher.shutdown().await.context("Engine did not stop cleanly")?;
    reporter.abort();
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

async fn models(config: &BackendConfig) -> anyhow::Result<()> {
    let layout = layout(config)?;
    let manager = DownloadManager::new()?;
    let status = catalog::models_status(&layout, &manager).await;
    let required: Vec<&str> = catalog::required_for(config.model_precision)
        .into_iter()
        .map(|spec| spec.key)
        .collect();

    let out = serde_json::json!({
        "precision": config.model_precision.as_str(),
        "required": required,
        "models": status,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn download(config: &BackendConfig, key: &str) -> anyhow::Result<()> {
    let layout = layout(config)?;
    layout
        .ensure_dirs()
        .with_context(|| format!("Creating model directories under {}", layout.models_dir().display()))?;
    let manager = DownloadManager::new()?;
    let token = config.huggingface_token.as_deref();

    let specs = if key == "required" {
        catalog::required_for(config.model_precision)
    } else {
        match catalog::find(key) {
            Some(spec) => vec![spec],
            None => bail!("Unknown model '{key}'"),
        }
    };

    for spec in specs {
        tracing::info!(key = spec.key, size = spec.size_label, "Ensuring model");
        let result = catalog::ensure_spec(spec, &layout, &manager, token)
            .await
            .with_context(|| format!("Downloading {}", spec.name))?;
        match result {
            Ensured::AlreadyPresent(path) => {
                tracing::info!(key = spec.key, path = %path.display(), "Already present")
            }
            Ensured::Downloaded { path, bytes } => {
                tracing::info!(key = spec.key, path = %path.display(), bytes, "Downloaded")
            }
        }
    }
    Ok(())
}

async fn run(config: BackendConfig, request: &Path, output: &Path) -> anyhow::Result<()> {
    let body = tokio::fs::read(request)
        .await
        .with_context(|| format!("Reading {}", request.display()))?;
    let request: JobRequest = serde_json::from_slice(&body).context("Parsing job request")?;

    let dispatcher = Dispatcher::new(ConfigStore::new(config));
    let job_id = dispatcher.submit(request).await?;
    tracing::info!(job_id = %job_id, "Waiting for result");

    let result = dispatcher.await_result(&job_id).await;
    dispatcher.shutdown().await?;
    let artifact = result?;

    let target = output_path(output, &artifact.filename);
    tokio::fs::write(&target, &*artifact.data)
        .await
        .with_context(|| format!("Writing {}", target.display()))?;
    tracing::info!(
        job_id = %job_id,
        path = %target.display(),
        bytes = artifact.len(),
        "Result written",
    );
    Ok(())
}

// ---- private helpers ----

fn layout(config: &BackendConfig) -> anyhow::Result<ModelLayout> {
    match &config.engine {
        Some(engine) => Ok(ModelLayout::new(&engine.install_path)),
        None => bail!("ENGINE_INSTALL_PATH is not set"),
    }
}

/// An existing directory receives the artifact under its own filename.
fn output_path(output: &Path, filename: &str) -> PathBuf {
    if output.is_dir() {
        output.join(filename)
    } else {
        output.to_path_buf()
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
