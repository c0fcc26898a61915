//! Fixed catalog of the weights the image-editing workflows load.

use std::path::PathBuf;

use atelier_core::config::ModelPrecision;
use atelier_core::error::ErrorKind;
use atelier_core::layout::{ArtifactCategory, ModelLayout};
use serde::Serialize;

use crate::downloader::{DownloadError, DownloadManager, DownloadStatus};

/// One downloadable model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    pub key: &'static str,
    pub name: &'static str,
    pub filename: &'static str,
    /// Approximate size shown to users; the real size comes from the
    /// response's content-length.
    pub size_label: &'static str,
    pub url: &'static str,
    /// Gated on HuggingFace; the token is only sent for these.
    pub requires_auth: bool,
    pub category: ArtifactCategory,
}

pub const CATALOG: &[ModelSpec] = &[
    ModelSpec {
        key: "flux_kontext",
        name: "FLUX.1 Kontext Dev",
        filename: "flux1-kontext-dev.safetensors",
        size_label: "23.8GB",
        url: "https://huggingface.co/black-forest-labs/FLUX.1-Kontext-dev/resolve/main/flux1-kontext-dev.safetensors",
        requires_auth: true,
        category: ArtifactCategory::Unet,
    },
    ModelSpec {
        key: "flux_kontext_fp8",
        name: "FLUX.1 Kontext Dev (FP8)",
        filename: "flux1-dev-kontext_fp8_scaled.safetensors",
        size_label: "11.9GB",
        url: "https://huggingface.co/Comfy-Org/flux1-kontext-dev_ComfyUI/resolve/main/split_files/diffusion_models/flux1-dev-kontext_fp8_scaled.safetensors",
        requires_auth: false,
        category: ArtifactCategory::Unet,
    },
    ModelSpec {
        key: "clip_l",
        name: "CLIP-L Text Encoder",
        filename: "clip_l.safetensors",
        size_label: "246MB",
        url: "https://huggingface.co/comfyanonymous/flux_text_encoders/resolve/main/clip_l.safetensors",
        requires_auth: false,
        category: ArtifactCategory::Clip,
    },
    ModelSpec {
        key: "t5xxl_fp8",
        name: "T5-XXL Text Encoder (FP8)",
        filename: "t5xxl_fp8_e4m3fn_scaled.safetensors",
        size_label: "5.16GB",
        url: "https://huggingface.co/comfyanonymous/flux_text_encoders/resolve/main/t5xxl_fp8_e4m3fn_scaled.safetensors",
        requires_auth: false,
        category: ArtifactCategory::Clip,
    },
    ModelSpec {
        key: "t5xxl_fp16",
        name: "T5-XXL Text Encoder (FP16)",
        filename: "t5xxl_fp16.safetensors",
        size_label: "9.8GB",
        url: "https://huggingface.co/comfyanonymous/flux_text_encoders/resolve/main/t5xxl_fp16.safetensors",
        requires_auth: false,
        category: ArtifactCategory::Clip,
    },
    ModelSpec {
        key: "ae",
        name: "FLUX VAE",
        filename: "ae.safetensors",
        size_label: "335MB",
        url: "https://huggingface.co/black-forest-labs/FLUX.1-Kontext-dev/resolve/main/ae.safetensors",
        requires_auth: true,
        category: ArtifactCategory::Vae,
    },
];

const FP8_SET: &[&str] = &["flux_kontext_fp8", "clip_l", "t5xxl_fp8", "ae"];
const FP16_SET: &[&str] = &["flux_kontext", "clip_l", "t5xxl_fp16", "ae"];

pub fn find(key: &str) -> Option<&'static ModelSpec> {
    CATALOG.iter().find(|m| m.key == key)
}

/// Models a workflow at `precision` needs on disk.
pub fn required_for(precision: ModelPrecision) -> Vec<&'static ModelSpec> {
    let keys = match precision {
        ModelPrecision::Fp8 => FP8_SET,
        ModelPrecision::Fp16 => FP16_SET,
    };
    keys.iter().filter_map(|k| find(k)).collect()
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Availability of one catalog entry, merged with any download state.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    #[serde(flatten)]
    pub spec: ModelSpec,
    pub available: bool,
    pub path: Option<PathBuf>,
    pub download: DownloadStatus,
    pub progress: Option<u8>,
    pub error: Option<String>,
}

pub async fn models_status(layout: &ModelLayout, manager: &DownloadManager) -> Vec<ModelStatus> {
    let mut out = Vec::with_capacity(CATALOG.len());
    for spec in CATALOG {
        let path = layout.find_existing(spec.category, spec.filename);
        let task = manager.status(spec.key).await;
        out.push(ModelStatus {
            spec: *spec,
            available: path.is_some(),
            path,
            download: task.as_ref().map_or(DownloadStatus::Idle, |t| t.status),
            progress: task.as_ref().and_then(|t| t.percent),
            error: task.and_then(|t| t.error).map(|e| e.to_string()),
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Ensure
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Unknown model: '{0}'")]
    UnknownModel(String),

    #[error(transparent)]
    Download(#[from] DownloadError),
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownModel(_) => ErrorKind::Configuration,
            Self::Download(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensured {
    /// Found in one of the category's accepted directories.
    AlreadyPresent(PathBuf),
    Downloaded { path: PathBuf, bytes: u64 },
}

impl Ensured {
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::AlreadyPresent(path) | Self::Downloaded { path, .. } => path,
        }
    }
}

/// Make sure the catalog entry `key` is on disk under `layout`.
pub async fn ensure_model(
    key: &str,
    layout: &ModelLayout,
    manager: &DownloadManager,
    token: Option<&str>,
) -> Result<Ensured, CatalogError> {
    let spec = find(key).ok_or_else(|| CatalogError::UnknownModel(key.to_string()))?;
    ensure_spec(spec, layout, manager, token).await
}

pub async fn ensure_spec(
    spec: &ModelSpec,
    layout: &ModelLayout,
    manager: &DownloadManager,
    token: Option<&str>,
) -> Result<Ensured, CatalogError> {
    if let Some(path) = layout.find_existing(spec.category, spec.filename) {
        tracing::debug!(key = spec.key, path = %path.display(), "Model already present");
        return Ok(Ensured::AlreadyPresent(path));
    }

    let token = if spec.requires_auth { token } else { None };
    let target = layout.target_path(spec.category, spec.filename);
    let task = manager.download(spec.key, spec.url, target, token).await?;
    Ok(Ensured::Downloaded {
        path: task.target,
        bytes: task.bytes_transferred,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp8_set_uses_scaled_weights() {
        let keys: Vec<_> = required_for(ModelPrecision::Fp8).iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["flux_kontext_fp8", "clip_l", "t5xxl_fp8", "ae"]);
    }

    #[test]
    fn fp16_set_uses_full_weights() {
        let keys: Vec<_> = required_for(ModelPrecision::Fp16).iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["flux_kontext", "clip_l", "t5xxl_fp16", "ae"]);
    }

    #[test]
    fn gated_models() {
        let gated: Vec<_> = CATALOG.iter().filter(|m| m.requires_auth).map(|m| m.key).collect();
        assert_eq!(gated, vec!["flux_kontext", "ae"]);
    }

    #[test]
    fn keys_are_unique() {
        for (i, a) in CATALOG.iter().enumerate() {
            assert!(CATALOG[i + 1..].iter().all(|b| b.key != a.key), "duplicate {}", a.key);
        }
    }

    #[tokio::test]
    async fn status_finds_diffusion_weights_in_either_directory() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ModelLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        std::fs::write(
            layout.target_path(ArtifactCategory::DiffusionModels, "flux1-dev-kontext_fp8_scaled.safetensors"),
            b"w",
        )
        .unwrap();

        let manager = DownloadManager::new().unwrap();
        let status = models_status(&layout, &manager).await;
        let fp8 = status.iter().find(|s| s.spec.key == "flux_kontext_fp8").unwrap();
        assert!(fp8.available);
        assert_eq!(fp8.download, DownloadStatus::Idle);
        assert!(!status.iter().find(|s| s.spec.key == "ae").unwrap().available);
    }

    #[tokio::test]
    async fn present_model_is_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ModelLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let path = layout.target_path(ArtifactCategory::Vae, "ae.safetensors");
        std::fs::write(&path, b"vae").unwrap();

        let manager = DownloadManager::new().unwrap();
        let ensured = ensure_model("ae", &layout, &manager, None).await.unwrap();
        assert_eq!(ensured, Ensured::AlreadyPresent(path));
        assert!(manager.status("ae").await.is_none());
    }

    #[tokio::test]
    async fn unknown_model_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::new().unwrap();
        let err = ensure_model("sdxl", &ModelLayout::new(dir.path()), &manager, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
