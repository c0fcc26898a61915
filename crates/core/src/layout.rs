//! Model storage layout under an engine installation.
//!
//! File presence is the only availability signal; nothing here inspects
//! file contents.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Storage directory a model artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCategory {
    Unet,
    DiffusionModels,
    Clip,
    Vae,
}

impl ArtifactCategory {
    pub const ALL: [ArtifactCategory; 4] = [
        ArtifactCategory::Unet,
        ArtifactCategory::DiffusionModels,
        ArtifactCategory::Clip,
        ArtifactCategory::Vae,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Unet => "unet",
            Self::DiffusionModels => "diffusion_models",
            Self::Clip => "clip",
            Self::Vae => "vae",
        }
    }

    /// Directories searched, in order, when checking for an existing file.
    ///
    /// Diffusion weights may live in either `unet/` or `diffusion_models/`.
    pub fn lookup_order(&self) -> &'static [ArtifactCategory] {
        match self {
            Self::Unet | Self::DiffusionModels => {
                &[ArtifactCategory::Unet, ArtifactCategory::DiffusionModels]
            }
            Self::Clip => &[ArtifactCategory::Clip],
            Self::Vae => &[ArtifactCategory::Vae],
        }
    }
}

/// Resolves model paths under `<install>/models/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLayout {
    install_path: PathBuf,
}

impl ModelLayout {
    pub fn new(install_path: impl Into<PathBuf>) -> Self {
        Self {
            install_path: install_path.into(),
        }
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    pub fn models_dir(&self) -> PathBuf {
        self.install_path.join("models")
    }

    pub fn category_dir(&self, category: ArtifactCategory) -> PathBuf {
        self.models_dir().join(category.dir_name())
    }

    /// Path a freshly downloaded file is written to.
    pub fn target_path(&self, category: ArtifactCategory, filename: &str) -> PathBuf {
        self.category_dir(category).join(filename)
    }

    /// First existing location of `filename` among the category's accepted
    /// directories.
    pub fn find_existing(&self, category: ArtifactCategory, filename: &str) -> Option<PathBuf> {
        category
            .lookup_order()
            .iter()
            .map(|c| self.target_path(*c, filename))
            .find(|p| p.is_file())
    }

    /// Create every category directory. Idempotent.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for category in ArtifactCategory::ALL {
            std::fs::create_dir_all(self.category_dir(category))?;
        }
        Ok(())
    }
}
