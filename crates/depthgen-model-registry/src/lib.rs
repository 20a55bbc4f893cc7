use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LOCKFILE_NAME: &str = "depthgen-model-lock.json";
pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_REVISION: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KnownModel {
    ControlNetDepth,
    VaeFp16Fix,
    SdxlBase,
    DptHybridMidas,
}

impl KnownModel {
    pub fn model_id(self) -> &'static str {
        match self {
            Self::ControlNetDepth => "diffusers/controlnet-depth-sdxl-1.0",
            Self::VaeFp16Fix => "madebyollin/sdxl-vae-fp16-fix",
            Self::SdxlBase => "stabilityai/stable-diffusion-xl-base-1.0",
            Self::DptHybridMidas => "Intel/dpt-hybrid-midas",
        }
    }

    pub fn cache_key(self) -> &'static str {
        match self {
            Self::ControlNetDepth => "diffusers__controlnet-depth-sdxl-1.0",
            Self::VaeFp16Fix => "madebyollin__sdxl-vae-fp16-fix",
            Self::SdxlBase => "stabilityai__stable-diffusion-xl-base-1.0",
            Self::DptHybridMidas => "Intel__dpt-hybrid-midas",
        }
    }

    /// Short name used on the command line.
    pub fn label(self) -> &'static str {
        match self {
            Self::ControlNetDepth => "controlnet",
            Self::VaeFp16Fix => "vae",
            Self::SdxlBase => "sdxl",
            Self::DptHybridMidas => "depth-estimator",
        }
    }

    pub fn all() -> [KnownModel; 4] {
        [
            KnownModel::ControlNetDepth,
            KnownModel::VaeFp16Fix,
            KnownModel::SdxlBase,
            KnownModel::DptHybridMidas,
        ]
    }

    pub fn from_model_id(model_id: &str) -> Option<Self> {
        Self::all().into_iter().find(|m| m.model_id() == model_id)
    }

    /// Sub-directories of the SDXL repository the pipeline reads; other models are used whole.
    pub fn components(self) -> &'static [&'static str] {
        match self {
            Self::SdxlBase => &["text_encoder", "text_encoder_2", "unet", "tokenizer", "tokenizer_2"],
            Self::VaeFp16Fix => &["vae_decoder"],
            Self::ControlNetDepth | Self::DptHybridMidas => &[],
        }
    }

    /// Whether a repository file belongs to the parts of this model the pipeline needs.
    pub fn wants_path(self, path: &str) -> bool {
        match self {
            Self::SdxlBase => self
                .components()
                .iter()
                .any(|component| path.starts_with(&format!("{}/", component))),
            Self::VaeFp16Fix => !path.contains("encoder"),
            Self::ControlNetDepth | Self::DptHybridMidas => true,
        }
    }
}

impl Display for KnownModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.model_id())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockFileEntry {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockModel {
    #[serde(alias = "model_id")]
    pub model_id: String,
    pub revision: String,
    pub source: String,
    pub files: Vec<LockFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLock {
    #[serde(alias = "schema_version")]
    pub schema_version: u32,
    #[serde(alias = "generated_at")]
    pub generated_at: String,
    pub models: Vec<LockModel>,
}

impl ModelLock {
    pub fn entry(&self, model: KnownModel) -> Option<&LockModel> {
        self.models.iter().find(|m| m.model_id == model.model_id())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not determine a default model directory")]
    NoDefaultModelDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub root: PathBuf,
    pub manifests_dir: PathBuf,
    pub models_dir: PathBuf,
    pub cache_downloads_dir: PathBuf,
}

pub fn default_model_dir() -> Result<PathBuf, RegistryError> {
    let home = dirs::home_dir().ok_or(RegistryError::NoDefaultModelDir)?;
    Ok(home.join(".depthgen").join("models"))
}

pub fn resolve_model_paths(model_dir: Option<&Path>) -> Result<ModelPaths, RegistryError> {
    let root = if let Some(dir) = model_dir {
        dir.to_path_buf()
    } else {
        default_model_dir()?
    };

    Ok(ModelPaths {
        manifests_dir: root.join("manifests"),
        models_dir: root.join("models"),
        cache_downloads_dir: root.join("cache").join("downloads"),
        root,
    })
}

pub fn ensure_layout(paths: &ModelPaths) -> Result<(), RegistryError> {
    fs::create_dir_all(&paths.manifests_dir)?;
    fs::create_dir_all(&paths.models_dir)?;
    fs::create_dir_all(&paths.cache_downloads_dir)?;
    Ok(())
}

pub fn model_revision_dir(paths: &ModelPaths, model: KnownModel, revision: &str) -> PathBuf {
    paths.models_dir.join(model.cache_key()).join(revision)
}

/// Revision directory recorded for `model` in the lockfile, if it has been installed.
pub fn locked_revision_dir(paths: &ModelPaths, lock: &ModelLock, model: KnownModel) -> Option<PathBuf> {
    lock.entry(model)
        .map(|entry| model_revision_dir(paths, model, &entry.revision))
}

pub fn lockfile_path(paths: &ModelPaths) -> PathBuf {
    paths.manifests_dir.join(LOCKFILE_NAME)
}

pub fn write_lockfile(paths: &ModelPaths, lock: &ModelLock) -> Result<(), RegistryError> {
    ensure_layout(paths)?;
    let data = serde_json::to_vec_pretty(lock)?;
    fs::write(lockfile_path(paths), data)?;
    Ok(())
}

pub fn read_lockfile(paths: &ModelPaths) -> Result<ModelLock, RegistryError> {
    let data = fs::read(lockfile_path(paths))?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn merge_lock_models(existing: Option<ModelLock>, updates: Vec<LockModel>, generated_at: String) -> ModelLock {
    let mut by_id = std::collections::BTreeMap::new();
    if let Some(lock) = existing {
        for model in lock.models {
            by_id.insert(model.model_id.clone(), model);
        }
    }
    for model in updates {
        by_id.insert(model.model_id.clone(), model);
    }
    ModelLock {
        schema_version: SCHEMA_VERSION,
        generated_at,
        models: by_id.into_values().collect(),
    }
}
