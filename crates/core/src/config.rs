use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::compute::WorkgroupSize;
use crate::model_spec::ResolveOptions;
use crate::pipeline::PipelineOptions;
use crate::session::InferenceBackend;
use crate::types::{PixelFormat, ValueRange};

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "STYLECAST_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub model: ModelConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// `cuda`, `tensorrt` or `cpu`.
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_range: Option<ValueRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub refresh_hz: u32,
    /// 0 = unlimited.
    pub max_scratch_bytes: u64,
    pub tile_width: u32,
    pub tile_height: u32,
    pub pixel_format: PixelFormat,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::default().to_string(),
            value_range: None,
            fallback_width: None,
            fallback_height: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            refresh_hz: 60,
            max_scratch_bytes: 0,
            tile_width: 16,
            tile_height: 8,
            pixel_format: PixelFormat::Rgba,
        }
    }
}

impl ModelConfig {
    pub fn backend(&self) -> InferenceBackend {
        InferenceBackend::from_str_lossy(&self.backend)
    }

    /// Both dimensions must be set for the fallback to apply.
    pub fn fallback_size(&self) -> Option<(u32, u32)> {
        match (self.fallback_width, self.fallback_height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }
}

impl PipelineConfig {
    pub fn workgroup(&self) -> WorkgroupSize {
        WorkgroupSize::new(self.tile_width as usize, self.tile_height as usize)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            resolve: ResolveOptions {
                value_range: self.model.value_range,
                fallback_size: self.model.fallback_size(),
            },
            max_scratch_bytes: usize::try_from(self.pipeline.max_scratch_bytes)
                .unwrap_or(usize::MAX),
        }
    }
}

/// Resolve the data directory: CLI override, then `STYLECAST_DATA_DIR`,
/// then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates `data_dir` and writes a default `config.toml` unless one exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
