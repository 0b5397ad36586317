//! ONNX Runtime session construction for the style model.
//!
//! [`build_session`] registers the execution providers for the configured
//! [`InferenceBackend`]. TensorRT sessions cache compiled engines per model
//! under the configured cache directory and fall back to CUDA.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Case-insensitive. Unknown names select CUDA.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub model_path: PathBuf,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }

    stats
}

/// Engine cache directory for one model: `<base>/<model file stem>`.
pub fn trt_cache_dir_for(base_dir: &Path, model_path: &Path) -> PathBuf {
    let stem = model_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    base_dir.join(stem)
}

pub fn build_session(config: &SessionConfig) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path.as_path();
    let started = Instant::now();

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let base = config
                .trt_cache_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("trt_cache"));
            let cache_dir = trt_cache_dir_for(&base, model_path);
            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let before = cache_stats(&cache_dir);
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let cache_path = cache_dir.to_string_lossy().to_string();
            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()));

            let after = cache_stats(&cache_dir);
            match result {
                Ok(session) => {
                    info!(
                        elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
                        cache_updated = after != before,
                        cache_bytes = after.total_bytes,
                        "TensorRT session ready"
                    );
                    session
                }
                Err(e) => {
                    error!(
                        elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
                        cache_dir = %cache_dir.display(),
                        error = %e,
                        "TensorRT session initialization failed"
                    );
                    return Err(e);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session without execution providers");
            builder
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?
        }
    };

    info!(
        backend = %config.backend,
        model = %model_path.display(),
        elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
        "Inference session ready"
    );
    Ok(session)
}
