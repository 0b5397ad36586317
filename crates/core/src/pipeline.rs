//! Per-frame conversion: captured frame in, styled frame out.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::buffer_cache::{lock_scratch, BufferCache, BufferRole};
use crate::compute::{ComputeBackend, ImageView, ImageViewMut};
use crate::engine::{EngineInput, EngineOutput, InferenceEngine};
use crate::error::{PipelineError, Result};
use crate::model_spec::{resolve_model_io, ModelIOSpec, PortSpec, ResolveOptions};
use crate::postprocess::Postprocessor;
use crate::preprocess::Preprocessor;
use crate::types::{pixel_byte_len, PixelBuffer};

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub resolve: ResolveOptions,
    /// Combined scratch budget in bytes. `0` means unlimited.
    pub max_scratch_bytes: usize,
}

pub struct FramePipeline {
    engine: Box<dyn InferenceEngine>,
    spec: ModelIOSpec,
    options: PipelineOptions,
    backend: Arc<dyn ComputeBackend>,
    cache: BufferCache,
    pre: Preprocessor,
    post: Postprocessor,
    last_source_size: Option<(u32, u32)>,
}

impl FramePipeline {
    /// Resolves the model's IO spec once. Load errors are returned here and
    /// never surface per frame.
    pub fn load(
        engine: Box<dyn InferenceEngine>,
        backend: Arc<dyn ComputeBackend>,
        options: &PipelineOptions,
    ) -> Result<Self> {
        let spec = resolve_model_io(&engine.describe(), &options.resolve)?;
        info!(
            compute = backend.name(),
            input = spec.input.name(),
            output = spec.output.name(),
            value_range = %spec.value_range,
            "Resolved model IO"
        );

        Ok(Self {
            engine,
            spec,
            options: options.clone(),
            cache: BufferCache::new(backend.clone()).with_budget(options.max_scratch_bytes),
            pre: Preprocessor::new(backend.clone()),
            post: Postprocessor::new(backend.clone()),
            backend,
            last_source_size: None,
        })
    }

    pub fn spec(&self) -> &ModelIOSpec {
        &self.spec
    }

    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    /// Swaps in another model. The new spec is resolved before anything is
    /// replaced, so a failed load keeps the current model running.
    pub fn replace_engine(&mut self, engine: Box<dyn InferenceEngine>) -> Result<()> {
        let spec = resolve_model_io(&engine.describe(), &self.options.resolve)?;
        self.engine = engine;
        self.spec = spec;
        self.cache.clear();
        self.last_source_size = None;
        Ok(())
    }

    /// Each side is converted on its own: a tensor port goes through the
    /// pre/postprocessors, a pixel port only through resampling.
    pub fn process(&mut self, frame: &PixelBuffer) -> Result<PixelBuffer> {
        let started = Instant::now();
        let source_size = frame.size();
        if self.last_source_size != Some(source_size) {
            if self.last_source_size.is_some() {
                debug!(width = source_size.0, height = source_size.1, "Source size changed");
            }
            self.cache.clear();
            self.last_source_size = Some(source_size);
        }

        let input = match &self.spec.input {
            PortSpec::Tensor(input_spec) => EngineInput::Tensor(self.pre.to_tensor(
                &mut self.cache,
                frame,
                input_spec,
                self.spec.value_range,
            )?),
            PortSpec::Pixels { width, height, .. } => EngineInput::Pixels(resample_cached(
                self.backend.as_ref(),
                &mut self.cache,
                BufferRole::PreprocessResize,
                frame,
                (*width, *height),
            )?),
        };
        let prepared = started.elapsed();

        let output = self.engine.predict(&self.spec, input)?;
        let inferred = started.elapsed();

        let styled = match (&self.spec.output, output) {
            (PortSpec::Tensor(_), EngineOutput::Tensor(tensor)) => self.post.to_pixel_buffer(
                &mut self.cache,
                &tensor,
                source_size,
                frame.format(),
                self.spec.value_range,
            )?,
            (PortSpec::Pixels { .. }, EngineOutput::Pixels(pixels)) => resample_cached(
                self.backend.as_ref(),
                &mut self.cache,
                BufferRole::PostprocessResize,
                &pixels.to_format(frame.format()),
                source_size,
            )?,
            (PortSpec::Tensor(_), EngineOutput::Pixels(_)) => {
                return Err(PipelineError::InferenceFailed(
                    "model returned pixels for a tensor output".to_string(),
                ))
            }
            (PortSpec::Pixels { .. }, EngineOutput::Tensor(_)) => {
                return Err(PipelineError::InferenceFailed(
                    "model returned a tensor for a pixel output".to_string(),
                ))
            }
        };

        debug!(
            preprocess_ms = format!("{:.1}", prepared.as_secs_f64() * 1000.0),
            inference_ms = format!("{:.1}", (inferred - prepared).as_secs_f64() * 1000.0),
            postprocess_ms = format!("{:.1}", (started.elapsed() - inferred).as_secs_f64() * 1000.0),
            "Frame styled"
        );
        Ok(styled)
    }
}

/// Resamples through the scratch buffer of `role`. Frames already at `size`
/// are shared, not copied.
fn resample_cached(
    backend: &dyn ComputeBackend,
    cache: &mut BufferCache,
    role: BufferRole,
    frame: &PixelBuffer,
    size: (u32, u32),
) -> Result<PixelBuffer> {
    if frame.size() == size {
        return Ok(frame.clone());
    }
    let handle = cache.acquire(role, pixel_byte_len(size.0, size.1))?;
    let mut guard = lock_scratch(&handle);
    let src = ImageView {
        data: frame.data(),
        width: frame.width() as usize,
        height: frame.height() as usize,
        format: frame.format(),
    };
    let mut dst = ImageViewMut {
        data: guard.as_bytes_mut(),
        width: size.0 as usize,
        height: size.1 as usize,
        format: frame.format(),
    };
    backend.resample(&src, &mut dst)?;
    PixelBuffer::new(size.0, size.1, frame.format(), guard.as_bytes().to_vec())
}
