use std::sync::Arc;

use half::f16;
use half::slice::HalfFloatSliceExt;

use crate::buffer_cache::{lock_scratch, BufferCache, BufferRole};
use crate::compute::{ComputeBackend, ImageView, ImageViewMut};
use crate::error::{PipelineError, Result};
use crate::types::{pixel_byte_len, ElementType, PixelBuffer, PixelFormat, TensorBuffer, ValueRange};

const WIDEN_CHUNK: usize = 4096;

/// Turns a model output tensor back into a displayable frame at the
/// requested size. Every channel is clamped into `[0, 255]` and alpha is
/// opaque.
pub struct Postprocessor {
    backend: Arc<dyn ComputeBackend>,
}

fn widen_into(src: &[f16], dst: &mut [f32]) {
    for (from, to) in src.chunks(WIDEN_CHUNK).zip(dst.chunks_mut(WIDEN_CHUNK)) {
        from.convert_to_f32_slice(to);
    }
}

impl Postprocessor {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self { backend }
    }

    pub fn to_pixel_buffer(
        &self,
        cache: &mut BufferCache,
        tensor: &TensorBuffer,
        final_size: (u32, u32),
        format: PixelFormat,
        range: ValueRange,
    ) -> Result<PixelBuffer> {
        let (final_width, final_height) = final_size;
        if final_width == 0 || final_height == 0 {
            return Err(PipelineError::InvalidFrame(format!(
                "cannot present a {final_width}x{final_height} frame"
            )));
        }

        let desc = *tensor.desc();
        let (width, height) = (desc.width as usize, desc.height as usize);
        let count = desc.element_count();

        let widened = match desc.element {
            ElementType::F32 => None,
            ElementType::F16 => {
                let handle = cache.acquire(BufferRole::Widen, count * ElementType::F32.size_bytes())?;
                {
                    let mut wide = lock_scratch(&handle);
                    let narrow = lock_scratch(tensor.storage());
                    widen_into(&narrow.as_f16()[..count], &mut wide.as_f32_mut()[..count]);
                }
                Some(handle)
            }
        };

        let packed = cache.acquire(
            BufferRole::Postprocess,
            pixel_byte_len(desc.width, desc.height),
        )?;
        {
            let source = widened.as_ref().unwrap_or(tensor.storage());
            let values = lock_scratch(source);
            let mut guard = lock_scratch(&packed);
            let mut dst = ImageViewMut {
                data: guard.as_bytes_mut(),
                width,
                height,
                format,
            };
            self.backend
                .tensor_to_pixels(&values.as_f32()[..count], desc.layout, range, &mut dst)?;
        }

        if (desc.width, desc.height) == final_size {
            let guard = lock_scratch(&packed);
            return PixelBuffer::new(final_width, final_height, format, guard.as_bytes().to_vec());
        }

        let resized = cache.acquire(
            BufferRole::PostprocessResize,
            pixel_byte_len(final_width, final_height),
        )?;
        let packed_guard = lock_scratch(&packed);
        let mut resized_guard = lock_scratch(&resized);
        let src = ImageView {
            data: packed_guard.as_bytes(),
            width,
            height,
            format,
        };
        let mut dst = ImageViewMut {
            data: resized_guard.as_bytes_mut(),
            width: final_width as usize,
            height: final_height as usize,
            format,
        };
        self.backend.resample(&src, &mut dst)?;
        PixelBuffer::new(
            final_width,
            final_height,
            format,
            resized_guard.as_bytes().to_vec(),
        )
    }
}
