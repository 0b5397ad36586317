use std::sync::Arc;

use crate::buffer_cache::{lock_scratch, BufferCache, BufferRole};
use crate::compute::{ComputeBackend, ImageView, ImageViewMut, TensorViewMut};
use crate::error::Result;
use crate::model_spec::TensorSpec;
use crate::types::{pixel_byte_len, ElementType, PixelBuffer, TensorBuffer, ValueRange};

/// Turns a captured frame into the model's input tensor.
///
/// The frame is resampled to the model's input extent when it differs, then
/// unpacked into the layout, element type and value range of the input port.
/// The returned tensor lives in the cache's preprocess scratch buffer and is
/// overwritten by the next call.
pub struct Preprocessor {
    backend: Arc<dyn ComputeBackend>,
}

impl Preprocessor {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self { backend }
    }

    pub fn to_tensor(
        &self,
        cache: &mut BufferCache,
        frame: &PixelBuffer,
        spec: &TensorSpec,
        range: ValueRange,
    ) -> Result<TensorBuffer> {
        let desc = spec.desc();
        let (width, height) = (spec.width as usize, spec.height as usize);

        let resized = if frame.size() != (spec.width, spec.height) {
            let handle = cache.acquire(
                BufferRole::PreprocessResize,
                pixel_byte_len(spec.width, spec.height),
            )?;
            {
                let mut guard = lock_scratch(&handle);
                let src = ImageView {
                    data: frame.data(),
                    width: frame.width() as usize,
                    height: frame.height() as usize,
                    format: frame.format(),
                };
                let mut dst = ImageViewMut {
                    data: guard.as_bytes_mut(),
                    width,
                    height,
                    format: frame.format(),
                };
                self.backend.resample(&src, &mut dst)?;
            }
            Some(handle)
        } else {
            None
        };

        let storage = cache.acquire(BufferRole::Preprocess, desc.byte_len())?;
        {
            let resized_guard = resized.as_ref().map(|handle| lock_scratch(handle));
            let pixels = match &resized_guard {
                Some(guard) => guard.as_bytes(),
                None => frame.data(),
            };
            let src = ImageView {
                data: pixels,
                width,
                height,
                format: frame.format(),
            };

            let count = desc.element_count();
            let mut guard = lock_scratch(&storage);
            let dst = match desc.element {
                ElementType::F32 => TensorViewMut::F32(&mut guard.as_f32_mut()[..count]),
                ElementType::F16 => TensorViewMut::F16(&mut guard.as_f16_mut()[..count]),
            };
            self.backend
                .pixels_to_tensor(&src, dst, desc.layout, range)?;
        }

        TensorBuffer::new(desc, storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::CpuComputeBackend;
    use crate::types::{PixelFormat, TensorLayout};

    fn setup() -> (Preprocessor, BufferCache) {
        let backend: Arc<dyn ComputeBackend> = Arc::new(CpuComputeBackend::default());
        (Preprocessor::new(backend.clone()), BufferCache::new(backend))
    }

    fn spec(layout: TensorLayout, element: ElementType, width: u32, height: u32) -> TensorSpec {
        TensorSpec {
            name: "input".into(),
            layout,
            element,
            width,
            height,
            channels: 3,
            batched: true,
        }
    }

    #[test]
    fn same_size_frame_skips_resample() {
        let (pre, mut cache) = setup();
        let frame = PixelBuffer::filled(8, 4, PixelFormat::Bgra, [255, 0, 51, 255]).unwrap();
        let spec = spec(TensorLayout::Planar, ElementType::F32, 8, 4);

        let tensor = pre
            .to_tensor(&mut cache, &frame, &spec, ValueRange::Unit)
            .unwrap();

        assert_eq!(cache.capacity(BufferRole::PreprocessResize), None);
        assert_eq!(tensor.element_count(), 8 * 4 * 3);
        let values = tensor.to_f32_vec();
        // Planar R, G, B planes regardless of the frame's byte order.
        assert_eq!(values[0], 1.0);
        assert_eq!(values[32], 0.0);
        assert!((values[64] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn mismatched_frame_is_resampled_to_model_extent() {
        let (pre, mut cache) = setup();
        let frame = PixelBuffer::filled(64, 48, PixelFormat::Rgba, [10, 20, 30, 255]).unwrap();
        let spec = spec(TensorLayout::Interleaved, ElementType::F16, 16, 12);

        let tensor = pre
            .to_tensor(&mut cache, &frame, &spec, ValueRange::Byte)
            .unwrap();

        assert_eq!(
            cache.capacity(BufferRole::PreprocessResize),
            Some(pixel_byte_len(16, 12))
        );
        assert_eq!(cache.capacity(BufferRole::Preprocess), Some(16 * 12 * 3 * 2));
        let values = tensor.to_f32_vec();
        assert_eq!(&values[..3], &[10.0, 20.0, 30.0]);
        assert_eq!(&values[values.len() - 3..], &[10.0, 20.0, 30.0]);
    }

    #[test]
    fn steady_state_frames_reuse_scratch() {
        let (pre, mut cache) = setup();
        let spec = spec(TensorLayout::Planar, ElementType::F32, 16, 16);
        for shade in 0..5u8 {
            let frame = PixelBuffer::filled(32, 32, PixelFormat::Rgba, [shade, 0, 0, 255]).unwrap();
            let tensor = pre
                .to_tensor(&mut cache, &frame, &spec, ValueRange::Byte)
                .unwrap();
            assert_eq!(tensor.to_f32_vec()[0], shade as f32);
        }
        assert_eq!(cache.allocation_count(), 2);
    }
}
