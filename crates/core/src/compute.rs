//! Compute backend seam for pixel/tensor conversion kernels.
//!
//! Kernels are expressed per output pixel and dispatched over fixed-size 2D
//! work tiles. Invocations that fall outside the image are skipped, so any
//! image size can be covered by whole tiles.

use half::f16;

use crate::buffer_cache::ScratchMemory;
use crate::error::{PipelineError, Result};
use crate::types::{PixelFormat, TensorLayout, ValueRange};

/// Work-tile extent in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub width: usize,
    pub height: usize,
}

impl WorkgroupSize {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    /// Number of tiles needed to cover `width x height`.
    pub fn groups_for(&self, width: usize, height: usize) -> (usize, usize) {
        (width.div_ceil(self.width), height.div_ceil(self.height))
    }
}

impl Default for WorkgroupSize {
    fn default() -> Self {
        Self::new(16, 8)
    }
}

pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
}

pub struct ImageViewMut<'a> {
    pub data: &'a mut [u8],
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
}

pub enum TensorViewMut<'a> {
    F32(&'a mut [f32]),
    F16(&'a mut [f16]),
}

impl TensorViewMut<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::F16(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_image(width: usize, height: usize, len: usize, what: &str) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(PipelineError::ComputeResourceUnavailable(format!(
            "{what} has empty extent {width}x{height}"
        )));
    }
    let needed = width * height * PixelFormat::BYTES_PER_PIXEL;
    if len < needed {
        return Err(PipelineError::ComputeResourceUnavailable(format!(
            "{what} binding holds {len} bytes, {needed} needed"
        )));
    }
    Ok(())
}

fn check_tensor(len: usize, width: usize, height: usize, what: &str) -> Result<()> {
    let needed = width * height * 3;
    if len < needed {
        return Err(PipelineError::ComputeResourceUnavailable(format!(
            "{what} binding holds {len} elements, {needed} needed"
        )));
    }
    Ok(())
}

impl ImageView<'_> {
    fn validate(&self, what: &str) -> Result<()> {
        check_image(self.width, self.height, self.data.len(), what)
    }
}

impl ImageViewMut<'_> {
    fn validate(&self, what: &str) -> Result<()> {
        check_image(self.width, self.height, self.data.len(), what)
    }
}

pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Allocates device-visible scratch memory.
    fn allocate(&self, bytes: usize) -> Result<ScratchMemory>;

    /// Unpacks 8-bit pixels into a three-channel tensor of the same extent.
    fn pixels_to_tensor(
        &self,
        src: &ImageView<'_>,
        dst: TensorViewMut<'_>,
        layout: TensorLayout,
        range: ValueRange,
    ) -> Result<()>;

    /// Packs a three-channel f32 tensor back into opaque 8-bit pixels,
    /// clamping every channel into `[0, 255]`.
    fn tensor_to_pixels(
        &self,
        src: &[f32],
        layout: TensorLayout,
        range: ValueRange,
        dst: &mut ImageViewMut<'_>,
    ) -> Result<()>;

    /// Bilinear resample between two pixel buffers of the same channel order.
    fn resample(&self, src: &ImageView<'_>, dst: &mut ImageViewMut<'_>) -> Result<()>;
}

/// Host implementation of the kernels, tile by tile.
#[derive(Debug, Clone, Default)]
pub struct CpuComputeBackend {
    workgroup: WorkgroupSize,
}

impl CpuComputeBackend {
    pub fn new(workgroup: WorkgroupSize) -> Self {
        Self { workgroup }
    }

    pub fn workgroup(&self) -> WorkgroupSize {
        self.workgroup
    }

    fn dispatch(&self, width: usize, height: usize, mut kernel: impl FnMut(usize, usize)) {
        let tile = self.workgroup;
        let (groups_x, groups_y) = tile.groups_for(width, height);
        for group_y in 0..groups_y {
            for group_x in 0..groups_x {
                for local_y in 0..tile.height {
                    for local_x in 0..tile.width {
                        let x = group_x * tile.width + local_x;
                        let y = group_y * tile.height + local_y;
                        if x >= width || y >= height {
                            continue;
                        }
                        kernel(x, y);
                    }
                }
            }
        }
    }
}

impl ComputeBackend for CpuComputeBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn allocate(&self, bytes: usize) -> Result<ScratchMemory> {
        ScratchMemory::try_allocate(bytes).map_err(|error| {
            PipelineError::ComputeResourceUnavailable(format!(
                "host allocation of {bytes} bytes failed: {error}"
            ))
        })
    }

    fn pixels_to_tensor(
        &self,
        src: &ImageView<'_>,
        dst: TensorViewMut<'_>,
        layout: TensorLayout,
        range: ValueRange,
    ) -> Result<()> {
        src.validate("source image")?;
        check_tensor(dst.len(), src.width, src.height, "destination tensor")?;

        let (w, h) = (src.width, src.height);
        let offsets = src.format.rgb_offsets();
        let data = src.data;

        match dst {
            TensorViewMut::F32(out) => self.dispatch(w, h, |x, y| {
                let base = (y * w + x) * PixelFormat::BYTES_PER_PIXEL;
                for (c, offset) in offsets.iter().enumerate() {
                    out[layout.index(c, x, y, w, h)] = range.to_model(data[base + offset]);
                }
            }),
            TensorViewMut::F16(out) => self.dispatch(w, h, |x, y| {
                let base = (y * w + x) * PixelFormat::BYTES_PER_PIXEL;
                for (c, offset) in offsets.iter().enumerate() {
                    out[layout.index(c, x, y, w, h)] =
                        f16::from_f32(range.to_model(data[base + offset]));
                }
            }),
        }
        Ok(())
    }

    fn tensor_to_pixels(
        &self,
        src: &[f32],
        layout: TensorLayout,
        range: ValueRange,
        dst: &mut ImageViewMut<'_>,
    ) -> Result<()> {
        dst.validate("destination image")?;
        check_tensor(src.len(), dst.width, dst.height, "source tensor")?;

        let (w, h) = (dst.width, dst.height);
        let offsets = dst.format.rgb_offsets();
        let alpha = dst.format.alpha_offset();
        let out = &mut *dst.data;

        self.dispatch(w, h, |x, y| {
            let base = (y * w + x) * PixelFormat::BYTES_PER_PIXEL;
            for (c, offset) in offsets.iter().enumerate() {
                out[base + offset] = range.to_byte(src[layout.index(c, x, y, w, h)]);
            }
            out[base + alpha] = u8::MAX;
        });
        Ok(())
    }

    fn resample(&self, src: &ImageView<'_>, dst: &mut ImageViewMut<'_>) -> Result<()> {
        src.validate("resample source")?;
        dst.validate("resample destination")?;
        if src.format != dst.format {
            return Err(PipelineError::InvalidFrame(format!(
                "resample cannot convert {} to {}",
                src.format, dst.format
            )));
        }

        let (src_w, src_h) = (src.width, src.height);
        let (dst_w, dst_h) = (dst.width, dst.height);
        let data = src.data;
        let out = &mut *dst.data;
        const BPP: usize = PixelFormat::BYTES_PER_PIXEL;

        self.dispatch(dst_w, dst_h, |dst_x, dst_y| {
            // Pixel-centre mapping into the source grid.
            let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
            let y0 = src_yf.floor().max(0.0) as usize;
            let y1 = (y0 + 1).min(src_h - 1);
            let fy = (src_yf - y0 as f64).clamp(0.0, 1.0);

            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let x0 = src_xf.floor().max(0.0) as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = (src_xf - x0 as f64).clamp(0.0, 1.0);

            let di = (dst_y * dst_w + dst_x) * BPP;
            for c in 0..BPP {
                let p00 = data[(y0 * src_w + x0) * BPP + c] as f64;
                let p10 = data[(y0 * src_w + x1) * BPP + c] as f64;
                let p01 = data[(y1 * src_w + x0) * BPP + c] as f64;
                let p11 = data[(y1 * src_w + x1) * BPP + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bottom = p01 * (1.0 - fx) + p11 * fx;
                out[di + c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: usize, height: usize) -> Vec<u8> {
        let mut data = vec![0u8; width * height * 4];
        for y in 0..height {
            for x in 0..width {
                let base = (y * width + x) * 4;
                data[base] = (x * 17) as u8;
                data[base + 1] = (y * 29) as u8;
                data[base + 2] = (x * y) as u8;
                data[base + 3] = 255;
            }
        }
        data
    }

    #[test]
    fn tiles_cover_ragged_extents_exactly_once() {
        let backend = CpuComputeBackend::new(WorkgroupSize::new(16, 8));
        let (w, h) = (37, 19);
        let mut hits = vec![0u32; w * h];
        backend.dispatch(w, h, |x, y| hits[y * w + x] += 1);
        assert!(hits.iter().all(|&n| n == 1));
        assert_eq!(WorkgroupSize::new(16, 8).groups_for(w, h), (3, 3));
    }

    #[test]
    fn planar_unpack_reads_channel_order() {
        let backend = CpuComputeBackend::default();
        // One BGRA pixel: b=10 g=20 r=30.
        let src = [10u8, 20, 30, 255];
        let view = ImageView {
            data: &src,
            width: 1,
            height: 1,
            format: PixelFormat::Bgra,
        };
        let mut out = [0f32; 3];
        backend
            .pixels_to_tensor(&view, TensorViewMut::F32(&mut out), TensorLayout::Planar, ValueRange::Byte)
            .unwrap();
        assert_eq!(out, [30.0, 20.0, 10.0]);
    }

    #[test]
    fn interleaved_unit_round_trip_is_exact() {
        let backend = CpuComputeBackend::new(WorkgroupSize::new(4, 4));
        let (w, h) = (9, 5);
        let src = gradient(w, h);
        let view = ImageView {
            data: &src,
            width: w,
            height: h,
            format: PixelFormat::Rgba,
        };
        let mut tensor = vec![0f32; w * h * 3];
        backend
            .pixels_to_tensor(
                &view,
                TensorViewMut::F32(&mut tensor),
                TensorLayout::Interleaved,
                ValueRange::Unit,
            )
            .unwrap();
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));

        let mut back = vec![0u8; w * h * 4];
        let mut dst = ImageViewMut {
            data: &mut back,
            width: w,
            height: h,
            format: PixelFormat::Rgba,
        };
        backend
            .tensor_to_pixels(&tensor, TensorLayout::Interleaved, ValueRange::Unit, &mut dst)
            .unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn f16_unpack_stays_within_one_step() {
        let backend = CpuComputeBackend::default();
        let src = gradient(6, 3);
        let view = ImageView {
            data: &src,
            width: 6,
            height: 3,
            format: PixelFormat::Rgba,
        };
        let mut tensor = vec![f16::ZERO; 6 * 3 * 3];
        backend
            .pixels_to_tensor(&view, TensorViewMut::F16(&mut tensor), TensorLayout::Planar, ValueRange::Unit)
            .unwrap();
        let widened: Vec<f32> = tensor.iter().map(|v| v.to_f32()).collect();

        let mut back = vec![0u8; 6 * 3 * 4];
        let mut dst = ImageViewMut {
            data: &mut back,
            width: 6,
            height: 3,
            format: PixelFormat::Rgba,
        };
        backend
            .tensor_to_pixels(&widened, TensorLayout::Planar, ValueRange::Unit, &mut dst)
            .unwrap();
        for (a, b) in back.iter().zip(src.iter()) {
            assert!(a.abs_diff(*b) <= 1, "{a} vs {b}");
        }
    }

    #[test]
    fn pack_clamps_out_of_range_values() {
        let backend = CpuComputeBackend::default();
        let tensor = [-50.0f32, 400.0, f32::NAN];
        let mut back = [7u8; 4];
        let mut dst = ImageViewMut {
            data: &mut back,
            width: 1,
            height: 1,
            format: PixelFormat::Rgba,
        };
        backend
            .tensor_to_pixels(&tensor, TensorLayout::Interleaved, ValueRange::Byte, &mut dst)
            .unwrap();
        assert_eq!(back, [0, 255, 0, 255]);
    }

    #[test]
    fn undersized_bindings_are_reported() {
        let backend = CpuComputeBackend::default();
        let src = [0u8; 4 * 4];
        let view = ImageView {
            data: &src,
            width: 2,
            height: 2,
            format: PixelFormat::Rgba,
        };
        let mut short = [0f32; 11];
        let err = backend
            .pixels_to_tensor(&view, TensorViewMut::F32(&mut short), TensorLayout::Planar, ValueRange::Unit)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ComputeResourceUnavailable(_)));
    }

    #[test]
    fn resample_of_solid_colour_is_solid() {
        let backend = CpuComputeBackend::default();
        let src: Vec<u8> = [40u8, 80, 120, 255].repeat(5 * 3);
        let view = ImageView {
            data: &src,
            width: 5,
            height: 3,
            format: PixelFormat::Rgba,
        };
        let mut out = vec![0u8; 11 * 7 * 4];
        let mut dst = ImageViewMut {
            data: &mut out,
            width: 11,
            height: 7,
            format: PixelFormat::Rgba,
        };
        backend.resample(&view, &mut dst).unwrap();
        assert!(out.chunks_exact(4).all(|px| px == [40, 80, 120, 255]));
    }

    #[test]
    fn resample_same_size_is_identity() {
        let backend = CpuComputeBackend::default();
        let src = gradient(7, 4);
        let view = ImageView {
            data: &src,
            width: 7,
            height: 4,
            format: PixelFormat::Rgba,
        };
        let mut out = vec![0u8; src.len()];
        let mut dst = ImageViewMut {
            data: &mut out,
            width: 7,
            height: 4,
            format: PixelFormat::Rgba,
        };
        backend.resample(&view, &mut dst).unwrap();
        assert_eq!(out, src);
    }
}
