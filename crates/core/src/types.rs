use std::fmt;
use std::sync::Arc;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::buffer_cache::{lock_scratch, BufferHandle, ScratchMemory};
use crate::error::{PipelineError, Result};

/// Channel order of an 8-bit, 4-channel pixel buffer. Fixed per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Rgba,
    Bgra,
}

impl PixelFormat {
    pub const BYTES_PER_PIXEL: usize = 4;

    /// Byte offsets of R, G and B inside one pixel.
    pub fn rgb_offsets(self) -> [usize; 3] {
        match self {
            Self::Rgba => [0, 1, 2],
            Self::Bgra => [2, 1, 0],
        }
    }

    pub fn alpha_offset(self) -> usize {
        3
    }

    /// Matching ffmpeg `-pix_fmt` name.
    pub fn ffmpeg_pix_fmt(self) -> &'static str {
        match self {
            Self::Rgba => "rgba",
            Self::Bgra => "bgra",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "bgra" => Self::Bgra,
            _ => Self::Rgba,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_pix_fmt())
    }
}

/// Displayable 2D image. Clones share the same pixel memory.
#[derive(Clone)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Arc<[u8]>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        Self::from_shared(width, height, format, Arc::from(data))
    }

    pub fn from_shared(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Arc<[u8]>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidFrame(format!(
                "pixel buffer must be non-empty, got {width}x{height}"
            )));
        }
        let expected = pixel_byte_len(width, height);
        if data.len() != expected {
            return Err(PipelineError::InvalidFrame(format!(
                "pixel buffer {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Solid-colour buffer, mostly useful for sources and tests.
    pub fn filled(width: u32, height: u32, format: PixelFormat, rgba: [u8; 4]) -> Result<Self> {
        let mut data = vec![0u8; pixel_byte_len(width, height)];
        let offsets = format.rgb_offsets();
        for px in data.chunks_exact_mut(PixelFormat::BYTES_PER_PIXEL) {
            px[offsets[0]] = rgba[0];
            px[offsets[1]] = rgba[1];
            px[offsets[2]] = rgba[2];
            px[format.alpha_offset()] = rgba[3];
        }
        Self::new(width, height, format, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// True when both buffers share the same underlying memory.
    pub fn same_buffer(&self, other: &PixelBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Returns `[r, g, b, a]` at `(x, y)` regardless of channel order.
    pub fn rgba_at(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let base = (y as usize * self.width as usize + x as usize) * PixelFormat::BYTES_PER_PIXEL;
        let offsets = self.format.rgb_offsets();
        Some([
            self.data[base + offsets[0]],
            self.data[base + offsets[1]],
            self.data[base + offsets[2]],
            self.data[base + self.format.alpha_offset()],
        ])
    }

    /// Copy with the requested channel order. Shares memory when the order already matches.
    pub fn to_format(&self, format: PixelFormat) -> PixelBuffer {
        if format == self.format {
            return self.clone();
        }
        let mut data = self.data.to_vec();
        for px in data.chunks_exact_mut(PixelFormat::BYTES_PER_PIXEL) {
            px.swap(0, 2);
        }
        Self {
            width: self.width,
            height: self.height,
            format,
            data: Arc::from(data),
        }
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

pub fn pixel_byte_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * PixelFormat::BYTES_PER_PIXEL
}

/// Memory order of a three-channel image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `(C, H, W)`: one full plane per channel.
    Planar,
    /// `(H, W, C)`: channels adjacent per pixel.
    Interleaved,
}

impl TensorLayout {
    #[inline]
    pub fn index(self, c: usize, x: usize, y: usize, width: usize, height: usize) -> usize {
        match self {
            Self::Planar => c * width * height + y * width + x,
            Self::Interleaved => (y * width + x) * 3 + c,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F16,
}

impl ElementType {
    pub fn size_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => f.write_str("float32"),
            Self::F16 => f.write_str("float16"),
        }
    }
}

/// Numeric convention a model expects for colour values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueRange {
    /// 0.0 to 1.0
    #[serde(alias = "0-1")]
    Unit,
    /// 0.0 to 255.0
    #[serde(alias = "0-255")]
    Byte,
}

impl ValueRange {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unit" | "0-1" | "0..1" => Some(Self::Unit),
            "byte" | "0-255" | "0..255" => Some(Self::Byte),
            _ => None,
        }
    }

    #[inline]
    pub fn to_model(self, value: u8) -> f32 {
        match self {
            Self::Unit => value as f32 / 255.0,
            Self::Byte => value as f32,
        }
    }

    /// Inverse of [`Self::to_model`], clamped into `[0, 255]`. NaN maps to 0.
    #[inline]
    pub fn to_byte(self, value: f32) -> u8 {
        let scaled = match self {
            Self::Unit => value * 255.0,
            Self::Byte => value,
        };
        if scaled.is_nan() {
            0
        } else {
            scaled.round().clamp(0.0, 255.0) as u8
        }
    }
}

impl fmt::Display for ValueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => f.write_str("0-1"),
            Self::Byte => f.write_str("0-255"),
        }
    }
}

/// Shape and element type of an image tensor (always three channels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TensorDesc {
    pub layout: TensorLayout,
    pub element: ElementType,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl TensorDesc {
    pub fn new(layout: TensorLayout, element: ElementType, width: u32, height: u32) -> Self {
        Self {
            layout,
            element,
            width,
            height,
            channels: 3,
        }
    }

    pub fn element_count(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.element.size_bytes()
    }
}

/// Flat numeric image buffer backed by scratch memory.
///
/// The element count always equals `width * height * channels`; constructors
/// reject storage that cannot hold that many elements.
#[derive(Clone)]
pub struct TensorBuffer {
    desc: TensorDesc,
    storage: BufferHandle,
}

impl TensorBuffer {
    pub fn new(desc: TensorDesc, storage: BufferHandle) -> Result<Self> {
        let capacity = lock_scratch(&storage).capacity();
        if capacity < desc.byte_len() {
            return Err(PipelineError::InvalidFrame(format!(
                "tensor storage holds {capacity} bytes, {} needed",
                desc.byte_len()
            )));
        }
        Ok(Self { desc, storage })
    }

    pub fn from_f32(desc: TensorDesc, values: &[f32]) -> Result<Self> {
        if desc.element != ElementType::F32 {
            return Err(element_mismatch(desc.element, ElementType::F32));
        }
        check_count(&desc, values.len())?;
        let mut memory = ScratchMemory::with_len(desc.byte_len())?;
        memory.as_f32_mut()[..values.len()].copy_from_slice(values);
        Self::new(desc, memory.into_handle())
    }

    pub fn from_f16(desc: TensorDesc, values: &[f16]) -> Result<Self> {
        if desc.element != ElementType::F16 {
            return Err(element_mismatch(desc.element, ElementType::F16));
        }
        check_count(&desc, values.len())?;
        let mut memory = ScratchMemory::with_len(desc.byte_len())?;
        memory.as_f16_mut()[..values.len()].copy_from_slice(values);
        Self::new(desc, memory.into_handle())
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn element_count(&self) -> usize {
        self.desc.element_count()
    }

    pub fn storage(&self) -> &BufferHandle {
        &self.storage
    }

    pub fn shares_storage(&self, handle: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.storage, handle)
    }

    pub fn with_f32<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        if self.desc.element != ElementType::F32 {
            return Err(element_mismatch(self.desc.element, ElementType::F32));
        }
        let guard = lock_scratch(&self.storage);
        Ok(f(&guard.as_f32()[..self.element_count()]))
    }

    pub fn with_f16<R>(&self, f: impl FnOnce(&[f16]) -> R) -> Result<R> {
        if self.desc.element != ElementType::F16 {
            return Err(element_mismatch(self.desc.element, ElementType::F16));
        }
        let guard = lock_scratch(&self.storage);
        Ok(f(&guard.as_f16()[..self.element_count()]))
    }

    /// Values widened to f32, whatever the stored element type.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let guard = lock_scratch(&self.storage);
        let count = self.element_count();
        match self.desc.element {
            ElementType::F32 => guard.as_f32()[..count].to_vec(),
            ElementType::F16 => guard.as_f16()[..count].iter().map(|v| v.to_f32()).collect(),
        }
    }
}

impl fmt::Debug for TensorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorBuffer")
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

fn check_count(desc: &TensorDesc, len: usize) -> Result<()> {
    if len != desc.element_count() {
        return Err(PipelineError::InvalidFrame(format!(
            "tensor {}x{}x{} expects {} elements, got {len}",
            desc.channels,
            desc.height,
            desc.width,
            desc.element_count()
        )));
    }
    Ok(())
}

fn element_mismatch(actual: ElementType, requested: ElementType) -> PipelineError {
    PipelineError::InvalidFrame(format!(
        "tensor holds {actual} elements, {requested} requested"
    ))
}
