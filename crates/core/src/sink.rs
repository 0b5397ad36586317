use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::types::{PixelBuffer, PixelFormat};

/// Consumer of presented frames. Owned by the presenter stage, which calls
/// [`DisplaySink::present`] at most once per admitted frame.
pub trait DisplaySink: Send + 'static {
    fn present(&mut self, frame: PixelBuffer) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes frames back to back as raw 4-channel video. The first frame fixes
/// the stream's size and channel order.
///
/// Pipe into a player with e.g.
/// `ffplay -f rawvideo -pixel_format rgba -video_size 1280x720 -`.
pub struct RawVideoSink<W: Write + Send + 'static> {
    writer: W,
    geometry: Option<(u32, u32, PixelFormat)>,
    frames: u64,
}

impl<W: Write + Send + 'static> RawVideoSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            geometry: None,
            frames: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send + 'static> DisplaySink for RawVideoSink<W> {
    fn present(&mut self, frame: PixelBuffer) -> Result<()> {
        let geometry = (frame.width(), frame.height(), frame.format());
        match self.geometry {
            None => {
                debug!(
                    width = geometry.0,
                    height = geometry.1,
                    format = %geometry.2,
                    "Raw video stream started"
                );
                self.geometry = Some(geometry);
            }
            Some(expected) if expected != geometry => bail!(
                "frame {}x{} {} does not match stream {}x{} {}",
                geometry.0,
                geometry.1,
                geometry.2,
                expected.0,
                expected.1,
                expected.2
            ),
            Some(_) => {}
        }

        self.writer
            .write_all(frame.data())
            .context("failed to write raw video frame")?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush raw video output")
    }
}

/// Discards frames, counting them.
#[derive(Debug, Clone, Default)]
pub struct NullSink {
    presented: Arc<AtomicU64>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter that stays readable after the sink moves into a session.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.presented.clone()
    }
}

impl DisplaySink for NullSink {
    fn present(&mut self, _frame: PixelBuffer) -> Result<()> {
        self.presented.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
