//! Frame sources polled by the scheduler on each display tick.

use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use crate::types::PixelBuffer;

/// A time-driven producer of frames.
///
/// `at` is the tick instant. Sources start their own clock on first use, so
/// the first queried instant is time zero.
pub trait FrameSource: Send {
    /// True when a frame newer than the last one taken is due at `at`.
    fn has_new_frame(&mut self, at: Instant) -> bool;

    /// Newest frame due at `at`. Older due frames are skipped.
    fn take_frame(&mut self, at: Instant) -> Result<Option<PixelBuffer>>;

    /// True once every frame has been taken and the last one has been on
    /// screen for its full duration.
    fn is_end_of_stream(&self) -> bool;

    /// Restarts playback from the first frame at the last queried instant.
    fn seek_to_start(&mut self) -> Result<()>;
}

/// Frame index due after `elapsed` at `fps`.
pub(crate) fn due_index(elapsed: Duration, fps: f64) -> usize {
    (elapsed.as_secs_f64() * fps + 1e-6).floor() as usize
}

/// Plays an in-memory list of frames at a fixed rate. Frames are handed out
/// as clones sharing the stored pixel memory.
pub struct LoopingClipSource {
    frames: Vec<PixelBuffer>,
    fps: f64,
    origin: Option<Instant>,
    last_seen: Option<Instant>,
    next_index: usize,
}

impl LoopingClipSource {
    pub fn new(frames: Vec<PixelBuffer>, fps: f64) -> Result<Self> {
        if frames.is_empty() {
            bail!("clip needs at least one frame");
        }
        if !(fps.is_finite() && fps > 0.0) {
            bail!("clip frame rate must be positive, got {fps}");
        }
        Ok(Self {
            frames,
            fps,
            origin: None,
            last_seen: None,
            next_index: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames.len() as f64 / self.fps)
    }

    fn observe(&mut self, at: Instant) -> Duration {
        let origin = *self.origin.get_or_insert(at);
        self.last_seen = Some(at);
        at.saturating_duration_since(origin)
    }
}

impl FrameSource for LoopingClipSource {
    fn has_new_frame(&mut self, at: Instant) -> bool {
        let elapsed = self.observe(at);
        self.next_index < self.frames.len() && due_index(elapsed, self.fps) >= self.next_index
    }

    fn take_frame(&mut self, at: Instant) -> Result<Option<PixelBuffer>> {
        if !self.has_new_frame(at) {
            return Ok(None);
        }
        let elapsed = self.observe(at);
        let index = due_index(elapsed, self.fps).min(self.frames.len() - 1);
        self.next_index = index + 1;
        Ok(Some(self.frames[index].clone()))
    }

    fn is_end_of_stream(&self) -> bool {
        match (self.origin, self.last_seen) {
            (Some(origin), Some(last)) => {
                self.next_index >= self.frames.len()
                    && last.saturating_duration_since(origin) >= self.duration()
            }
            _ => false,
        }
    }

    fn seek_to_start(&mut self) -> Result<()> {
        self.next_index = 0;
        self.origin = self.last_seen;
        Ok(())
    }
}
