//! Video file playback through an `ffmpeg` subprocess.
//!
//! The file is probed once with `ffprobe`, then decoded to raw 4-channel
//! frames on a background thread. The decode thread runs at most one frame
//! ahead of the consumer. `take_frame` drains every frame up to the one due
//! now and waits at most [`MAX_CATCH_UP_WAIT`] for the decoder to get there.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::source::{due_index, FrameSource};
use crate::types::{pixel_byte_len, PixelBuffer, PixelFormat};

const DEFAULT_FPS: f64 = 23.976;

/// Upper bound on how long one `take_frame` call waits for due frames.
pub const MAX_CATCH_UP_WAIT: Duration = Duration::from_millis(25);

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den > 0.0).then(|| num / den)
        }
        None => s.trim().parse().ok(),
    }
}

fn parse_probe(json: &[u8]) -> Result<VideoStreamInfo> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;
    let stream = probe
        .streams
        .first()
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = stream
        .width
        .filter(|w| *w > 0)
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = stream
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let fps_str = stream
        .r_frame_rate
        .as_deref()
        .or(stream.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let fps = match parse_frame_rate(fps_str) {
        Some(fps) if fps > 0.0 => fps,
        _ => {
            warn!("could not determine frame rate (got {fps_str}), defaulting to {DEFAULT_FPS}");
            DEFAULT_FPS
        }
    };

    Ok(VideoStreamInfo { width, height, fps })
}

pub fn probe_video(path: &Path) -> Result<VideoStreamInfo> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-select_streams",
            "v:0",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_probe(&output.stdout)
}

fn build_decoder_args(path: &Path, format: PixelFormat) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        format.ffmpeg_pix_fmt().to_string(),
        "-vsync".to_string(),
        "cfr".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]
}

/// One ffmpeg process writing raw frames to stdout. Killed on drop.
struct RawVideoDecoder {
    child: Child,
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_size: usize,
    stderr_thread: Option<thread::JoinHandle<()>>,
}

impl RawVideoDecoder {
    fn spawn(path: &Path, info: &VideoStreamInfo, format: PixelFormat) -> Result<Self> {
        let mut child = crate::runtime::command_for("ffmpeg")
            .args(build_decoder_args(path, format))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stderr not available"))?;
        let stderr_thread = thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if !line.is_empty() => debug!(target: "ffmpeg_stderr", "{}", line),
                    Err(e) => {
                        debug!(target: "ffmpeg_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            child,
            width: info.width,
            height: info.height,
            format,
            frame_size: pixel_byte_len(info.width, info.height),
            stderr_thread: Some(stderr_thread),
        })
    }

    fn read_frame(&mut self) -> Result<Option<PixelBuffer>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut buf = vec![0u8; self.frame_size];
        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut buf[total_read..]) {
                Ok(0) => {
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read frame from ffmpeg stdout"),
            }
        }

        Ok(Some(PixelBuffer::new(
            self.width,
            self.height,
            self.format,
            buf,
        )?))
    }
}

impl Drop for RawVideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Background decode thread feeding a one-slot channel.
struct DecodeWorker {
    frames: Option<Receiver<Result<PixelBuffer>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DecodeWorker {
    fn start(path: &Path, info: &VideoStreamInfo, format: PixelFormat) -> Result<Self> {
        let mut decoder = RawVideoDecoder::spawn(path, info, format)?;
        let (tx, rx) = sync_channel(1);
        let handle = thread::Builder::new()
            .name("video-decode".to_string())
            .spawn(move || loop {
                match decoder.read_frame() {
                    Ok(Some(frame)) => {
                        if tx.send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            })
            .context("failed to spawn decode thread")?;

        Ok(Self {
            frames: Some(rx),
            handle: Some(handle),
        })
    }

    fn recv_until(&self, deadline: Instant) -> std::result::Result<Result<PixelBuffer>, RecvTimeoutError> {
        match &self.frames {
            Some(rx) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => Err(RecvTimeoutError::Disconnected),
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        // Closing the channel unblocks a pending send so the thread can exit.
        drop(self.frames.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Real-time playback of a video file as a [`FrameSource`].
pub struct FfmpegFrameSource {
    path: PathBuf,
    info: VideoStreamInfo,
    format: PixelFormat,
    worker: DecodeWorker,
    catch_up_wait: Duration,
    origin: Option<Instant>,
    last_seen: Option<Instant>,
    next_index: usize,
    exhausted: bool,
}

impl FfmpegFrameSource {
    pub fn open(path: &Path, format: PixelFormat) -> Result<Self> {
        let info = probe_video(path)?;
        debug!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.fps,
            "Opened video source"
        );
        let worker = DecodeWorker::start(path, &info, format)?;
        let catch_up_wait = Duration::from_secs_f64(1.0 / info.fps).min(MAX_CATCH_UP_WAIT);
        Ok(Self {
            path: path.to_path_buf(),
            info,
            format,
            worker,
            catch_up_wait,
            origin: None,
            last_seen: None,
            next_index: 0,
            exhausted: false,
        })
    }

    pub fn info(&self) -> &VideoStreamInfo {
        &self.info
    }

    fn observe(&mut self, at: Instant) -> Duration {
        let origin = *self.origin.get_or_insert(at);
        self.last_seen = Some(at);
        at.saturating_duration_since(origin)
    }
}

impl FrameSource for FfmpegFrameSource {
    fn has_new_frame(&mut self, at: Instant) -> bool {
        let elapsed = self.observe(at);
        !self.exhausted && due_index(elapsed, self.info.fps) >= self.next_index
    }

    fn take_frame(&mut self, at: Instant) -> Result<Option<PixelBuffer>> {
        let due = due_index(self.observe(at), self.info.fps);
        let deadline = Instant::now() + self.catch_up_wait;
        let mut newest = None;
        // Frames older than `due` are decoded and dropped here so the backlog
        // never outlives a single call.
        while !self.exhausted && self.next_index <= due {
            match self.worker.recv_until(deadline) {
                Ok(frame) => {
                    newest = Some(frame?);
                    self.next_index += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    debug!(
                        due,
                        next = self.next_index,
                        "Decoder behind playback, presenting newest decoded frame"
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(frames = self.next_index, "Video source reached end of file");
                    self.exhausted = true;
                }
            }
        }
        Ok(newest)
    }

    fn is_end_of_stream(&self) -> bool {
        match (self.exhausted, self.origin, self.last_seen) {
            (true, Some(origin), Some(last)) => {
                let shown = self.next_index as f64 / self.info.fps;
                last.saturating_duration_since(origin).as_secs_f64() >= shown
            }
            _ => false,
        }
    }

    fn seek_to_start(&mut self) -> Result<()> {
        self.worker = DecodeWorker::start(&self.path, &self.info, self.format)?;
        self.next_index = 0;
        self.exhausted = false;
        self.origin = self.last_seen;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_json_yields_stream_info() {
        let json = br#"{
            "streams": [
                {
                    "index": 0,
                    "codec_name": "h264",
                    "codec_type": "video",
                    "width": 1280,
                    "height": 720,
                    "pix_fmt": "yuv420p",
                    "r_frame_rate": "30000/1001",
                    "avg_frame_rate": "30000/1001"
                }
            ]
        }"#;
        let info = parse_probe(json).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert!((info.fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn missing_rate_defaults() {
        let json = br#"{"streams": [{"width": 64, "height": 32, "r_frame_rate": "0/0"}]}"#;
        assert_eq!(parse_probe(json).unwrap().fps, DEFAULT_FPS);
    }

    #[test]
    fn probe_without_video_is_an_error() {
        assert!(parse_probe(br#"{"streams": []}"#).is_err());
        assert!(parse_probe(br#"{"streams": [{"height": 32}]}"#).is_err());
        assert!(parse_probe(b"not json").is_err());
    }

    #[test]
    fn frame_rates_parse() {
        assert_eq!(parse_frame_rate("24/1"), Some(24.0));
        assert_eq!(parse_frame_rate("60"), Some(60.0));
        assert_eq!(parse_frame_rate("1/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn decoder_args_request_raw_frames() {
        let args = build_decoder_args(Path::new("clip.mp4"), PixelFormat::Bgra);
        let pix = args.iter().position(|a| a == "-pix_fmt").unwrap();
        assert_eq!(args[pix + 1], "bgra");
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        assert!(args.contains(&"0:v:0".to_string()));
    }

    fn shade(frame: &PixelBuffer) -> u8 {
        frame.data()[0]
    }

    /// Source over a fake decode thread that sends `count` frames, each
    /// shaded with its index, then waits for `hold` to close.
    fn fake_source(
        fps: f64,
        count: usize,
        catch_up_wait: Duration,
        hold: Receiver<()>,
    ) -> FfmpegFrameSource {
        let (tx, rx) = sync_channel(1);
        let handle = thread::spawn(move || {
            for index in 0..count {
                let frame = PixelBuffer::filled(4, 2, PixelFormat::Rgba, [index as u8, 0, 0, 255])
                    .map_err(anyhow::Error::from);
                if tx.send(frame).is_err() {
                    return;
                }
            }
            let _ = hold.recv();
        });
        FfmpegFrameSource {
            path: PathBuf::from("fake.mp4"),
            info: VideoStreamInfo {
                width: 4,
                height: 2,
                fps,
            },
            format: PixelFormat::Rgba,
            worker: DecodeWorker {
                frames: Some(rx),
                handle: Some(handle),
            },
            catch_up_wait,
            origin: None,
            last_seen: None,
            next_index: 0,
            exhausted: false,
        }
    }

    fn frames_ago(t0: Instant, fps: f64, frames: u32) -> Instant {
        t0 + Duration::from_secs_f64(f64::from(frames) / fps) + Duration::from_millis(1)
    }

    #[test]
    fn late_take_returns_the_newest_due_frame() {
        let (release, hold) = std::sync::mpsc::channel();
        let mut source = fake_source(30.0, 40, Duration::from_secs(5), hold);
        let t0 = Instant::now();

        assert_eq!(shade(&source.take_frame(t0).unwrap().unwrap()), 0);
        // Ten frame periods pass while the consumer is busy elsewhere.
        let later = frames_ago(t0, 30.0, 10);
        assert_eq!(shade(&source.take_frame(later).unwrap().unwrap()), 10);
        assert!(!source.has_new_frame(later));
        assert_eq!(
            shade(&source.take_frame(frames_ago(t0, 30.0, 11)).unwrap().unwrap()),
            11
        );
        drop(release);
    }

    #[test]
    fn slow_decoder_yields_newest_decoded_frame_within_the_wait() {
        let (release, hold) = std::sync::mpsc::channel();
        let wait = Duration::from_millis(200);
        let mut source = fake_source(30.0, 4, wait, hold);
        let t0 = Instant::now();
        source.take_frame(t0).unwrap();

        let started = Instant::now();
        let frame = source.take_frame(frames_ago(t0, 30.0, 10)).unwrap().unwrap();
        assert_eq!(shade(&frame), 3);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!source.is_end_of_stream());

        // Nothing new is decoded, so the next call comes back empty.
        assert!(source.take_frame(frames_ago(t0, 30.0, 11)).unwrap().is_none());
        drop(release);
    }

    #[test]
    fn decoder_exit_marks_end_of_stream() {
        let (release, hold) = std::sync::mpsc::channel();
        drop(release);
        let mut source = fake_source(30.0, 3, Duration::from_secs(5), hold);
        let t0 = Instant::now();

        let later = frames_ago(t0, 30.0, 10);
        source.take_frame(t0).unwrap();
        assert_eq!(shade(&source.take_frame(later).unwrap().unwrap()), 2);
        assert!(source.is_end_of_stream());
        assert!(!source.has_new_frame(later));
    }

    #[test]
    #[ignore = "requires ffmpeg and a test clip at STYLECAST_TEST_VIDEO"]
    fn decodes_a_real_file() {
        let path = std::env::var("STYLECAST_TEST_VIDEO").unwrap();
        let mut source = FfmpegFrameSource::open(Path::new(&path), PixelFormat::Rgba).unwrap();
        let t0 = Instant::now();
        let mut frame = None;
        for _ in 0..100 {
            frame = source.take_frame(t0).unwrap();
            if frame.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let frame = frame.expect("decoder produced no frame");
        assert_eq!(frame.size(), (source.info().width, source.info().height));
    }
}
