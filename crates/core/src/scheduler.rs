//! Display-clock driven frame scheduling.
//!
//! A [`FrameScheduler`] admits at most one frame at a time. Each tick in
//! `Idle` polls the source; a new frame moves the scheduler to `Processing`
//! and runs through the [`FramePipeline`] on the blocking pool. The outcome
//! goes through a one-slot channel to the presenter stage, which alone owns
//! the [`DisplaySink`] and returns the scheduler to `Idle` after presenting.
//! Ticks that arrive while a frame is in flight are counted and dropped.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::pipeline::FramePipeline;
use crate::sink::DisplaySink;
use crate::source::FrameSource;
use crate::types::PixelBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Processing,
    Stopped,
}

/// What a finished frame job hands to the presenter.
#[derive(Debug)]
pub enum FrameOutcome {
    Styled(PixelBuffer),
    /// The job failed; the source frame is shown unconverted.
    Fallback {
        original: PixelBuffer,
        error: PipelineError,
    },
}

impl FrameOutcome {
    /// The single point where frame errors turn into a fallback frame. A
    /// panicked job counts as an inference failure.
    pub fn from_job_result(
        original: PixelBuffer,
        result: std::result::Result<std::result::Result<PixelBuffer, PipelineError>, JoinError>,
    ) -> Self {
        match result {
            Ok(Ok(styled)) => Self::Styled(styled),
            Ok(Err(error)) => Self::Fallback { original, error },
            Err(join_error) => Self::Fallback {
                original,
                error: PipelineError::InferenceFailed(format!("frame job panicked: {join_error}")),
            },
        }
    }

    pub fn frame(&self) -> &PixelBuffer {
        match self {
            Self::Styled(frame) => frame,
            Self::Fallback { original, .. } => original,
        }
    }

    pub fn into_frame(self) -> PixelBuffer {
        match self {
            Self::Styled(frame) => frame,
            Self::Fallback { original, .. } => original,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Stopped,
    /// A frame is still in flight; this tick was dropped.
    Busy,
    NoFrame,
    Admitted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub ticks: u64,
    pub admitted: u64,
    pub presented: u64,
    pub fallbacks: u64,
    pub backpressure_drops: u64,
    pub idle_ticks: u64,
    pub loops: u64,
    pub suppressed: u64,
    pub present_errors: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    admitted: AtomicU64,
    presented: AtomicU64,
    fallbacks: AtomicU64,
    backpressure_drops: AtomicU64,
    idle_ticks: AtomicU64,
    loops: AtomicU64,
    suppressed: AtomicU64,
    present_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

struct Shared {
    state: Mutex<SchedulerState>,
    state_tx: watch::Sender<SchedulerState>,
    counters: Counters,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, guard: &mut MutexGuard<'_, SchedulerState>, next: SchedulerState) {
        **guard = next;
        self.state_tx.send_replace(next);
    }

    fn stop(&self) {
        let mut state = self.lock_state();
        if *state != SchedulerState::Stopped {
            self.transition(&mut state, SchedulerState::Stopped);
        }
    }

    fn summary(&self) -> SessionSummary {
        let c = &self.counters;
        SessionSummary {
            ticks: c.ticks.load(Ordering::SeqCst),
            admitted: c.admitted.load(Ordering::SeqCst),
            presented: c.presented.load(Ordering::SeqCst),
            fallbacks: c.fallbacks.load(Ordering::SeqCst),
            backpressure_drops: c.backpressure_drops.load(Ordering::SeqCst),
            idle_ticks: c.idle_ticks.load(Ordering::SeqCst),
            loops: c.loops.load(Ordering::SeqCst),
            suppressed: c.suppressed.load(Ordering::SeqCst),
            present_errors: c.present_errors.load(Ordering::SeqCst),
        }
    }
}

/// Stops a running scheduler from outside the tick loop.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// Once this returns, no further frame is presented.
    pub fn stop(&self) {
        self.shared.stop();
    }
}

pub struct FrameScheduler {
    source: Box<dyn FrameSource>,
    pipeline: Arc<Mutex<FramePipeline>>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SchedulerState>,
    outcome_tx: Option<mpsc::Sender<FrameOutcome>>,
    in_flight: Option<JoinHandle<()>>,
    presenter: Option<JoinHandle<Result<()>>>,
}

impl FrameScheduler {
    /// Starts the presenter stage. Must be called inside a tokio runtime.
    pub fn start<S, K>(source: S, pipeline: FramePipeline, sink: K) -> Self
    where
        S: FrameSource + 'static,
        K: DisplaySink,
    {
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::Idle),
            state_tx,
            counters: Counters::default(),
        });
        let (outcome_tx, outcome_rx) = mpsc::channel(1);
        let presenter = spawn_presenter(sink, outcome_rx, shared.clone());

        Self {
            source: Box::new(source),
            pipeline: Arc::new(Mutex::new(pipeline)),
            shared,
            state_rx,
            outcome_tx: Some(outcome_tx),
            in_flight: None,
            presenter: Some(presenter),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.shared.lock_state()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn summary(&self) -> SessionSummary {
        self.shared.summary()
    }

    /// Resolves once no frame is in flight.
    pub async fn wait_until_idle(&self) {
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx
            .wait_for(|state| *state != SchedulerState::Processing)
            .await;
    }

    /// Handles one display tick at instant `at`. Source errors are returned;
    /// frame conversion errors never are.
    pub fn tick(&mut self, at: Instant) -> Result<TickOutcome> {
        bump(&self.shared.counters.ticks);
        match *self.shared.lock_state() {
            SchedulerState::Stopped => return Ok(TickOutcome::Stopped),
            SchedulerState::Processing => {
                bump(&self.shared.counters.backpressure_drops);
                return Ok(TickOutcome::Busy);
            }
            SchedulerState::Idle => {}
        }

        let mut has_new = self.source.has_new_frame(at);
        if !has_new && self.source.is_end_of_stream() {
            self.source
                .seek_to_start()
                .context("failed to seek frame source to start")?;
            let loops = bump(&self.shared.counters.loops);
            debug!(loops, "Frame source looped to start");
            has_new = self.source.has_new_frame(at);
        }

        let frame = if has_new {
            self.source.take_frame(at).context("failed to read frame from source")?
        } else {
            None
        };
        let Some(frame) = frame else {
            bump(&self.shared.counters.idle_ticks);
            return Ok(TickOutcome::NoFrame);
        };

        {
            // Only this method leaves Idle, so the state is Idle or Stopped.
            let mut state = self.shared.lock_state();
            if *state == SchedulerState::Stopped {
                return Ok(TickOutcome::Stopped);
            }
            self.shared.transition(&mut state, SchedulerState::Processing);
        }
        bump(&self.shared.counters.admitted);
        self.dispatch(frame)?;
        Ok(TickOutcome::Admitted)
    }

    fn dispatch(&mut self, frame: PixelBuffer) -> Result<()> {
        let outcome_tx = self
            .outcome_tx
            .clone()
            .ok_or_else(|| anyhow!("scheduler is shut down"))?;
        let pipeline = self.pipeline.clone();
        let shared = self.shared.clone();

        self.in_flight = Some(tokio::spawn(async move {
            let original = frame.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut pipeline = pipeline
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                pipeline.process(&frame)
            })
            .await;

            let outcome = FrameOutcome::from_job_result(original, result);
            if let FrameOutcome::Fallback { error, .. } = &outcome {
                let fallbacks = bump(&shared.counters.fallbacks);
                warn!(
                    kind = error.kind(),
                    error = %error,
                    fallbacks,
                    "Frame conversion failed; presenting original frame"
                );
            }
            let _ = outcome_tx.send(outcome).await;
        }));
        Ok(())
    }

    /// Stops the scheduler, waits for the in-flight job and the presenter,
    /// and finishes the sink.
    pub async fn shutdown(mut self) -> Result<SessionSummary> {
        self.shared.stop();
        self.outcome_tx = None;

        if let Some(job) = self.in_flight.take() {
            if let Err(join_error) = job.await {
                warn!(error = %join_error, "Frame job task failed during shutdown");
            }
        }

        let finished = match self.presenter.take() {
            Some(presenter) => presenter
                .await
                .map_err(|join_error| anyhow!("presenter task panicked: {join_error}"))
                .and_then(|result| result),
            None => Ok(()),
        };

        finished.context("failed to finish display sink")?;
        Ok(self.shared.summary())
    }
}

fn spawn_presenter<K: DisplaySink>(
    mut sink: K,
    mut outcomes: mpsc::Receiver<FrameOutcome>,
    shared: Arc<Shared>,
) -> JoinHandle<Result<()>> {
    tokio::task::spawn_blocking(move || {
        while let Some(outcome) = outcomes.blocking_recv() {
            // Presenting under the state lock makes stop() a barrier.
            let mut state = shared.lock_state();
            if *state == SchedulerState::Stopped {
                bump(&shared.counters.suppressed);
                continue;
            }
            let frame = outcome.into_frame();
            match panic::catch_unwind(AssertUnwindSafe(|| sink.present(frame))) {
                Ok(Ok(())) => {
                    bump(&shared.counters.presented);
                }
                Ok(Err(error)) => {
                    bump(&shared.counters.present_errors);
                    warn!(error = %format!("{error:#}"), "Display sink rejected frame");
                }
                Err(payload) => {
                    bump(&shared.counters.present_errors);
                    warn!(panic = panic_message(payload.as_ref()), "Display sink panicked");
                }
            }
            shared.transition(&mut state, SchedulerState::Idle);
        }
        sink.finish()
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub refresh_hz: u32,
    /// Stop after this long. `None` runs until stopped.
    pub duration: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            refresh_hz: 60,
            duration: None,
        }
    }
}

/// Drives a scheduler from a tokio interval at the display refresh rate
/// until the duration elapses or `stop` turns true.
pub async fn run_session<S, K>(
    source: S,
    pipeline: FramePipeline,
    sink: K,
    options: SessionOptions,
    mut stop: watch::Receiver<bool>,
) -> Result<SessionSummary>
where
    S: FrameSource + 'static,
    K: DisplaySink,
{
    let refresh_hz = options.refresh_hz.max(1);
    let period = Duration::from_secs_f64(1.0 / f64::from(refresh_hz));
    let deadline = options
        .duration
        .map(|duration| tokio::time::Instant::now() + duration);

    let mut scheduler = FrameScheduler::start(source, pipeline, sink);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        refresh_hz,
        duration_secs = ?options.duration.map(|d| d.as_secs_f64()),
        "Session started"
    );

    let driven: Result<()> = loop {
        if *stop.borrow() {
            break Ok(());
        }
        tokio::select! {
            tick = interval.tick() => {
                if deadline.is_some_and(|deadline| tick >= deadline) {
                    break Ok(());
                }
                match scheduler.tick(tick.into_std()) {
                    Ok(TickOutcome::Stopped) => break Ok(()),
                    Ok(_) => {}
                    Err(error) => break Err(error),
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break Ok(());
                }
            }
        }
    };

    let summary = scheduler.shutdown().await?;
    driven?;
    Ok(summary)
}
