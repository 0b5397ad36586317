//! Log filter selection, the rolling log file and the crash report hook.
//!
//! Subscriber assembly lives in the binary; this module only decides what
//! goes where so the choices can be tested without a global subscriber.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime and decoder chatter hidden from the console unless asked for.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_FILE_PREFIX: &str = "stylecast";

/// Targets kept at debug in the log file even when the console silences them.
const FILE_VERBOSE_TARGETS: [&str; 1] = ["ffmpeg_stderr"];

static CRASH_HOOK_LOCK: Mutex<()> = Mutex::new(());
static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_WRITE_ACTIVE: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    /// Count of `-v` flags.
    pub verbose: u8,
    pub cli_filter: Option<String>,
    /// Value of `RUST_LOG`, if set.
    pub env_filter: Option<String>,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            verbose: 0,
            cli_filter: None,
            env_filter: None,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    /// The filter the user asked for, before noise suppression.
    pub requested: String,
    pub console: String,
    pub file: String,
}

/// Rolling daily log file under `<data_dir>/logs`.
#[derive(Debug)]
pub struct LogFile {
    pub dir: PathBuf,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashHookStatus {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
}

impl CrashHookStatus {
    pub fn crash_dir(&self) -> &Path {
        match self {
            Self::Installed(dir) | Self::AlreadyInstalled(dir) => dir,
        }
    }
}

/// Picks the active filter: `--log-filter`, then `-v`/`-vv`, then
/// `RUST_LOG`, then `info`. Noise suppression applies only when nothing was
/// requested explicitly on the command line.
pub fn resolve_filters(options: &LoggingOptions) -> LogFilters {
    let requested = if let Some(filter) = options.cli_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.env_filter.as_deref() {
        filter.to_string()
    } else {
        DEFAULT_LOG_FILTER.to_string()
    };

    let implicit = options.cli_filter.is_none() && options.verbose == 0;
    if !implicit {
        return LogFilters {
            console: requested.clone(),
            file: requested.clone(),
            requested,
        };
    }

    LogFilters {
        console: format!("{DEFAULT_NOISE_FILTER},{requested}"),
        file: format!("{},{requested}", file_noise_filter(DEFAULT_NOISE_FILTER)),
        requested,
    }
}

/// Same directives as `noise`, except decoder stderr stays at debug so the
/// log file keeps what the console hides.
fn file_noise_filter(noise: &str) -> String {
    let mut directives: Vec<String> = noise
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            let target = directive.split_once('=').map_or(*directive, |(t, _)| t.trim());
            !FILE_VERBOSE_TARGETS.contains(&target)
        })
        .map(str::to_string)
        .collect();
    directives.extend(FILE_VERBOSE_TARGETS.iter().map(|target| format!("{target}=debug")));
    directives.join(",")
}

pub fn open_log_file(data_dir: &Path, retention_files: usize) -> Result<LogFile> {
    let dir = data_dir.join(LOG_DIR_NAME);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let retention = if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    };
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(retention)
        .build(&dir)
        .with_context(|| format!("failed to open rolling log file in {}", dir.display()))?;

    Ok(LogFile { dir, appender })
}

pub fn crash_dir_for(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME)
}

/// Chains a panic hook that writes one report per panic under
/// `<data_dir>/logs/crash`. Installing twice keeps the first directory.
pub fn install_crash_hook(data_dir: &Path) -> Result<CrashHookStatus> {
    if let Some(existing) = CRASH_DIR.get() {
        return Ok(CrashHookStatus::AlreadyInstalled(existing.clone()));
    }

    let crash_dir = crash_dir_for(data_dir);
    fs::create_dir_all(&crash_dir)
        .with_context(|| format!("failed to create crash directory: {}", crash_dir.display()))?;

    let _guard = CRASH_HOOK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = CRASH_DIR.get() {
        return Ok(CrashHookStatus::AlreadyInstalled(existing.clone()));
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous(info);
    }));

    let _ = CRASH_DIR.set(crash_dir.clone());
    Ok(CrashHookStatus::Installed(crash_dir))
}

struct CrashReport {
    at: DateTime<Utc>,
    thread: String,
    location: String,
    message: String,
    backtrace_status: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_status, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => ("disabled (set RUST_BACKTRACE=1)", String::new()),
            BacktraceStatus::Unsupported => ("unsupported", String::new()),
            _ => ("unknown", String::new()),
        };

        Self {
            at: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: payload_message(info.payload()),
            backtrace_status,
            backtrace,
        }
    }

    fn write_to(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "crash-{}-{sequence:04}.log",
            self.at.format("%Y%m%dT%H%M%S%.6fZ")
        ));

        let mut file = fs::File::create(&path)?;
        writeln!(file, "time={}", self.at.to_rfc3339())?;
        writeln!(file, "thread={}", self.thread)?;
        writeln!(file, "location={}", self.location)?;
        writeln!(file, "message={}", self.message)?;
        writeln!(file, "backtrace={}", self.backtrace_status)?;
        if !self.backtrace.is_empty() {
            writeln!(file)?;
            writeln!(file, "{}", self.backtrace)?;
        }
        file.flush()?;
        Ok(path)
    }
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the report must not re-enter.
    if CRASH_WRITE_ACTIVE
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_to(crash_dir)
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "warning: could not write crash report to {}: {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "warning: crash reporter failed while writing to {}",
            crash_dir.display()
        ),
    }

    CRASH_WRITE_ACTIVE.store(false, Ordering::Release);
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
