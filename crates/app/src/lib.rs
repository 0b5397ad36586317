use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use stylecast_core::compute::{ComputeBackend, CpuComputeBackend};
use stylecast_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use stylecast_core::engine::{IdentityEngine, InferenceEngine, OrtEngine};
use stylecast_core::logging::{self, LoggingOptions, DEFAULT_LOG_FILTER};
use stylecast_core::model_inspect::{describe_inspection, inspect_onnx};
use stylecast_core::model_spec::resolve_model_io;
use stylecast_core::pipeline::FramePipeline;
use stylecast_core::scheduler::{run_session, SessionOptions, SessionSummary};
use stylecast_core::session::SessionConfig;
use stylecast_core::sink::{DisplaySink, NullSink, RawVideoSink};
use stylecast_core::source::FrameSource;
use stylecast_core::types::{ElementType, ValueRange};
use stylecast_core::video_input::FfmpegFrameSource;

/// `--model` value that selects the built-in pass-through engine.
const IDENTITY_MODEL: &str = "identity";

#[derive(Parser, Debug)]
#[command(
    name = "stylecast",
    version,
    about = "Real-time neural style transfer over a video frame stream"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Style a video in real time at the display refresh rate.
    Run(RunArgs),
    /// Print a model's inputs, outputs and resolved tensor layout.
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short = 'm', long, help = "ONNX style model, or `identity` for a pass-through")]
    model: String,
    #[arg(short = 'i', long, help = "Input video, looped until the session ends")]
    input: PathBuf,
    #[arg(
        short = 'o',
        long,
        help = "Raw video output file, or `-` for stdout. Frames are discarded when omitted"
    )]
    output: Option<String>,
    #[arg(short = 'd', long, value_name = "SECS", value_parser = parse_duration)]
    duration: Option<Duration>,
    #[arg(long, help = "Inference backend override: cuda, tensorrt or cpu")]
    backend: Option<String>,
    #[arg(long, value_name = "RANGE", value_parser = parse_value_range)]
    value_range: Option<ValueRange>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    model: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputTarget {
    Discard,
    Stdout,
    File(PathBuf),
}

impl OutputTarget {
    fn parse(value: Option<&str>) -> Self {
        match value {
            None => Self::Discard,
            Some("-") => Self::Stdout,
            Some(path) => Self::File(PathBuf::from(path)),
        }
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("`{value}` is not a number of seconds"))?;
    if !(secs.is_finite() && secs > 0.0) {
        return Err(format!("duration must be positive, got {value}"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

fn parse_value_range(value: &str) -> Result<ValueRange, String> {
    ValueRange::parse(value).ok_or_else(|| format!("unknown value range `{value}` (use 0-1 or 0-255)"))
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let bundled_ort = stylecast_core::runtime::setup_runtime_libs();
    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    stylecast_core::runtime::log_runtime_lib_status();
    if let Some(path) = bundled_ort {
        info!(path = %path.display(), "Using bundled ONNX Runtime");
    }
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir, cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_stream(args, config, &resolved_data_dir).await,
        Commands::Inspect(args) => inspect_model(&args.model, &config),
    }
}

fn load_config(data_dir: &Path, explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        return AppConfig::load_from_path(path);
    }

    if let Err(error) = initialize_data_dir(data_dir) {
        warn!(error = %error, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => Ok(config),
        Err(error) => {
            warn!(error = %error, "Failed to load config file, using defaults");
            Ok(AppConfig::default())
        }
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = logging::install_crash_hook(data_dir);
    if let Err(error) = &crash_hook {
        eprintln!("Warning: crash reports disabled: {error:#}");
    }

    let options = LoggingOptions {
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        env_filter: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::resolve_filters(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let file_error = match logging::open_log_file(data_dir, options.retention_files) {
        Ok(log_file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log_file.appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
            None
        }
        Err(error) => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
            Some(error)
        }
    };

    if let Some(error) = file_error {
        warn!(error = %format!("{error:#}"), "File logging unavailable, logging to console only");
    }
    match crash_hook {
        Ok(status) => info!(crash_dir = %status.crash_dir().display(), "Crash reports enabled"),
        Err(error) => warn!(error = %format!("{error:#}"), "Crash reports disabled"),
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Looks the model up under the configured models directory when the given
/// path does not exist as-is.
fn resolve_model_path(model: &Path, models_dir: &Path) -> PathBuf {
    if model.is_absolute() || model.exists() {
        return model.to_path_buf();
    }
    let candidate = models_dir.join(model);
    if candidate.exists() {
        candidate
    } else {
        model.to_path_buf()
    }
}

async fn run_stream(args: RunArgs, mut config: AppConfig, data_dir: &Path) -> Result<()> {
    if let Some(backend) = args.backend {
        config.model.backend = backend;
    }
    if args.value_range.is_some() {
        config.model.value_range = args.value_range;
    }
    let mut options = config.pipeline_options();

    let source = FfmpegFrameSource::open(&args.input, config.pipeline.pixel_format)
        .with_context(|| format!("failed to open input video {}", args.input.display()))?;
    let info = source.info().clone();
    info!(
        input = %args.input.display(),
        width = info.width,
        height = info.height,
        fps = info.fps,
        "Input video"
    );

    let engine: Box<dyn InferenceEngine> = if args.model == IDENTITY_MODEL {
        let range = options.resolve.value_range.unwrap_or(ValueRange::Unit);
        options.resolve.value_range = Some(range);
        Box::new(IdentityEngine::planar(
            info.width,
            info.height,
            ElementType::F32,
            range,
        ))
    } else {
        let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
        let session_config = SessionConfig {
            model_path: resolve_model_path(Path::new(&args.model), &models_dir),
            backend: config.model.backend(),
            trt_cache_dir: Some(resolve_relative_to(data_dir, &config.paths.trt_cache_dir)),
        };
        info!(
            model = %session_config.model_path.display(),
            backend = %session_config.backend,
            "Loading style model"
        );
        let engine = tokio::task::spawn_blocking(move || OrtEngine::load(&session_config))
            .await
            .context("model loading task failed")??;
        Box::new(engine)
    };

    let compute: Arc<dyn ComputeBackend> =
        Arc::new(CpuComputeBackend::new(config.pipeline.workgroup()));
    let pipeline = FramePipeline::load(engine, compute, &options)?;
    info!(
        spec = %serde_json::to_string(pipeline.spec()).unwrap_or_default(),
        "Resolved model IO"
    );

    let session_options = SessionOptions {
        refresh_hz: config.pipeline.refresh_hz,
        duration: args.duration,
    };
    let summary = match OutputTarget::parse(args.output.as_deref()) {
        OutputTarget::Discard => drive(source, pipeline, NullSink::new(), session_options).await?,
        OutputTarget::Stdout => {
            drive(source, pipeline, RawVideoSink::new(io::stdout()), session_options).await?
        }
        OutputTarget::File(path) => {
            let file = File::create(&path)
                .with_context(|| format!("failed to create output file {}", path.display()))?;
            info!(
                output = %path.display(),
                format = %config.pipeline.pixel_format,
                "Writing raw video"
            );
            let sink = RawVideoSink::new(BufWriter::new(file));
            drive(source, pipeline, sink, session_options).await?
        }
    };

    info!(
        ticks = summary.ticks,
        admitted = summary.admitted,
        presented = summary.presented,
        fallbacks = summary.fallbacks,
        backpressure_drops = summary.backpressure_drops,
        loops = summary.loops,
        "Session finished"
    );
    // Stdout may carry video, so the summary goes to stderr.
    eprintln!("{}", format_summary(&summary));
    Ok(())
}

async fn drive<S, K>(
    source: S,
    pipeline: FramePipeline,
    sink: K,
    options: SessionOptions,
) -> Result<SessionSummary>
where
    S: FrameSource + 'static,
    K: DisplaySink,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping session");
            let _ = stop_tx.send(true);
        }
    });

    let result = run_session(source, pipeline, sink, options, stop_rx).await;
    interrupt.abort();
    result
}

fn format_summary(summary: &SessionSummary) -> String {
    let mut out = format!(
        "ticks: {}\nadmitted: {}\npresented: {}\nfallbacks: {}\nbackpressure drops: {}\nloops: {}",
        summary.ticks,
        summary.admitted,
        summary.presented,
        summary.fallbacks,
        summary.backpressure_drops,
        summary.loops
    );
    if summary.present_errors > 0 {
        out.push_str(&format!("\npresent errors: {}", summary.present_errors));
    }
    out
}

fn inspect_model(model: &Path, config: &AppConfig) -> Result<()> {
    if !model.is_file() {
        bail!("model file not found: {}", model.display());
    }
    let inspection = inspect_onnx(model)?;
    let description = describe_inspection(&inspection);
    let report = match resolve_model_io(&description, &config.pipeline_options().resolve) {
        Ok(spec) => serde_json::json!({ "model": inspection, "io_spec": spec }),
        Err(error) => serde_json::json!({
            "model": inspection,
            "io_spec": null,
            "error": error.to_string(),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}



#[cfg(test)]
mod summary_tests {
    use super::*;

    #[test]
    fn summary_lists_counters() {
        let summary = SessionSummary {
            ticks: 180,
            admitted: 60,
            presented: 60,
            fallbacks: 2,
            backpressure_drops: 5,
            loops: 1,
            ..Default::default()
        };
        let text = format_summary(&summary);

        assert!(text.contains("ticks: 180"));
        assert!(text.contains("fallbacks: 2"));
        assert!(text.contains("backpressure drops: 5"));
        assert!(text.contains("loops: 1"));
        assert!(!text.contains("present errors"));
    }

    #[test]
    fn summary_mentions_present_errors_when_any() {
        let summary = SessionSummary {
            present_errors: 3,
            ..Default::default()
        };
        assert!(format_summary(&summary).ends_with("present errors: 3"));
    }
}
