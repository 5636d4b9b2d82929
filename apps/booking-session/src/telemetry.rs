use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Keeps the non-blocking writer flushing for the life of the process.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Calling it again is a no-op.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let (env_filter, throttled_deps) = build_env_filter(config.level.to_filter());

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    if throttled_deps {
        tracing::info!(
            target = "booking.telemetry",
            "dependency traces capped at info; set BOOKING_TRACE_DEPS=1 or BOOKING_LOG_FILTER to lift"
        );
    }
    Ok(())
}

fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
    if let Ok(filter) = std::env::var("BOOKING_LOG_FILTER") {
        return (EnvFilter::new(filter), false);
    }
    let (filter, throttled) = default_filter_for(level, allow_dependency_traces());
    (EnvFilter::new(filter), throttled)
}

/// Crates whose trace output drowns the session's own events.
const NOISY_DEPENDENCIES: &[&str] = &[
    "hyper",
    "hyper_util",
    "tokio_tungstenite",
    "tungstenite",
    "reqwest",
    "rustls",
    "mio",
    "h2",
];

fn default_filter_for(level: LevelFilter, dependency_traces: bool) -> (String, bool) {
    let base = match level {
        LevelFilter::TRACE => "info,booking=trace,booking_session_core=trace",
        LevelFilter::DEBUG => "info,booking=debug,booking_session_core=debug",
        LevelFilter::INFO => "info",
        LevelFilter::WARN => "warn",
        LevelFilter::ERROR => "error",
        LevelFilter::OFF => "off",
    };
    if level != LevelFilter::TRACE || dependency_traces {
        return (base.to_owned(), false);
    }
    let capped = NOISY_DEPENDENCIES
        .iter()
        .map(|target| format!(",{target}=info"));
    (std::iter::once(base.to_owned()).chain(capped).collect(), true)
}

fn allow_dependency_traces() -> bool {
    std::env::var("BOOKING_TRACE_DEPS")
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
