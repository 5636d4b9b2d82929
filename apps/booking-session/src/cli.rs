use std::io;

use clap::{Args, Parser};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::{ConfigError, LivenessConfig, derive_realtime_url, normalize_base};
use crate::liveness::{CoreError, LivenessCore};
use crate::session::SessionSnapshot;
use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "booking-session",
    about = "Keep a booking client session alive and follow its realtime notifications",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "BOOKING_API_BASE",
        help = "Base URL of the booking API (scheme inferred when omitted)"
    )]
    pub api_base: Option<String>,

    #[arg(
        long,
        env = "BOOKING_REALTIME_URL",
        help = "Realtime endpoint when it is not served from the API origin"
    )]
    pub realtime_url: Option<String>,

    #[arg(long, help = "Bootstrap the session, print it and exit")]
    pub once: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "BOOKING_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "BOOKING_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<std::path::PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Core(#[from] CoreError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

impl Cli {
    /// Environment first, then explicit flags on top. A new API base
    /// re-derives the realtime endpoint unless one is given as well.
    pub fn liveness_config(&self) -> Result<LivenessConfig, CliError> {
        let mut config = LivenessConfig::from_env()?;
        if let Some(api_base) = &self.api_base {
            config.api_base = normalize_base(api_base)?;
            config.realtime_url = derive_realtime_url(&config.api_base)?;
        }
        if let Some(realtime) = &self.realtime_url {
            config = config.with_realtime_url(realtime)?;
        }
        Ok(config)
    }
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = cli.liveness_config()?;
    info!(
        target = "booking.cli",
        api = %config.api_base,
        realtime = %config.realtime_url,
        "starting"
    );
    let core = LivenessCore::build(config)?;
    let snapshot = core.start().await;
    print_snapshot(&snapshot);

    if cli.once {
        core.shutdown();
        return Ok(());
    }

    let mut states = core.realtime().subscribe_state();
    let mut messages = core.realtime().subscribe_messages();
    let mut sessions = core.session().subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("realtime: {state}");
            }
            message = messages.recv() => match message {
                Ok(event) => println!(
                    "event: {:?} appointment={} {}",
                    event.kind,
                    event
                        .appointment_id
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "-".into()),
                    event.title.as_deref().unwrap_or("")
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "booking.cli", skipped, "dropped realtime events");
                }
                Err(RecvError::Closed) => break,
            },
            changed = sessions.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = sessions.borrow_and_update().clone();
                print_snapshot(&snapshot);
            }
        }
    }

    core.shutdown();
    Ok(())
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    match snapshot.identity() {
        Some(identity) => println!(
            "session: {} <{}> verified={} roles={}",
            identity.id,
            identity.email,
            identity.email_verified,
            identity
                .roles
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(",")
        ),
        None => println!("session: unauthenticated"),
    }
}
