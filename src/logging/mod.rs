//! Logging subsystem
//!
//! Structured logging via tracing: JSON lines in production, plaintext in
//! development, RFC 3339 UTC timestamps. Every sink is wrapped in a
//! [`redact::RedactingMakeWriter`] so the API token never reaches a log.
//!
//! # Log Targets
//!
//! - `gateway` - startup, shutdown, entity lifecycle
//! - `http` - request dispatch
//! - `auth` - token gate
//! - `ws` - event bridge
//! - `tls` - certificate bootstrap
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `WALLET_GATEWAY_LOG` - primary filter (takes precedence)
//! - `RUST_LOG` - fallback filter

pub mod redact;

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use self::redact::RedactingMakeWriter;

/// Primary filter variable.
pub const LOG_ENV: &str = "WALLET_GATEWAY_LOG";

static INIT_GUARD: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Plaintext,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// Stderr keeps stdout free for the connection announcement.
    #[default]
    Stderr,
    Stdout,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Level used when neither filter variable is set.
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stderr,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Plaintext to stderr at debug level.
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stderr,
            default_level: Level::DEBUG,
        }
    }

    /// JSON to stderr at info level.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stderr,
            default_level: Level::INFO,
        }
    }

    pub fn for_mode(dev_mode: bool) -> Self {
        if dev_mode {
            Self::development()
        } else {
            Self::production()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("cannot open log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("invalid log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging is already set up")]
    AlreadyInitialized,
    #[error("cannot install subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// `WALLET_GATEWAY_LOG`, then `RUST_LOG`, then `default_level` for every target.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var(LOG_ENV) {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }

    let level = default_level.as_str().to_lowercase();
    let directives: Vec<String> = std::iter::once(level.clone())
        .chain(targets::ALL.iter().map(|t| format!("{}={}", t, level)))
        .collect();
    Ok(EnvFilter::try_new(directives.join(","))?)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(RedactingMakeWriter::new(io::stdout)),
        LogOutput::Stderr => BoxMakeWriter::new(RedactingMakeWriter::new(io::stderr)),
        LogOutput::File(path) => {
            let file = Arc::new(File::create(path)?);
            BoxMakeWriter::new(RedactingMakeWriter::new(file))
        }
    })
}

fn try_install(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config.default_level)?;
    let base = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(make_writer(&config.output)?);
    let layer = match config.format {
        LogFormat::Json => base.json().flatten_event(true).boxed(),
        LogFormat::Plaintext => base.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()?;
    Ok(())
}

/// Install the global subscriber. Only the first call succeeds.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }
    try_install(&config)
}

/// Log target names used across the crate.
pub mod targets {
    pub const GATEWAY: &str = "gateway";
    pub const HTTP: &str = "http";
    pub const AUTH: &str = "auth";
    pub const WS: &str = "ws";
    pub const TLS: &str = "tls";
    pub const CONFIG: &str = "config";

    pub const ALL: &[&str] = &[GATEWAY, HTTP, AUTH, WS, TLS, CONFIG];
}
