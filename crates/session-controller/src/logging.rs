//! Logging setup
//!
//! Installs a global `tracing` subscriber. `RUST_LOG` directives are honoured
//! on top of the configured level, so `RUST_LOG=sipline_session_controller=trace`
//! turns on per-iteration engine traces without touching the configuration.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{SessionError, SessionResult};

/// Line format written by the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line on stdout
    Json,
}

/// How session diagnostics are written
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Floor added to whatever `RUST_LOG` selects
    pub level: Level,
    pub format: LogFormat,
    /// Stamp each event with its source file and line
    pub source_locations: bool,
    /// Also log when spans open and close
    pub span_events: bool,
    /// Name reported on the startup line
    pub service: String,
}

impl LoggingConfig {
    pub fn new(level: Level, service: impl Into<String>) -> Self {
        Self {
            level,
            format: LogFormat::Text,
            source_locations: false,
            span_events: false,
            service: service.into(),
        }
    }

    pub fn with_json(self) -> Self {
        Self {
            format: LogFormat::Json,
            ..self
        }
    }

    pub fn with_source_locations(self) -> Self {
        Self {
            source_locations: true,
            ..self
        }
    }

    pub fn with_span_events(self) -> Self {
        Self {
            span_events: true,
            ..self
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(Level::INFO, "sipline")
    }
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already installed.
pub fn setup_logging(config: LoggingConfig) -> SessionResult<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.source_locations)
        .with_line_number(config.source_locations);

    let installed = match config.format {
        LogFormat::Json => builder.json().with_writer(std::io::stdout).try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| SessionError::config(format!("cannot install log subscriber: {}", e)))?;

    tracing::info!(service = %config.service, version = crate::VERSION, "Logging initialized");
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> SessionResult<Level> {
    Level::from_str(level).map_err(|_| SessionError::config(format!("Invalid log level: {}", level)))
}
