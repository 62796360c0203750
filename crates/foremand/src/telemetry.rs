//! Tracing setup for the supervisor process.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

use foreman_config::{Config, LogFormat};

static ACTIVE: OnceCell<LogFormat> = OnceCell::new();

/// Installs the global tracing subscriber on first call.
///
/// Later calls are no-ops so library consumers embedding the supervisor can
/// call this without tracking whether logging is already up.
pub fn initialise(config: &Config) -> Result<(), TelemetryError> {
    ACTIVE.get_or_try_init(|| {
        install(config)?;
        Ok(config.log_format())
    })?;
    Ok(())
}

fn install(config: &Config) -> Result<(), TelemetryError> {
    let directive = config.log_filter();
    let filter = EnvFilter::try_new(directive).map_err(|error| TelemetryError::Filter {
        directive,
        detail: error.to_string(),
    })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        // Colour only when a human is watching.
        .with_ansi(io::stderr().is_terminal());

    match config.log_format() {
        LogFormat::Json => builder.json().flatten_event(true).finish().try_init(),
        LogFormat::Compact => builder.compact().finish().try_init(),
    }
    .map_err(TelemetryError::Install)
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive derived from the debug level failed to parse.
    #[error("invalid log filter '{directive}': {detail}")]
    Filter {
        directive: &'static str,
        detail: String,
    },
    /// A subscriber was already installed outside this module.
    #[error("failed to install telemetry subscriber: {0}")]
    Install(#[source] TryInitError),
}
