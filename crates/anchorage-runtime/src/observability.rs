//! Logging initialisation
//!
//! Every crate logs through `tracing`. Hosts that do not install their own
//! subscriber call [`init_logging`] once at startup; the filter is read
//! from `ANCHORAGE_LOG` and falls back to `info`.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable holding the log filter directives
pub const LOG_ENV: &str = "ANCHORAGE_LOG";

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Output format of the global subscriber
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, for development
    #[default]
    Pretty,
    /// One JSON object per line, for log shipping
    Json,
}

/// Errors emitted when configuring the tracing subscriber
#[derive(Debug, Error)]
pub enum InitError {
    #[error("logging has already been initialised")]
    AlreadyInitialised,

    #[error("failed to install subscriber: {0}")]
    Install(String),
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global tracing subscriber
pub fn init_logging(format: LogFormat) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let installed = match format {
        LogFormat::Pretty => Registry::default()
            .with(filter())
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => Registry::default()
            .with(filter())
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            )
            .try_init(),
    };
    installed.map_err(|e| InitError::Install(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        // Another test binary may have installed a subscriber already; only
        // the once-guard is asserted here.
        let _ = init_logging(LogFormat::Json);
        assert!(matches!(
            init_logging(LogFormat::Pretty),
            Err(InitError::AlreadyInitialised)
        ));
    }

    #[test]
    fn test_format_from_config() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}
