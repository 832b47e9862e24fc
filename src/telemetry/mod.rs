//! Logging setup
//!
//! Installs a layered subscriber:
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, falling back to logging.level)
//!   └── Fmt Layer (text or json)
//! ```

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Logging initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    FilterError(String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    SubscriberError(String),
}

/// Build the filter: RUST_LOG wins over the configured level
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| TelemetryError::FilterError(format!("{}: {}", config.level, e))),
    }
}

/// Install the global subscriber
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = env_filter(config)?;

    let result = if config.format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer),
        )
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer),
        )
    };

    result.map_err(|e| TelemetryError::SubscriberError(e.to_string()))
}
