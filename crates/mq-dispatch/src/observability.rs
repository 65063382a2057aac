//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use crate::error::ConfigurationError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "observability_tests.rs"]
mod tests;

/// Filter from `RUST_LOG`, falling back to the configured level
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigurationError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(&config.level).map_err(|e| ConfigurationError::Invalid {
        message: format!("logging.level '{}' is not a valid filter: {}", config.level, e),
    })
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, which leaves the
/// existing one in place.
pub fn init_logging(config: &LoggingConfig) -> Result<bool, ConfigurationError> {
    let registry = tracing_subscriber::registry().with(build_filter(config)?);

    let installed = if config.json_format {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    Ok(installed.is_ok())
}
