//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. The filter comes from `RUST_LOG`
//! when set, otherwise from the configured level; output is JSON or
//! human-readable text depending on [`LogFormat`].

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::{LogFormat, LoggingConfig};
use crate::core::error::{ApiServerError, ApiServerResult};

/// Build the env filter, preferring `RUST_LOG` over the configured default
pub fn env_filter(config: &LoggingConfig) -> ApiServerResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(format!(
            "apiserver_core={level},apiserver={level},audit={level},tower_http=warn",
            level = config.level
        ))
        .map_err(|e| ApiServerError::config(format!("Invalid log level '{}': {}", config.level, e))),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> ApiServerResult<()> {
    let filter = env_filter(config)?;
    let registry = Registry::default().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false).with_target(true))
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    result.map_err(|e| ApiServerError::config(format!("Failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_level() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "verbose".to_string(),
            format: LogFormat::Text,
        };
        assert!(env_filter(&config).is_err());
    }
}
