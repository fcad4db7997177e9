//! Tracing subscriber setup for the deployment tool.
//!
//! `RUST_LOG` takes precedence over the configured level when set.

use crate::config::ApplicationConfig;
use tracing_subscriber::EnvFilter;

/// Builds the filter: `RUST_LOG` when present, else `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init(config: &ApplicationConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.log_level))
        .with_target(false);
    if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_falls_back_to_level() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(env_filter("debug").to_string(), "debug");
        }
    }
}
