//! Logging system setup
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` wins over the
//! configured level when it is set.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Builds the filter for `level`, preferring `RUST_LOG` when present.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initializes the logging system, human readable or JSON.
///
/// # Errors
/// Fails when a global subscriber is already installed.
pub fn setup_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = build_filter(&settings.level);

    if settings.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(false))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_setup_only_once() {
        let settings = LoggingSettings::default();
        // Another test may have installed a subscriber first, so only the
        // second call has a known outcome.
        let _ = setup_logging(&settings);
        let second = setup_logging(&LoggingSettings {
            json_format: true,
            ..settings
        });

        assert!(second.is_err());
    }
}
