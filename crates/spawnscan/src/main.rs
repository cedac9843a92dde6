//! spawnscan - Main Entry Point
//!
//! Loads the configuration, then either prints the workload estimate
//! (`--check`) or logs every account in, runs the scan passes and writes
//! the merged results.

mod cli;
mod config;
mod gateway;
mod logging;
mod output;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use scan_core::{Scanner, Shutdown};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::cli::Args;
use crate::config::AppConfig;
use crate::gateway::GatewayConnector;

#[tokio::main]
async fn main() -> Result<()> {
    let startup = Instant::now();
    let args = Args::parse();

    let mut config = AppConfig::load_from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    config.apply_args(&args);

    logging::setup_logging(&config.logging).context("Failed to initialize logging")?;
    info!("Starting spawnscan v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }
    log_configuration(&config);

    let scanner = build_scanner(&config)?;

    if args.check {
        println!("{}", check(&scanner)?);
        return Ok(());
    }

    let shutdown = Shutdown::new();
    let listener = signals::spawn_signal_listener(shutdown.clone());

    let report = scanner.run(shutdown.signal()).await.context("Scan failed")?;
    listener.abort();

    output::write_results(&config.output.directory, &report.merger)
        .await
        .context("Failed to write results")?;

    info!("Done in {:.2?}: {}", startup.elapsed(), report.summary);
    Ok(())
}

fn build_scanner(config: &AppConfig) -> Result<Scanner> {
    let connector = Arc::new(GatewayConnector::new(
        config.gateway.endpoint.clone(),
        config.gateway.request_timeout(),
    ));
    Ok(Scanner::new(config.scan.clone(), connector)?)
}

/// The `--check` report: the estimate line, plus a warning when the passes
/// would overlap.
fn check(scanner: &Scanner) -> Result<String> {
    let estimate = scanner.estimate()?;
    let mut report = estimate.to_string();
    if let Err(e) = scanner.preflight() {
        report.push('\n');
        report.push_str(&format!("Refusing to scan: {e}"));
    }
    Ok(report)
}

fn log_configuration(config: &AppConfig) {
    let settings = &config.scan.scanner;
    info!("Scan configuration:");
    info!("  Users: {} via {}", config.scan.users.len(), config.scan.auth_service);
    info!("  Work rectangles: {}", config.scan.work.len());
    info!("  Radius: {}m, error margin: {}", settings.radius, settings.error_margin);
    info!("  Passes: {} every {}s", settings.pass_count, settings.pass_interval_secs);
    info!("  Gateway: {}", config.gateway.endpoint);
    info!("  Output directory: {}", config.output.directory.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewaySettings, LoggingSettings, OutputSettings};
    use scan_core::{AuthProvider, BoundingRectangle, Credentials, ScanConfiguration, ScanSettings};

    fn app_config(users: usize, pass_count: u32) -> AppConfig {
        AppConfig {
            scan: ScanConfiguration {
                auth_service: AuthProvider::Ptc,
                users: (0..users)
                    .map(|i| Credentials {
                        username: format!("trainer{i}"),
                        password: "pw".to_string(),
                        auth_service: None,
                    })
                    .collect(),
                work: vec![BoundingRectangle::new(0.0, 0.0, 0.05, 0.05)],
                scanner: ScanSettings {
                    pass_count,
                    ..ScanSettings::default()
                },
            },
            gateway: GatewaySettings::default(),
            output: OutputSettings::default(),
            logging: LoggingSettings::default(),
        }
    }

    #[test]
    fn test_check_prints_estimate() {
        let scanner = build_scanner(&app_config(50, 1)).unwrap();
        let report = check(&scanner).unwrap();

        assert!(report.starts_with("Total of "));
        assert!(!report.contains("Refusing"));
    }

    #[test]
    fn test_check_flags_overlapping_passes() {
        let scanner = build_scanner(&app_config(1, 6)).unwrap();
        let report = check(&scanner).unwrap();

        assert!(report.contains("Refusing to scan"), "{report}");
    }

    #[test]
    fn test_invalid_config_does_not_build() {
        assert!(build_scanner(&app_config(0, 1)).is_err());
    }
}
