//! Command-line argument parsing
//!
//! Every flag except `--config` and `--check` overrides a value from the
//! configuration file.

use clap::Parser;
use std::path::PathBuf;

/// Spawn point scanner
///
/// Covers the configured work rectangles with sample points, polls each one
/// with a pool of accounts and writes the merged sightings, spawn schedules,
/// stops and gyms to the output directory.
#[derive(Parser, Debug, Clone)]
#[command(name = "spawnscan", author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file (`.toml`, anything else is read as JSON)
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Print the step count, area and time estimate, then exit without logging in
    #[arg(long)]
    pub check: bool,

    /// Sampling radius in metres
    #[arg(short, long)]
    pub radius: Option<f64>,

    /// Error margin applied to the tiling steps, in [0, 1)
    #[arg(short, long)]
    pub error: Option<f64>,

    /// Output directory for the result files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of passes over the area
    #[arg(long)]
    pub passes: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.json"),
            check: false,
            radius: None,
            error: None,
            output: None,
            passes: None,
            log_level: None,
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default() {
        let args = Args::try_parse_from(["spawnscan"]).unwrap();
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert!(!args.check);
        assert!(args.radius.is_none());
        assert!(args.error.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::try_parse_from([
            "spawnscan", "-c", "city.toml", "--check", "-r", "70", "-e", "0.1", "-o", "out", "--passes", "2", "-l",
            "debug", "--json-logs",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("city.toml"));
        assert!(args.check);
        assert_eq!(args.radius, Some(70.0));
        assert_eq!(args.error, Some(0.1));
        assert_eq!(args.output, Some(PathBuf::from("out")));
        assert_eq!(args.passes, Some(2));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }

    #[test]
    fn test_args_reject_bad_numbers() {
        assert!(Args::try_parse_from(["spawnscan", "--radius", "wide"]).is_err());
        assert!(Args::try_parse_from(["spawnscan", "--passes", "-1"]).is_err());
    }
}
