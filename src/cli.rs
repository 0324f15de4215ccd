//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::config::MonitorKind;
use clap::Parser;
use std::path::PathBuf;

/// gradtop - sampled gradient and weight norm monitoring
///
/// Trains a small demo network with hooks attached to every leaf module and
/// reports per-parameter gradient and weight norms every N steps.
///
/// Examples:
///   gradtop
///   gradtop --every 5 --steps 500
///   gradtop --monitor jsonl --metrics-out metrics.jsonl
///   gradtop --format json --output summary.json
///   gradtop --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file
    ///
    /// If not specified, looks for .gradtop.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Report to the monitor every N training steps
    #[arg(short, long, value_name = "N", env = "GRADTOP_EVERY")]
    pub every: Option<usize>,

    /// Number of training steps to run
    #[arg(short, long, value_name = "COUNT")]
    pub steps: Option<usize>,

    /// SGD learning rate for the demo model
    #[arg(long, value_name = "RATE")]
    pub learning_rate: Option<f32>,

    /// Monitor that receives the reports
    #[arg(short, long, value_name = "KIND")]
    pub monitor: Option<MonitorKind>,

    /// Metrics file for the jsonl monitor
    #[arg(long, value_name = "FILE")]
    pub metrics_out: Option<PathBuf>,

    /// Record the share of non-positive output gradients per leaf module
    #[arg(long)]
    pub activation_stats: bool,

    /// Exclude the output bias from training
    #[arg(long)]
    pub freeze_head_bias: bool,

    /// Output file path for the run summary
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Summary format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Generate a default .gradtop.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.every == Some(0) {
            return Err("--every must be at least 1".to_string());
        }

        if self.steps == Some(0) {
            return Err("--steps must be at least 1".to_string());
        }

        if let Some(lr) = self.learning_rate {
            if lr.is_nan() || lr <= 0.0 {
                return Err("--learning-rate must be positive".to_string());
            }
        }

        if self.metrics_out.is_some() && self.monitor.is_some_and(|m| m != MonitorKind::Jsonl) {
            return Err("--metrics-out only applies to --monitor jsonl".to_string());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args {
            config: None,
            every: None,
            steps: None,
            learning_rate: None,
            monitor: None,
            metrics_out: None,
            activation_stats: false,
            freeze_head_bias: false,
            output: None,
            format: OutputFormat::Markdown,
            verbose: false,
            quiet: false,
            init_config: false,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(make_args().validate().is_ok());
    }

    #[test]
    fn test_validation_zero_interval() {
        let mut args = make_args();
        args.every = Some(0);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_metrics_out_needs_jsonl() {
        let mut args = make_args();
        args.metrics_out = Some(PathBuf::from("m.jsonl"));
        args.monitor = Some(MonitorKind::Log);
        assert!(args.validate().is_err());

        args.monitor = Some(MonitorKind::Jsonl);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_parse_from_command_line() {
        let args = Args::try_parse_from([
            "gradtop",
            "--every",
            "4",
            "--monitor",
            "jsonl",
            "--format",
            "json",
            "--activation-stats",
        ])
        .unwrap();
        assert_eq!(args.every, Some(4));
        assert_eq!(args.monitor, Some(MonitorKind::Jsonl));
        assert_eq!(args.format, OutputFormat::Json);
        assert!(args.activation_stats);
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
