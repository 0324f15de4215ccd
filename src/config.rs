//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.gradtop.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = ".gradtop.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Hook aggregation settings.
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Demo training loop settings.
    #[serde(default)]
    pub demo: DemoConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Path of the end-of-run summary.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "gradtop_summary.md".to_string()
}

/// Hook aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Report to the monitor every N training steps.
    #[serde(default = "default_every_n_steps")]
    pub every_n_steps: usize,

    /// Record the share of non-positive output gradients per leaf module.
    #[serde(default)]
    pub activation_stats: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            every_n_steps: default_every_n_steps(),
            activation_stats: false,
        }
    }
}

fn default_every_n_steps() -> usize {
    10
}

/// Which monitor receives the reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    /// Log each report through tracing
    #[default]
    Log,
    /// Append each report to a JSON Lines file
    Jsonl,
    /// Hand reports to a background consumer thread
    Channel,
}

/// Monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Monitor implementation.
    #[serde(default)]
    pub kind: MonitorKind,

    /// Metrics file for the `jsonl` monitor.
    #[serde(default = "default_metrics_output")]
    pub output: String,

    /// Number of recent losses the `channel` consumer keeps.
    #[serde(default = "default_window")]
    pub window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            kind: MonitorKind::default(),
            output: default_metrics_output(),
            window: default_window(),
        }
    }
}

fn default_metrics_output() -> String {
    "gradtop_metrics.jsonl".to_string()
}

fn default_window() -> usize {
    30
}

/// Demo training loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Number of training steps.
    #[serde(default = "default_steps")]
    pub steps: usize,

    /// SGD learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// Hidden layer width.
    #[serde(default = "default_hidden")]
    pub hidden: usize,

    /// Size of the synthetic dataset.
    #[serde(default = "default_samples")]
    pub samples: usize,

    /// Exclude the output bias from training.
    #[serde(default)]
    pub freeze_head_bias: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            learning_rate: default_learning_rate(),
            hidden: default_hidden(),
            samples: default_samples(),
            freeze_head_bias: false,
        }
    }
}

fn default_steps() -> usize {
    200
}

fn default_learning_rate() -> f32 {
    0.05
}

fn default_hidden() -> usize {
    16
}

fn default_samples() -> usize {
    64
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        Self::load_from_dir(Path::new("."))
    }

    /// Try to load `.gradtop.toml` from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join(CONFIG_FILE);

        if config_path.exists() {
            Ok(Some(Self::load(&config_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings. Only values
    /// given explicitly on the command line override the file. Fails when
    /// `--metrics-out` is given but the resulting monitor is not `jsonl`.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) -> Result<()> {
        if let Some(every) = args.every {
            self.aggregator.every_n_steps = every;
        }
        if args.activation_stats {
            self.aggregator.activation_stats = true;
        }

        if let Some(kind) = args.monitor {
            self.monitor.kind = kind;
        }
        if let Some(ref path) = args.metrics_out {
            if self.monitor.kind != MonitorKind::Jsonl {
                anyhow::bail!(
                    "--metrics-out only applies to the jsonl monitor (configured: {:?})",
                    self.monitor.kind
                );
            }
            self.monitor.output = path.display().to_string();
        }

        if let Some(steps) = args.steps {
            self.demo.steps = steps;
        }
        if let Some(lr) = args.learning_rate {
            self.demo.learning_rate = lr;
        }
        if args.freeze_head_bias {
            self.demo.freeze_head_bias = true;
        }

        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }
        if args.verbose {
            self.general.verbose = true;
        }
        Ok(())
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.aggregator.every_n_steps == 0 {
            anyhow::bail!("aggregator.every_n_steps must be at least 1");
        }
        if self.demo.hidden == 0 || self.demo.samples == 0 {
            anyhow::bail!("demo.hidden and demo.samples must be at least 1");
        }
        if self.demo.learning_rate.is_nan() || self.demo.learning_rate <= 0.0 {
            anyhow::bail!("demo.learning_rate must be positive");
        }
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
