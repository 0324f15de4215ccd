//! gradtop - sampled gradient and weight norm monitoring
//!
//! Trains a small demo network with hooks on every leaf module and reports
//! per-parameter gradient and weight norms to the configured monitor.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (bad config, unwritable output, monitor failure, etc.)

use anyhow::{Context, Result};
use gradtop::cli::{Args, OutputFormat};
use gradtop::config::{Config, MonitorKind, CONFIG_FILE};
use gradtop::demo::{self, Dataset, DemoModel};
use gradtop::monitor::{ChannelMonitor, JsonlMonitor, LogMonitor, Monitor};
use gradtop::report::{self, SummaryMonitor};
use gradtop::HookAggregator;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    let (config, config_source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(&args, &config);

    info!("gradtop v{}", env!("CARGO_PKG_VERSION"));
    info!("{}", config_source);
    debug!("Arguments: {:?}", args);

    if let Err(e) = run(args, config) {
        error!("Run failed: {:#}", e);
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Handle --init-config: generate a default .gradtop.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to customize the reporting interval, monitor, and demo model.");
    Ok(())
}

/// Initialize logging based on verbosity settings. `RUST_LOG` overrides the level.
fn init_logging(args: &Args, config: &Config) {
    let level = if !args.quiet && config.general.verbose {
        tracing::Level::DEBUG
    } else {
        args.log_level()
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Load configuration and merge CLI overrides. Also returns a line
/// describing where the configuration came from.
fn load_config(args: &Args) -> Result<(Config, String)> {
    let (mut config, source) = if let Some(ref config_path) = args.config {
        (
            Config::load(config_path)?,
            format!("Loaded config from: {}", config_path.display()),
        )
    } else {
        match Config::load_default()? {
            Some(config) => (config, format!("Loaded default config from {}", CONFIG_FILE)),
            None => (
                Config::default(),
                "No config file found, using defaults".to_string(),
            ),
        }
    };

    config.merge_with_args(args)?;
    config.validate()?;
    Ok((config, source))
}

/// Run the demo training loop with the aggregator attached.
fn run(args: Args, config: Config) -> Result<()> {
    let start_time = Instant::now();

    let demo_model = DemoModel::from_config(&config.demo)?;
    let data = Dataset::synthetic(config.demo.samples);
    let every = config.aggregator.every_n_steps;

    let leaves = demo_model
        .model()
        .named_modules()
        .iter()
        .filter(|(_, m)| m.is_leaf())
        .count();

    println!("🧠 Demo model: {} leaf modules", leaves);
    println!("   Hidden width: {}", config.demo.hidden);
    println!("   Samples: {}", data.len());
    println!("   Steps: {}", config.demo.steps);
    println!("   Reporting every {} steps to {:?} monitor", every, config.monitor.kind);

    let monitor = SummaryMonitor::new(build_monitor(&config)?, every as u64);
    let mut aggregator = HookAggregator::new(demo_model.model(), every, monitor)?
        .with_activation_stats(config.aggregator.activation_stats);

    let progress = if args.quiet {
        None
    } else {
        Some(progress_bar(config.demo.steps as u64))
    };

    let outcome = {
        let mut scope = aggregator.enter()?;
        info!("Attached {} hooks", scope.handle_count());

        let outcome = demo::train(
            &demo_model,
            &data,
            &mut scope,
            config.demo.steps,
            config.demo.learning_rate,
            progress.as_ref(),
        )?;

        scope.release().context("Failed to release hooks")?;
        outcome
    };

    if let Some(pb) = progress {
        pb.finish_with_message("Training complete");
    }

    // Dropping the monitor joins the channel consumer, if any
    let (monitor, mut summary) = aggregator.into_monitor().into_parts();
    drop(monitor);

    summary.steps = outcome.steps as u64;
    summary.duration_seconds = start_time.elapsed().as_secs_f64();

    let output_path = PathBuf::from(&config.general.output);
    let rendered = match args.format {
        OutputFormat::Json => report::generate_json_summary(&summary)?,
        OutputFormat::Markdown => report::generate_markdown_summary(&summary),
    };
    report::write_summary(&rendered, &output_path)?;

    println!("\n📊 Run Summary:");
    println!("   Steps: {}", outcome.steps);
    if outcome.stopped_early {
        println!("   Stopped early: monitor is no longer running");
    }
    println!("   Reports: {}", summary.flushes);
    if let (Some(first), Some(last)) = (outcome.initial_loss, outcome.final_loss) {
        println!("   Loss: {:.5} → {:.5}", first, last);
    }
    println!("   Duration: {:.2}s", summary.duration_seconds);
    if config.monitor.kind == MonitorKind::Jsonl {
        println!("   Metrics: {}", config.monitor.output);
    }
    println!(
        "\n✅ Run complete! Summary saved to: {}",
        output_path.display()
    );

    Ok(())
}

/// Build the monitor selected in the configuration.
fn build_monitor(config: &Config) -> Result<Box<dyn Monitor>> {
    let monitor: Box<dyn Monitor> = match config.monitor.kind {
        MonitorKind::Log => Box::new(LogMonitor::new()),
        MonitorKind::Jsonl => {
            let path = Path::new(&config.monitor.output);
            let monitor = JsonlMonitor::create(path)
                .with_context(|| format!("Failed to create metrics file {}", path.display()))?;
            Box::new(monitor)
        }
        MonitorKind::Channel => Box::new(ChannelMonitor::loss_window(config.monitor.window)),
    };
    Ok(monitor)
}

fn progress_bar(steps: u64) -> ProgressBar {
    let pb = ProgressBar::new(steps);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}
