//! plcbench command line
//!
//! Runs the scenario matrix against the configured controller over every enabled
//! protocol, prints the comparison table and writes the session to the output directory.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use plcbench::benchmark::{JsonDirectorySink, Orchestrator, ProgressEvent, ProgressReceiver, ResultSink};
use plcbench_common::{generate_default_config, BenchSettings, ConfigSource, Protocol};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plcbench")]
#[command(about = "Compare Web API, OPC UA and S7 access to a PLC")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "PLCBENCH_CONFIG")]
    config: Option<PathBuf>,

    /// Output directory for results, overrides the configuration
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scenario matrix
    Run {
        /// Protocols to benchmark (comma-separated), default from configuration
        #[arg(long = "protocol", value_delimiter = ',')]
        protocols: Vec<Protocol>,

        /// Operations per scenario
        #[arg(long)]
        count: Option<usize>,

        /// Seconds per scenario, used when no count is set
        #[arg(long)]
        duration: Option<f64>,

        /// Target rates in ops/s (comma-separated)
        #[arg(long, value_delimiter = ',')]
        rates: Vec<f64>,

        /// Also run paced reads of each variable
        #[arg(long)]
        reads: bool,

        #[arg(long)]
        skip_bulk: bool,

        /// Add the mixed write/read cycle over all variables
        #[arg(long)]
        mixed: bool,
    },

    /// Run only the bulk transfer
    Bulk {
        #[arg(long)]
        repetitions: Option<usize>,

        #[arg(long = "protocol", value_delimiter = ',')]
        protocols: Vec<Protocol>,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a template configuration file
    Generate {
        #[arg(short, long, default_value = "plcbench.toml")]
        output: PathBuf,
    },
    /// Check a configuration file
    Validate { file: PathBuf },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Run {
            protocols,
            count,
            duration,
            rates,
            reads,
            skip_bulk,
            mixed,
        } => {
            let mut settings = load_settings(cli.config.as_deref())?;
            if !protocols.is_empty() {
                settings.scenarios.protocols = protocols;
            }
            if let Some(count) = count {
                settings.scenarios.operation_count = Some(count);
            }
            if let Some(duration) = duration {
                settings.scenarios.operation_count = None;
                settings.scenarios.duration_secs = Some(duration);
            }
            if !rates.is_empty() {
                settings.scenarios.rates = rates;
            }
            settings.scenarios.include_reads |= reads;
            if skip_bulk {
                settings.scenarios.bulk_enabled = false;
            }
            settings.scenarios.mixed_enabled |= mixed;
            run(settings, cli.output).await
        }
        Commands::Bulk { repetitions, protocols } => {
            let mut settings = load_settings(cli.config.as_deref())?;
            if !protocols.is_empty() {
                settings.scenarios.protocols = protocols;
            }
            settings.scenarios.variables.clear();
            settings.scenarios.include_reads = false;
            settings.scenarios.bulk_enabled = true;
            if let Some(repetitions) = repetitions {
                settings.scenarios.bulk_repetitions = repetitions;
            }
            run(settings, cli.output).await
        }
        Commands::Config { action } => match action {
            ConfigAction::Generate { output } => {
                if output.exists() {
                    bail!("{} already exists", output.display());
                }
                generate_default_config()
                    .to_file(&output)
                    .with_context(|| format!("failed to write {}", output.display()))?;
                println!("Wrote configuration template to {}", output.display());
                Ok(())
            }
            ConfigAction::Validate { file } => {
                let mut settings = plcbench_common::load_config(ConfigSource::File(file.clone()))
                    .with_context(|| format!("failed to load {}", file.display()))?;
                settings.apply_env_overrides()?;
                settings.validate().context("configuration is invalid")?;
                let scenarios: usize = settings
                    .scenarios
                    .protocols
                    .iter()
                    .map(|p| plcbench_benchmarks::Scenario::expand(&settings.scenarios, *p).len())
                    .sum();
                println!("{} is valid: {} scenario runs", file.display(), scenarios);
                Ok(())
            }
            ConfigAction::Show => {
                let settings = load_settings(cli.config.as_deref())?;
                print!("{}", toml::to_string_pretty(&settings).context("failed to render configuration")?);
                Ok(())
            }
        },
    }
}

/// File settings (or defaults) with environment overrides applied
fn load_settings(path: Option<&Path>) -> Result<BenchSettings> {
    let source = match path {
        Some(path) => ConfigSource::File(path.to_path_buf()),
        None => ConfigSource::Default,
    };
    let mut settings = plcbench_common::load_config(source).context("failed to load configuration")?;
    settings.apply_env_overrides().context("invalid environment override")?;
    Ok(settings)
}

async fn run(mut settings: BenchSettings, output: Option<PathBuf>) -> Result<()> {
    if let Some(output) = output {
        settings.output_dir = output;
    }
    settings.validate().context("configuration is invalid")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping at the next operation boundary");
            on_signal.cancel();
        }
    });

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let progress = tokio::spawn(log_progress(rx));

    let mut orchestrator = Orchestrator::from_settings(&settings)?.with_progress(tx);
    let session = orchestrator.run(&cancel).await;
    drop(orchestrator);
    let _ = progress.await;

    println!("{}", session.report.render_table());
    let mut sink = JsonDirectorySink::new(&settings.output_dir);
    sink.persist(&session)
        .with_context(|| format!("failed to write results to {}", settings.output_dir.display()))?;
    println!("Results: {}", sink.session_dir(&session).display());

    let unfinished = session.unfinished_runs().count();
    if unfinished > 0 {
        warn!("{} of {} runs did not complete", unfinished, session.runs.len());
    }
    Ok(())
}

async fn log_progress(mut rx: ProgressReceiver) {
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::AdapterStarted { adapter, scenarios } => {
                info!("== {} ({} scenarios)", adapter, scenarios);
            }
            ProgressEvent::ScenarioStarted {
                adapter,
                scenario,
                position,
                total,
            } => info!("[{}/{}] {} {}", position, total, adapter, scenario),
            ProgressEvent::ScenarioFinished {
                scenario,
                status,
                samples,
                ..
            } => info!("{} {} with {} samples", scenario, status, samples),
            ProgressEvent::AdapterFinished { adapter } => info!("== {} done", adapter),
        }
    }
}
