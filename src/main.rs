//! automator CLI - Remote device test suite runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use automator::client::{RemoteExecutionClient, ShellClient};
use automator::clock::SystemClock;
use automator::config::{self, Config};
use automator::orchestrator::{Driver, Orchestrator};
use automator::report::{ConsoleListener, CsvListener, JunitListener, TestRunListener};

#[derive(Parser)]
#[command(name = "automator")]
#[command(about = "Runs test cases on remote devices and collects their reports", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "automator.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the test suite
    Run {
        /// Override the number of retries per test case
        #[arg(short, long)]
        retest: Option<u32>,

        /// Override the pause between two polling rounds, in seconds
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Write the JUnit XML report into this directory
        #[arg(long)]
        junit_dir: Option<PathBuf>,

        /// Write the raw CSV log to this file
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// List the planned test runs without running them
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            retest,
            poll_interval,
            junit_dir,
            csv,
        } => run_suite(&cli.config, retest, poll_interval, junit_dir, csv).await,
        Commands::List { format } => list_runs(&cli.config, format),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

async fn run_suite(
    config_path: &Path,
    retest: Option<u32>,
    poll_interval: Option<u64>,
    junit_dir: Option<PathBuf>,
    csv: Option<PathBuf>,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(retest) = retest {
        config.automator.retest_count = retest;
    }
    if let Some(secs) = poll_interval {
        config.automator.poll_interval_secs = secs;
    }
    if let Some(dir) = junit_dir {
        config.report.junit = true;
        config.report.output_dir = dir;
    }
    if let Some(file) = csv {
        config.report.csv = true;
        config.report.csv_file = file;
    }

    info!("Loaded configuration from {}", config_path.display());

    let client = ShellClient::from_config(&config.client).context("Invalid client commands")?;
    info!("Using client: {}", client.name());

    let mut orchestrator = Orchestrator::new(
        client,
        Arc::new(SystemClock),
        config.automator.orchestrator_settings(),
    );
    for listener in create_listeners(&config)? {
        orchestrator.add_listener(listener);
    }
    for planned in config.planned_runs() {
        orchestrator.enqueue(planned);
    }

    let driver = Driver::new(
        config.automator.poll_interval(),
        config.automator.progress_every_rounds,
    );
    let summary = driver
        .run(&mut orchestrator)
        .await
        .context("Test run aborted")?;

    std::process::exit(summary.exit_code());
}

/// Listeners in notification order: console, JUnit, CSV.
fn create_listeners(config: &Config) -> Result<Vec<Arc<dyn TestRunListener>>> {
    let mut listeners: Vec<Arc<dyn TestRunListener>> = Vec::new();

    listeners.push(Arc::new(ConsoleListener::new(
        &config.client.report_base_url,
    )));

    if config.report.junit {
        listeners.push(Arc::new(
            JunitListener::new(
                &config.report.output_dir,
                &config.automator.suite_name,
                &config.client.report_base_url,
            )
            .with_package(&config.report.junit_package),
        ));
    }

    if config.report.csv {
        listeners.push(Arc::new(CsvListener::create(&config.report.csv_file)?));
    }

    Ok(listeners)
}

#[derive(Serialize)]
struct PlannedEntry<'a> {
    device: &'a str,
    udid: Option<&'a str>,
    test_case: &'a str,
    timeout_mins: u64,
    specification: Option<&'a str>,
}

fn list_runs(config_path: &Path, format: Format) -> Result<()> {
    let config = config::load_config(config_path)?;
    let planned = config.planned_runs();

    match format {
        Format::Json => {
            let entries: Vec<PlannedEntry<'_>> = planned
                .iter()
                .map(|p| PlannedEntry {
                    device: &p.device().name,
                    udid: p.device().udid.as_deref(),
                    test_case: &p.test_case().name,
                    timeout_mins: p.test_case().timeout.as_secs() / 60,
                    specification: p.test_case().specification.as_deref(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Format::Text => {
            println!("{} planned test runs:", planned.len());
            for p in &planned {
                println!(
                    "  {} on {} (timeout {} min)",
                    p.test_case(),
                    p.device(),
                    p.test_case().timeout.as_secs() / 60
                );
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Suite: {}", config.automator.suite_name);
            println!("  Retest count: {}", config.automator.retest_count);
            println!("  Poll interval: {}s", config.automator.poll_interval_secs);
            println!(
                "  Fetch errors: suspend after {}, abort after {}",
                config.automator.suspend_error_threshold, config.automator.fatal_error_threshold
            );
            println!("  Devices: {}", config.devices.len());
            println!("  Planned runs: {}", config.planned_runs().len());
            if config.report.junit {
                println!("  JUnit: {}", config.report.output_dir.display());
            }
            if config.report.csv {
                println!("  CSV: {}", config.report.csv_file.display());
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

const STARTER_CONFIG: &str = r#"# automator configuration file

[automator]
suite_name = "smoke"
retest_count = 1
poll_interval_secs = 5

[client]
# Must print {"success": true, "message": "<execution id>"} on its last line
submit_command = "./jamo submit --device {device} --udid {udid} --test {test_case}"
# Must print the execution result as JSON, or nothing while it is still running
fetch_command = "./jamo report {execution_id}"
report_base_url = "https://jamo-release.appspot.com"

[report]
output_dir = "target/surefire-reports"
junit = true
csv = true
csv_file = "target/testRunsRaw.csv"

[[devices]]
name = "my-device"

[[devices.test_cases]]
name = "my-test-case"
timeout_mins = 15
"#;

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
    }

    std::fs::write(path, STARTER_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  automator run");

    Ok(())
}
