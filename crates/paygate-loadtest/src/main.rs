//! # Payment Gateway Load Test CLI
//!
//! Command-line interface for running staged load tests against a payment
//! gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Default staged profile against a local gateway
//! paygate-loadtest --target http://localhost:8080/api/v1
//!
//! # Profile from a file, JSON report written next to it
//! paygate-loadtest --config loadtest.toml --output report.json
//!
//! # 100 users paying for five minutes, 100ms between payments
//! paygate-loadtest constant --vus 100 --duration 5m --scenario pay
//!
//! # Check a profile without sending traffic
//! paygate-loadtest --config loadtest.toml validate
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use paygate_loadtest::prelude::*;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status when the run could not start or its report could not be saved
const EXIT_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "paygate-loadtest")]
#[command(version)]
#[command(about = "Staged load testing tool for payment gateway APIs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// TOML profile; defaults apply when omitted
    #[arg(short, long, global = true, env = "PAYGATE_LOADTEST_CONFIG")]
    config: Option<PathBuf>,

    /// Target API base URL
    #[arg(short, long, global = true, env = "PAYGATE_LOADTEST_TARGET")]
    target: Option<String>,

    /// Per-request timeout, e.g. 30s
    #[arg(long, global = true)]
    timeout: Option<String>,

    /// Seed for reproducible scenario selection and pacing
    #[arg(long, global = true, env = "PAYGATE_LOADTEST_SEED")]
    seed: Option<u64>,

    /// Write the JSON report to this file
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Hold a fixed number of users for a fixed duration
    Constant {
        /// Concurrent virtual users
        #[arg(long, default_value = "100")]
        vus: u64,

        /// Test duration, e.g. 5m
        #[arg(short, long, default_value = "5m")]
        duration: String,

        /// Delay between iterations of one user
        #[arg(long, default_value = "100ms")]
        pacing: String,

        /// Run only this scenario
        #[arg(long)]
        scenario: Option<String>,
    },

    /// Check the profile and print the resolved plan without sending traffic
    Validate,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(verbose: bool, format: LogFormat) {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

/// Load the profile and apply command-line overrides
fn resolve_config(cli: &Cli) -> anyhow::Result<LoadTestConfig> {
    let mut config = match &cli.config {
        Some(path) => LoadTestConfig::from_file(path)
            .with_context(|| format!("Failed to load profile {}", path.display()))?,
        None => LoadTestConfig::default(),
    };

    if let Some(target) = &cli.target {
        config.base_url = target.clone();
    }
    if let Some(timeout) = &cli.timeout {
        config.request_timeout = timeout.clone();
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }

    if let Some(Commands::Constant {
        vus,
        duration,
        pacing,
        scenario,
    }) = &cli.command
    {
        config = config.constant(*vus, duration, pacing);
        if let Some(name) = scenario {
            config = config.only_scenario(name);
        }
    }

    Ok(config)
}

fn print_plan(runner: &LoadTestRunner) {
    let schedule = runner.schedule();
    println!("Target:   {}", runner.config().base_url);
    println!(
        "Schedule: {} stages, {:?} total, peak {} users",
        schedule.stages().len(),
        schedule.total_duration(),
        schedule.peak_target()
    );
    for (index, stage) in schedule.stages().iter().enumerate() {
        let duration = format!("{:?}", stage.duration);
        println!("  {}. {:>8} -> {} users", index + 1, duration, stage.target);
    }
    println!("Thresholds:");
    for spec in runner.thresholds() {
        println!("  {} {}", spec.metric, spec.expression);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    info!("Payment Gateway Load Test Tool v{}", env!("CARGO_PKG_VERSION"));

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = resolve_config(&cli)?;
    let runner = LoadTestRunner::new(config).context("Invalid load test configuration")?;

    if matches!(cli.command, Some(Commands::Validate)) {
        print_plan(&runner);
        println!("✅ Configuration is valid");
        return Ok(0);
    }

    let cancel = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping virtual users");
            cancel.cancel();
        }
    });

    let report = runner.run().await;
    report.print_report();

    if let Some(path) = &cli.output {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Results saved to {}", path.display());
    }

    Ok(report.exit_code())
}
