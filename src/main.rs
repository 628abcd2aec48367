//! CLI entry point for the test bench manager.
//!
//! # Usage
//!
//! Serve the bench until Ctrl-C (translators keep running):
//! ```bash
//! testbench --config-root ./config serve
//! ```
//!
//! Run one experiment to completion and print its report:
//! ```bash
//! testbench --config-root ./config run burn-in
//! ```
//!
//! List instruments and experiments:
//! ```bash
//! testbench list
//! ```

use anyhow::{Context, Result};
use bench_experiment::Outcome;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testbench::logging::{self, LogFormat};
use testbench::{Api, Settings, TestBench};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "testbench")]
#[command(about = "Test bench manager: virtual instruments and experiment runs", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Configuration root, overriding the settings file
    #[arg(long, global = true)]
    config_root: Option<PathBuf>,

    /// Log level, overriding the settings file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format, overriding the settings file
    #[arg(long, global = true, value_parser = parse_format)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configuration, start translators and wait for Ctrl-C
    Serve,

    /// Run one experiment to completion and print the run report as JSON
    Run {
        /// Experiment configuration uid
        experiment: String,
    },

    /// List virtual instruments and experiments
    List,
}

fn parse_format(value: &str) -> Result<LogFormat, String> {
    match value.to_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "compact" => Ok(LogFormat::Compact),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format '{other}' (pretty, compact, json)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.settings.as_deref()).context("loading settings")?;
    if let Some(root) = cli.config_root {
        settings.configuration_directory = root;
    }
    if let Some(level) = cli.log_level {
        settings.log.level = level;
    }
    if let Some(format) = cli.log_format {
        settings.log.format = format;
    }
    settings.validate()?;
    logging::init(&settings.logging()?).map_err(anyhow::Error::msg)?;

    let bench = Arc::new(TestBench::from_settings(&settings));
    let summary = bench.reload().context("loading instrument configuration")?;
    info!(
        physical_instruments = summary.physical_instruments,
        translators = summary.translators,
        failed = summary.failed_translators.len(),
        "Test bench ready"
    );
    let api = Api::new(bench.clone());

    let code = match cli.command {
        Commands::Serve => serve(&bench).await,
        Commands::Run { experiment } => run_experiment(&api, &experiment).await,
        Commands::List => list(&api),
    };
    bench.shutdown();
    let code = code?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn serve(bench: &TestBench) -> Result<i32> {
    info!(
        root = %bench.configuration().root().display(),
        instruments = bench.instruments().len(),
        "Serving; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutting down test bench");
    Ok(0)
}

async fn run_experiment(api: &Api, experiment: &str) -> Result<i32> {
    let run_uid = api
        .run_experiment(experiment)
        .with_context(|| format!("starting experiment '{experiment}'"))?;

    let waiter = {
        let api = api.clone();
        let run_uid = run_uid.clone();
        tokio::task::spawn_blocking(move || api.wait_run(&run_uid, None))
    };
    let info = tokio::select! {
        finished = waiter => finished.context("run waiter panicked")??,
        _ = tokio::signal::ctrl_c() => {
            error!(run = %run_uid, "Interrupted, aborting run");
            api.stop()?;
            api.wait_run(&run_uid, Some(Duration::from_secs(30)))?
        }
    };

    let steps = api
        .list_steps(&run_uid)?
        .iter()
        .map(|step| api.step(&run_uid, step))
        .collect::<Result<Vec<_>, _>>()?;
    let report = json!({ "run": info, "steps": steps });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(match info.outcome {
        Some(Outcome::Succeeded) | Some(Outcome::SucceededWithWarnings) => 0,
        Some(Outcome::Aborted) => 130,
        _ => 1,
    })
}

fn list(api: &Api) -> Result<i32> {
    let experiments = api.list_experiments().unwrap_or_else(|e| {
        error!(error = %e, "Cannot list experiments");
        Vec::new()
    });
    let listing = json!({
        "instruments": api.list_instruments(),
        "experiments": experiments,
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(0)
}
