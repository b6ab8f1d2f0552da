//! Harvester daemon - runs scheduled catalog ingestion.
//!
//! `run` starts the scheduler and serves until interrupted. The other
//! subcommands trigger one source or inspect the run ledger and print
//! JSON reports on stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvester_core::{HarvestScheduler, HarvesterBuilder, RunReport, RunStatus, TriggerOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(about = "Scheduled, non-overlapping catalog ingestion")]
struct Args {
    /// Path to the harvester config file
    #[arg(short, long, default_value = "harvester.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Run one source now and print the finished run
    Trigger { source: String },
    /// Print the latest run of a source
    Status { source: String },
    /// List recent runs of a source, newest first
    Runs {
        source: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(scheduler: HarvestScheduler) -> Result<ExitCode> {
    scheduler.start()?;
    info!("Harvester running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    scheduler.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

async fn trigger(scheduler: HarvestScheduler, source: &str) -> Result<ExitCode> {
    let interrupt = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            interrupt.shutdown().await;
        }
    });

    match scheduler.trigger_ingestion(source).await? {
        TriggerOutcome::Finished(run) => {
            print_json(&RunReport::from(&run))?;
            Ok(if run.status == RunStatus::Completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        TriggerOutcome::Skipped {
            source,
            active_run_id,
        } => {
            warn!(
                "{} already has an active run ({}), skipped",
                source,
                active_run_id.as_deref().unwrap_or("unknown")
            );
            Ok(ExitCode::from(2))
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.debug);

    let scheduler = HarvesterBuilder::from_file(&args.config)
        .and_then(HarvesterBuilder::build)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    match args.command {
        Command::Run => serve(scheduler).await,
        Command::Trigger { source } => trigger(scheduler, &source).await,
        Command::Status { source } => {
            match scheduler.latest_run(&source)? {
                Some(run) => print_json(&RunReport::from(&run))?,
                None => info!("No runs recorded for {}", source),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Runs { source, limit } => {
            let reports: Vec<RunReport> = scheduler
                .list_runs(&source, limit)?
                .iter()
                .map(RunReport::from)
                .collect();
            print_json(&reports)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
