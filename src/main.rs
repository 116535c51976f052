//! Paged VM - Main Entry Point
//!
//! Usage: paged-vm [OPTIONS] <TRACE> [OUTPUT]
//!
//! Replays a trace of map/unmap/read/write commands against a fresh
//! demand-paged address space and writes one result per command.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use paged_vm::io::{write_results, Outcome, Trace};
use paged_vm::VMManager;

/// Command-line configuration
#[derive(Debug, Parser)]
#[command(
    name = "paged-vm",
    version,
    about = "Demand-paged virtual memory simulator driven by trace files"
)]
struct Config {
    /// Trace file with one command per line
    trace_file: PathBuf,

    /// Output file for results (stdout when omitted)
    output_file: Option<PathBuf>,

    /// Log every translation and fault
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Print the statistics report after the replay
    #[arg(long)]
    stats: bool,
}

fn main() {
    let config = Config::parse();
    init_logging(&config);

    // Run the replay and handle any errors
    if let Err(e) = run(&config) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_logging(config: &Config) {
    let default_filter = if config.verbose {
        "debug"
    } else if config.quiet {
        "error"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();
}

/// Main logic separated from main() for cleaner error handling
fn run(config: &Config) -> Result<()> {
    let trace = Trace::from_file(&config.trace_file)
        .with_context(|| format!("loading {}", config.trace_file.display()))?;
    info!(
        "replaying {} commands from {}",
        trace.commands.len(),
        config.trace_file.display()
    );

    let mut vm = VMManager::new();
    let results = trace.replay(&mut vm);

    let failures = results
        .iter()
        .filter(|outcome| matches!(outcome, Outcome::Failed(_)))
        .count();
    info!(
        "{} commands succeeded, {} failed",
        results.len() - failures,
        failures
    );

    write_results(config.output_file.as_ref(), &results).context("writing results")?;
    if let Some(path) = &config.output_file {
        info!("results written to {}", path.display());
    }

    if config.stats {
        eprintln!();
        eprintln!("{}", vm.statistics_snapshot());
    }

    vm.teardown();
    Ok(())
}
