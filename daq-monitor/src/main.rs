//! # DAQ Monitor
//!
//! Run-to-completion orchestrator for one DAQ run: watches a raw run
//! folder, converts and event-builds each numbered part as it appears,
//! merges the results into a single cumulative artifact, and publishes
//! periodic snapshots for downstream quality monitoring.
//!
//! See `SPEC_FULL.md` at the workspace root for the full design.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use daq_monitor_core::{Coordinator, ConfigOverrides, MonitorConfig, MonitorError, ProcessTools};
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "daq-monitor")]
#[command(about = "Monitor a DAQ run: convert, build, merge, and snapshot as data arrives")]
struct Args {
    /// Folder containing the raw numbered run parts.
    raw_run_folder: PathBuf,

    /// Path to a TOML configuration file (monitoring/eventbuilding/snapshot sections).
    #[arg(short = 'c', long = "config", env = "DAQ_MONITOR_CONFIG")]
    config_file: Option<PathBuf>,

    /// Overrides `monitoring.max_workers`.
    #[arg(long, env = "DAQ_MONITOR_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Overrides `monitoring.output_parent`.
    #[arg(long, env = "DAQ_MONITOR_OUTPUT_PARENT")]
    output_parent: Option<PathBuf>,

    /// Overrides `monitoring.skip_dirty_dat`.
    #[arg(long)]
    skip_dirty_dat: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match MonitorConfig::load(args.config_file.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::from(1);
        }
    };
    config.apply_overrides(&ConfigOverrides {
        max_workers: args.max_workers,
        output_parent: args.output_parent.clone(),
        skip_dirty_dat: if args.skip_dirty_dat { Some(true) } else { None },
    });
    config.resolve_identity(&args.raw_run_folder);
    let output_name = config.monitoring.output_name.clone().unwrap_or_default();
    let output_dir = config.monitoring.output_parent.join(output_name);
    if let Err(e) = std::fs::create_dir_all(&output_dir) {
        eprintln!("failed to create output directory {}: {e}", output_dir.display());
        return ExitCode::from(1);
    }

    // Mirror logs to `log_monitoring.log` alongside the console, matching
    // the dual console+file handler pair `configure_logging` installs in
    // the reference implementation.
    let file_appender = tracing_appender::rolling::never(&output_dir, "log_monitoring.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "daq_monitor=info,daq_monitor_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    match run(args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.exit_code();
            match &e {
                MonitorError::AlreadyDone(dir) => info!(dir = %dir.display(), "run already monitored"),
                MonitorError::Skipped(dir) => info!(dir = %dir.display(), "monitoring explicitly skipped"),
                other => error!(error = %other, "monitoring run terminated with an error"),
            }
            ExitCode::from(code as u8)
        }
    }
}

fn run(args: Args, config: MonitorConfig) -> daq_monitor_core::Result<()> {
    let tools: Arc<dyn daq_monitor_core::external::ToolBundle> = Arc::new(ProcessTools::default());
    let coordinator = Arc::new(Coordinator::new(args.raw_run_folder, config, tools));

    info!(output_dir = %coordinator.paths.output_dir.display(), "starting monitoring run");
    let outcome = coordinator.run_to_completion()?;

    if outcome.stopped_gracefully {
        info!("monitoring stopped gracefully on operator request");
    } else {
        info!("monitoring run completed");
    }
    if let Some(path) = outcome.final_artifact {
        info!(path = %path.display(), "final artifact published");
    }
    Ok(())
}
