//! Batch companion (C16): picks the most recently active, unfinished raw
//! run under a parent directory and launches `daq-monitor` on it.
//!
//! Grounded on `scripts/monitor_newest.py`: runs are sorted by the numeric
//! suffix after `run_`, descending, and a run is skipped if it looks like
//! another process is already actively monitoring it (its logfile was
//! touched within the last 180 seconds).

use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::time::{Duration, SystemTime};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

const ACTIVE_THRESHOLD: Duration = Duration::from_secs(180);

#[derive(Parser, Debug)]
#[command(name = "monitor-newest")]
#[command(about = "Launch daq-monitor on the most recently active unfinished run")]
struct Args {
    /// Parent directory containing `run_<N>` raw folders.
    raw_parent: PathBuf,

    /// Parent directory under which output directories live.
    output_parent: PathBuf,

    /// Path to the `daq-monitor` binary to invoke.
    #[arg(long, default_value = "daq-monitor")]
    monitor_bin: PathBuf,
}

fn run_sorter(name: &str) -> i64 {
    name.rsplit("run_").next().and_then(|s| s.parse().ok()).unwrap_or(-1)
}

fn is_actively_monitored(output_log: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(output_log) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(elapsed) => elapsed < ACTIVE_THRESHOLD,
        Err(_) => true,
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let entries = match std::fs::read_dir(&args.raw_parent) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, dir = %args.raw_parent.display(), "cannot list raw parent directory");
            return ExitCode::FAILURE;
        }
    };

    let mut runs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();

    if runs.is_empty() {
        tracing::error!(dir = %args.raw_parent.display(), "no raw run folders found");
        return ExitCode::FAILURE;
    }

    runs.sort_by_key(|p| {
        run_sorter(p.file_name().and_then(|n| n.to_str()).unwrap_or(""))
    });
    runs.reverse();

    for run_path in runs {
        let name = run_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if run_sorter(name) < 0 {
            warn!(run = %run_path.display(), "not a valid run name, skipping");
            continue;
        }

        let output_dir = args.output_parent.join(name);
        let output_log = output_dir.join("log_monitoring.log");
        let is_finished = output_dir.join("full_run.root").exists();

        if !is_finished && is_actively_monitored(&output_log) {
            info!(run = %run_path.display(), "unfinished run was logged to recently; assuming it is already being monitored, skipping");
            continue;
        }

        info!(run = %run_path.display(), "launching monitor");
        let status = Command::new(&args.monitor_bin).arg(&run_path).status();
        return match status {
            Ok(s) if s.success() => ExitCode::SUCCESS,
            Ok(s) => ExitCode::from(s.code().unwrap_or(1) as u8),
            Err(e) => {
                tracing::error!(error = %e, "failed to launch daq-monitor");
                ExitCode::FAILURE
            }
        };
    }

    info!("no eligible run found to monitor");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_sorter_extracts_trailing_number() {
        assert_eq!(run_sorter("run_482"), 482);
        assert_eq!(run_sorter("data/run_7"), 7);
    }

    #[test]
    fn run_sorter_rejects_non_numeric_suffix() {
        assert_eq!(run_sorter("scratch"), -1);
    }
}
