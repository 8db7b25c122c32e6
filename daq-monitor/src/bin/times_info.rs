//! Timing-report reader (C17): aggregates `.times/*.csv` files into a
//! per-stage summary table. Grounded on `scripts/util/times_info.py`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use daq_monitor_core::timing::{read_records, summarize, timing_files, TimingRecord};

#[derive(Parser, Debug)]
#[command(name = "times-info")]
#[command(about = "Summarize per-stage timing telemetry from a .times directory")]
struct Args {
    /// Either a `.times` directory directly, or a run output directory
    /// containing one.
    path: PathBuf,
}

fn resolve_times_dir(path: &Path) -> PathBuf {
    if path.file_name().and_then(|n| n.to_str()) == Some(".times") {
        path.to_path_buf()
    } else {
        path.join(".times")
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let times_dir = resolve_times_dir(&args.path);

    let files = match timing_files(&times_dir) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("failed to list timing files under {}: {e}", times_dir.display());
            return ExitCode::FAILURE;
        }
    };

    if files.is_empty() {
        eprintln!("no times_*.csv files found under {}", times_dir.display());
        return ExitCode::FAILURE;
    }

    let mut all_records: Vec<TimingRecord> = Vec::new();
    let mut per_stage: Vec<(String, Vec<TimingRecord>)> = Vec::new();

    for file in &files {
        let records = match read_records(file) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("failed to read {}: {e}", file.display());
                continue;
            }
        };
        let stage = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("stage")
            .trim_start_matches("times_")
            .to_string();
        all_records.extend(records.iter().cloned());
        per_stage.push((stage, records));
    }

    print_summary_line(&summarize("all", &all_records));
    for (stage, records) in &per_stage {
        print_summary_line(&summarize(stage, records));
    }

    ExitCode::SUCCESS
}

fn print_summary_line(summary: &daq_monitor_core::timing::StageSummary) {
    println!(
        "{:<16} count={:<6} total={:>10.3}s mean={:>8.3}s std={:>8.3}s max={:>8.3}s min={:>8.3}s parallel={:>4}",
        summary.job_type,
        summary.count,
        summary.total,
        summary.mean,
        summary.std_dev,
        summary.max,
        summary.min,
        summary.parallel,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_times_dir_passes_through_dot_times() {
        assert_eq!(
            resolve_times_dir(Path::new("/a/.times")),
            PathBuf::from("/a/.times")
        );
    }

    #[test]
    fn resolve_times_dir_appends_for_run_dir() {
        assert_eq!(
            resolve_times_dir(Path::new("/a/run_1")),
            PathBuf::from("/a/run_1/.times")
        );
    }
}
