//! Per-stage timing telemetry (C13), appended to `.times/times_<stage>.csv`.
//!
//! Schema and file layout match `scripts/util/times_info.py`'s expectations
//! exactly, so the `times-info` binary (C17) can be pointed at output from
//! either implementation.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const TIMING_HEADER: &[&str] = &["job_type", "time", "timestamp", "id", "worker", "data_path"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingRecord {
    pub job_type: String,
    pub time: f64,
    pub timestamp: String,
    pub id: String,
    pub worker: f64,
    pub data_path: String,
}

/// Appends one timing record to the stage's CSV file, creating the file
/// (with header) on first write.
pub fn record(times_dir: &Path, stage: &str, rec: &TimingRecord) -> Result<()> {
    std::fs::create_dir_all(times_dir)?;
    let path = times_dir.join(format!("times_{stage}.csv"));
    let need_header = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if need_header {
        writer.write_record(TIMING_HEADER)?;
    }
    writer.serialize(rec)?;
    writer.flush()?;
    Ok(())
}

/// Lists every `times_*.csv` file under a `.times` directory.
pub fn timing_files(times_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !times_dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(times_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("times_") && n.ends_with(".csv"))
                .unwrap_or(false)
        {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Reads every record from one timing CSV file.
pub fn read_records(path: &Path) -> Result<Vec<TimingRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut out = Vec::new();
    for result in reader.deserialize() {
        let rec: TimingRecord = result?;
        out.push(rec);
    }
    Ok(out)
}

/// The three-state "parallel" classification `times_info.py`'s
/// `file_info_string` prints per job type: `YES` when every recorded
/// worker id is non-negative (ran inside the worker pool), `NO` when
/// every one is negative (ran outside it, e.g. the masking bootstrap),
/// and `MIX` when a job type straddles both (shouldn't normally happen,
/// but the original tool reports it rather than asserting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelClass {
    Yes,
    No,
    Mix,
}

impl std::fmt::Display for ParallelClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ParallelClass::Yes => "YES",
            ParallelClass::No => "NO",
            ParallelClass::Mix => "MIX",
        })
    }
}

#[derive(Debug, Clone)]
pub struct StageSummary {
    pub job_type: String,
    pub count: usize,
    pub total: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub max: f64,
    pub min: f64,
    pub parallel: ParallelClass,
}

/// Aggregates a set of records sharing a job type into summary statistics,
/// matching `times_info.py`'s `file_info_string` computation.
pub fn summarize(job_type: &str, records: &[TimingRecord]) -> StageSummary {
    let times: Vec<f64> = records.iter().map(|r| r.time).collect();
    let count = times.len();
    let total: f64 = times.iter().sum();
    let mean = if count > 0 { total / count as f64 } else { 0.0 };
    let variance = if count > 0 {
        times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / count as f64
    } else {
        0.0
    };
    let std_dev = variance.sqrt();
    let max = times.iter().cloned().fold(f64::MIN, f64::max);
    let min = times.iter().cloned().fold(f64::MAX, f64::min);

    let all_non_negative = records.iter().all(|r| r.worker >= 0.0);
    let all_negative = records.iter().all(|r| r.worker < 0.0);
    let parallel = if all_non_negative {
        ParallelClass::Yes
    } else if all_negative {
        ParallelClass::No
    } else {
        ParallelClass::Mix
    };

    StageSummary {
        job_type: job_type.to_string(),
        count,
        total,
        mean,
        std_dev,
        max: if count > 0 { max } else { 0.0 },
        min: if count > 0 { min } else { 0.0 },
        parallel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(job_type: &str, time: f64, worker: f64) -> TimingRecord {
        TimingRecord {
            job_type: job_type.to_string(),
            time,
            timestamp: "2026-01-01T00:00:00".into(),
            id: "x".into(),
            worker,
            data_path: "/tmp/x".into(),
        }
    }

    #[test]
    fn record_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        record(dir.path(), "conversion", &rec("conversion", 1.234, 0.0)).unwrap();
        record(dir.path(), "conversion", &rec("conversion", 2.5, 1.0)).unwrap();
        let files = timing_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        let records = read_records(&files[0]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].job_type, "conversion");
    }

    #[test]
    fn summarize_all_non_negative_workers_is_yes() {
        let records = vec![rec("build", 1.0, 0.0), rec("build", 2.0, 1.0)];
        let summary = summarize("build", &records);
        assert_eq!(summary.parallel, ParallelClass::Yes);
        assert_eq!(summary.count, 2);
        assert!((summary.mean - 1.5).abs() < 1e-9);
    }

    #[test]
    fn summarize_all_negative_workers_is_no() {
        let records = vec![rec("masking", 1.0, -1.0), rec("masking", 2.0, -1.0)];
        let summary = summarize("masking", &records);
        assert_eq!(summary.parallel, ParallelClass::No);
    }

    #[test]
    fn summarize_mixed_sign_workers_is_mix() {
        let records = vec![rec("merge", 1.0, -1.0), rec("merge", 2.0, 0.0)];
        let summary = summarize("merge", &records);
        assert_eq!(summary.parallel, ParallelClass::Mix);
    }
}
