//! Raw-discovery scanner (C4): periodically looks for new numbered parts
//! in the raw run folder and enqueues conversion jobs for them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info};

use crate::job::JobPayload;
use crate::queue::JobQueue;

/// Minimum spacing between raw-discovery scans; any worker finding the
/// queue idle may trigger a scan, but only one will actually run per tick.
pub const SCAN_THROTTLE: Duration = Duration::from_secs(2);

const HITS_HISTOGRAM: &str = "hitsHistogram.txt";

static DAT_ORDINAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.dat_(\d{4})(?:\.tar\.gz)?$").unwrap());
static RAWBIN_ORDINAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_raw\.bin.*_(\d{4})(?:\.tar\.gz)?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    AsciiDat,
    RawBin,
}

/// Shared scanner state, mutated across scans. One instance per run,
/// shared by every worker thread.
pub struct ScannerState {
    last_scan: Mutex<Instant>,
    largest_seen: AtomicI64,
    zero_special_case_done: AtomicBool,
    run_finished: AtomicBool,
}

impl std::fmt::Debug for ScannerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerState")
            .field("largest_seen", &self.largest_seen.load(Ordering::Relaxed))
            .field("run_finished", &self.run_finished.load(Ordering::Relaxed))
            .finish()
    }
}

impl ScannerState {
    pub fn new() -> Self {
        ScannerState {
            last_scan: Mutex::new(Instant::now() - SCAN_THROTTLE),
            largest_seen: AtomicI64::new(-1),
            zero_special_case_done: AtomicBool::new(false),
            run_finished: AtomicBool::new(false),
        }
    }

    pub fn run_finished(&self) -> bool {
        self.run_finished.load(Ordering::Relaxed)
    }

    /// Returns `true` and latches the throttle clock if a scan should run
    /// now; returns `false` if another worker scanned too recently.
    fn should_scan_now(&self) -> bool {
        let mut last = self.last_scan.lock().unwrap();
        if last.elapsed() < SCAN_THROTTLE {
            return false;
        }
        *last = Instant::now();
        true
    }
}

impl Default for ScannerState {
    fn default() -> Self {
        Self::new()
    }
}

fn find_ordinal(path: &Path) -> Option<(RawKind, i64)> {
    let name = path.file_name()?.to_str()?;
    if let Some(caps) = DAT_ORDINAL.captures(name) {
        return Some((RawKind::AsciiDat, caps[1].parse().ok()?));
    }
    if let Some(caps) = RAWBIN_ORDINAL.captures(name) {
        return Some((RawKind::RawBin, caps[1].parse().ok()?));
    }
    None
}

fn glob_raw_parts(raw_run_folder: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for pattern in [
        "*.dat_[0-9][0-9][0-9][0-9]",
        "*.dat_[0-9][0-9][0-9][0-9].tar.gz",
        "*_raw.bin*_[0-9][0-9][0-9][0-9]",
        "*_raw.bin*_[0-9][0-9][0-9][0-9].tar.gz",
    ] {
        let full = raw_run_folder.join(pattern);
        if let Some(s) = full.to_str() {
            if let Ok(paths) = glob::glob(s) {
                out.extend(paths.filter_map(|r| r.ok()));
            }
        }
    }
    out
}

/// Runs one discovery pass if the throttle allows it. Returns the list of
/// newly enqueued ordinals' raw paths, for logging/testing convenience.
///
/// Oversized raw-bin parts are enqueued here like any other ordinal; the
/// converter stage (`stages::convert`) is the one that actually performs
/// the binary-split sub-protocol once it has the file in hand, so there is
/// only one place that decides chunk boundaries.
pub fn scan_once(
    raw_run_folder: &Path,
    queue: &JobQueue,
    state: &ScannerState,
) -> Vec<PathBuf> {
    if !state.should_scan_now() {
        return Vec::new();
    }

    let candidates = glob_raw_parts(raw_run_folder);
    let mut dat_found = false;
    let mut rawbin_found = false;
    let mut by_ordinal: Vec<(i64, PathBuf, RawKind)> = Vec::new();
    for path in &candidates {
        if let Some((kind, ordinal)) = find_ordinal(path) {
            match kind {
                RawKind::AsciiDat => dat_found = true,
                RawKind::RawBin => rawbin_found = true,
            }
            by_ordinal.push((ordinal, path.clone(), kind));
        }
    }

    if dat_found && rawbin_found {
        error!("both ascii-dat and raw-bin parts present in the same raw folder; this indicates operator misconfiguration");
    }

    // Prefer whichever kind actually produced candidates; ascii-dat wins
    // ties, matching the reference scanner's check order.
    let active_kind = if dat_found {
        RawKind::AsciiDat
    } else if rawbin_found {
        RawKind::RawBin
    } else {
        RawKind::AsciiDat
    };
    by_ordinal.retain(|(_, _, kind)| *kind == active_kind);
    by_ordinal.sort_by_key(|(ordinal, _, _)| *ordinal);

    let mut enqueued = Vec::new();
    if let Some((max_ordinal, _, _)) = by_ordinal.last().cloned() {
        let prev_largest = state.largest_seen.load(Ordering::Relaxed);
        for (ordinal, path, _kind) in &by_ordinal {
            if *ordinal <= prev_largest {
                continue;
            }
            queue.push(JobPayload::Convert {
                raw_path: path.clone(),
                ordinal: *ordinal,
            });
            enqueued.push(path.clone());
        }
        state.largest_seen.store(max_ordinal, Ordering::Relaxed);
    }

    maybe_handle_zero_special_case(raw_run_folder, queue, state, &mut enqueued);

    let finished_marker = raw_run_folder.join(HITS_HISTOGRAM);
    let finished_marker_gz = raw_run_folder.join(format!("{HITS_HISTOGRAM}.tar.gz"));
    if (finished_marker.exists() || finished_marker_gz.exists())
        && !state.run_finished.swap(true, Ordering::Relaxed)
    {
        info!("DAQ signaled run completion; catching up on remaining raw parts");
        if let Some((_, path, _)) = by_ordinal.last() {
            queue.push(JobPayload::Convert {
                raw_path: path.clone(),
                ordinal: by_ordinal.last().unwrap().0,
            });
        }
    }

    enqueued
}

/// Handles the "exactly one part, no ordinal suffix yet" bootstrap case:
/// DAQ systems sometimes write the very first part without its `_0000`
/// suffix until the second part appears. Runs at most once per process.
fn maybe_handle_zero_special_case(
    raw_run_folder: &Path,
    queue: &JobQueue,
    state: &ScannerState,
    enqueued: &mut Vec<PathBuf>,
) {
    if state.zero_special_case_done.load(Ordering::Relaxed) {
        return;
    }
    if state.largest_seen.load(Ordering::Relaxed) >= 0 {
        state.zero_special_case_done.store(true, Ordering::Relaxed);
        return;
    }
    let dat_pattern = raw_run_folder.join("*.dat");
    let rawbin_pattern = raw_run_folder.join("*_raw.bin");
    let mut candidates = Vec::new();
    for pattern in [dat_pattern, rawbin_pattern] {
        if let Some(s) = pattern.to_str() {
            if let Ok(paths) = glob::glob(s) {
                candidates.extend(paths.filter_map(|r| r.ok()));
            }
        }
    }
    if candidates.len() == 1 {
        let path = candidates.into_iter().next().unwrap();
        queue.push(JobPayload::Convert {
            raw_path: path.clone(),
            ordinal: 0,
        });
        enqueued.push(path);
        state.largest_seen.store(0, Ordering::Relaxed);
        state.zero_special_case_done.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dat_ordinal() {
        assert_eq!(
            find_ordinal(Path::new("run.dat_0007")),
            Some((RawKind::AsciiDat, 7))
        );
    }

    #[test]
    fn parses_rawbin_ordinal_with_middle_segment() {
        assert_eq!(
            find_ordinal(Path::new("run_raw.bin.part_0003")),
            Some((RawKind::RawBin, 3))
        );
    }

    #[test]
    fn scan_enqueues_new_ordinals_only() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            std::fs::write(dir.path().join(format!("run.dat_{:04}", i)), b"x").unwrap();
        }
        let queue = JobQueue::new();
        let state = ScannerState::new();
        let enqueued = scan_once(dir.path(), &queue, &state);
        assert_eq!(enqueued.len(), 3);
        assert_eq!(queue.len(), 3);

        // Second scan with no new files and the throttle not yet elapsed
        // enqueues nothing further.
        let enqueued2 = scan_once(dir.path(), &queue, &state);
        assert!(enqueued2.is_empty());
    }

    #[test]
    fn finished_marker_sets_run_finished() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.dat_0000"), b"x").unwrap();
        std::fs::write(dir.path().join(HITS_HISTOGRAM), b"done").unwrap();
        let queue = JobQueue::new();
        let state = ScannerState::new();
        scan_once(dir.path(), &queue, &state);
        assert!(state.run_finished());
    }
}
