//! The four pipeline stages (C8-C11). Each stage speaks only through
//! filesystem paths and returns a `StageOutcome` describing what follow-up
//! job, if any, to enqueue next; the coordinator's worker loop does the
//! actual enqueuing, keeping these functions independently testable with
//! stub tool bundles.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use tracing::{info, warn};

use crate::archive::{extract_single, is_compressed, strip_compressed_suffix};
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::external::BuildParams;
use crate::job::JobPayload;
use crate::timing::{record, TimingRecord};

const SKIP_DAT_BYTES: u64 = 1024;
const SKIP_CONVERTED_BYTES: u64 = 3 * 1024 * 1024;

/// `ordinal` is the raw part's discovered ordinal. It disambiguates the
/// zero-special-case raw file (e.g. `run.dat`, enqueued with `ordinal: 0`
/// by `scanner.rs`'s `maybe_handle_zero_special_case` before any `_NNNN`
/// suffix has appeared): such a stem carries neither `.dat_` nor
/// `_raw.bin` literally, but it is still ordinal 0 of a dat/raw-bin run
/// and must get the same `_0000` suffix every other ordinal gets.
fn converted_name(raw_path: &Path, ordinal: i64) -> String {
    let logical = strip_compressed_suffix(raw_path);
    let stem = logical.file_name().and_then(|n| n.to_str()).unwrap_or("part");
    if stem.contains(".dat_") || stem.contains("_raw.bin") || ordinal == 0 {
        format!("converted_{stem}_0000.root")
    } else {
        format!("converted_{stem}.root")
    }
}

fn built_name(converted_file_name: &str) -> String {
    converted_file_name.replacen("converted_", "build_", 1)
}

fn timestamp_now() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// C8: converts one raw part into one converted part.
pub fn convert(co: &Coordinator, worker_id: i64, raw_path: &Path, ordinal: i64) -> Result<()> {
    let name = converted_name(raw_path, ordinal);
    let output_path = co.paths.converted.join(&name);

    if output_path.exists() {
        enqueue_build(co, &output_path, ordinal);
        return Ok(());
    }

    if co.config.monitoring.skip_dirty_dat {
        if let Ok(meta) = fs::metadata(raw_path) {
            if meta.len() < SKIP_DAT_BYTES {
                info!(path = %raw_path.display(), "skipping undersized raw part");
                return Ok(());
            }
        }
    }

    let started = Instant::now();

    let actual_input: PathBuf = if is_compressed(raw_path) {
        let logical = strip_compressed_suffix(raw_path);
        let expected = logical.file_name().and_then(|n| n.to_str());
        extract_single(raw_path, &co.paths.tmp, expected)?
    } else {
        raw_path.to_path_buf()
    };

    if matches!(active_kind(&actual_input), RawBinMarker::RawBin)
        && co.config.monitoring.binary_split_m > 0
    {
        if let Ok(meta) = fs::metadata(&actual_input) {
            let threshold = co.config.monitoring.binary_split_m * 1024 * 1024;
            if meta.len() > threshold {
                split_raw_bin(co, &actual_input, ordinal)?;
                return Ok(());
            }
        }
    }

    let tmp_output = co.paths.tmp.join(format!("{name}.inprogress"));
    co.tools.converter().convert(&actual_input, &tmp_output)?;
    fs::rename(&tmp_output, &output_path)?;

    if is_compressed(raw_path) && actual_input != *raw_path {
        let _ = fs::remove_file(&actual_input);
    }

    record(
        &co.paths.times,
        "conversion",
        &TimingRecord {
            job_type: "conversion".into(),
            time: started.elapsed().as_secs_f64(),
            timestamp: timestamp_now(),
            id: name.clone(),
            worker: worker_id as f64,
            data_path: output_path.display().to_string(),
        },
    )?;

    enqueue_build(co, &output_path, ordinal);
    Ok(())
}

enum RawBinMarker {
    RawBin,
    Other,
}

fn active_kind(path: &Path) -> RawBinMarker {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name.contains("_raw.bin") {
        RawBinMarker::RawBin
    } else {
        RawBinMarker::Other
    }
}

fn split_raw_bin(co: &Coordinator, path: &Path, ordinal: i64) -> Result<()> {
    // Chunk size matches the configured split threshold: a part just over
    // the threshold yields two roughly-threshold-sized chunks rather than
    // a pile of tiny ones under a separate, independently-tuned constant.
    let chunk_bytes = co.config.monitoring.binary_split_m * 1024 * 1024;
    let data = fs::read(path)?;
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("part");
    let chunks: Vec<&[u8]> = data.chunks(chunk_bytes as usize).collect();
    for (idx, chunk) in chunks.iter().enumerate() {
        let chunk_name = format!("{name}_monitoring_split_{idx:05}");
        let chunk_path = co.paths.tmp.join(&chunk_name);
        fs::write(&chunk_path, chunk)?;
        let sort_key = 10_000 * (ordinal + 1) + idx as i64;
        co.queue.push(JobPayload::Convert {
            raw_path: chunk_path,
            ordinal: sort_key,
        });
    }
    info!(parts = chunks.len(), source = %path.display(), "split oversized raw-bin part");
    Ok(())
}

fn enqueue_build(co: &Coordinator, converted_path: &Path, ordinal: i64) {
    co.queue.push(JobPayload::Build {
        converted_path: converted_path.to_path_buf(),
        ordinal,
    });
}

/// C9: runs the event-builder on one converted part. The built output is
/// left under `tmp/`; the merger stage (not this one) renames it into
/// `build/` once it has actually been merged, so that `build/`'s file
/// count is always exactly the count of parts merged so far.
pub fn build(co: &Coordinator, worker_id: i64, converted_path: &Path, ordinal: i64) -> Result<()> {
    let converted_name = converted_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("converted.root")
        .to_string();
    let name = built_name(&converted_name);
    let final_output = co.paths.build.join(&name);
    if final_output.exists() {
        return Ok(());
    }

    if co.config.monitoring.skip_dirty_dat {
        if let Ok(meta) = fs::metadata(converted_path) {
            if meta.len() < SKIP_CONVERTED_BYTES {
                info!(path = %converted_path.display(), "skipping undersized converted part");
                return Ok(());
            }
        }
    }

    let tmp_output = co.paths.tmp.join(&name);
    if tmp_output.exists() {
        // Already built, awaiting merge on a prior run/attempt.
        co.coordinator_state.push_merge(tmp_output);
        co.queue.push(JobPayload::Merge);
        return Ok(());
    }

    let started = Instant::now();
    let params = BuildParams {
        pedestals_file: co.config.eventbuilding.pedestals_file.clone(),
        mip_calibration_file: co.config.eventbuilding.mip_calibration_file.clone(),
        pedestals_lg_file: co.config.eventbuilding.pedestals_lg_file.clone(),
        mip_calibration_lg_file: co.config.eventbuilding.mip_calibration_lg_file.clone(),
        masked_file: Some(co.paths.masked_channels()),
        w_config: co.config.eventbuilding.w_config.clone(),
        min_slabs_hit: co.config.eventbuilding.min_slabs_hit,
        asu_version: co.config.eventbuilding.asu_version,
        no_zero_suppress: co.config.eventbuilding.no_zero_suppress,
        id_run: co.config.eventbuilding.id_run.unwrap_or(0),
        id_dat: ordinal,
    };
    co.tools.builder().build(converted_path, &tmp_output, &params)?;

    record(
        &co.paths.times,
        "eventbuilding",
        &TimingRecord {
            job_type: "eventbuilding".into(),
            time: started.elapsed().as_secs_f64(),
            timestamp: timestamp_now(),
            id: name.clone(),
            worker: worker_id as f64,
            data_path: tmp_output.display().to_string(),
        },
    )?;

    co.coordinator_state.push_merge(tmp_output);
    co.queue.push(JobPayload::Merge);
    Ok(())
}

/// Outcome of an attempted merge dispatch, used by the coordinator to
/// decide whether to drop, re-enqueue, or consider the marker handled.
pub enum MergeOutcome {
    Handled,
    AnotherMergerActive,
    Contended,
}

/// C10: drains the LIFO merge queue under the exclusive token. Implements
/// the contention algorithm from SPEC_FULL.md S4.8: on a failed acquire,
/// if another worker is already merging, this marker is redundant and
/// dropped; otherwise it must be re-enqueued so someone retries.
pub fn merge(co: &Coordinator, worker_id: i64) -> Result<MergeOutcome> {
    if !co.coordinator_state.has_pending_merges() {
        return Ok(MergeOutcome::Handled);
    }

    // Step 1: back off while a snapshotter is mid-copy, so a merger doesn't
    // win the token race and make the snapshotter wait a full 2s timeout.
    while co
        .coordinator_state
        .snapshot_needs_current_build
        .load(std::sync::atomic::Ordering::Relaxed)
    {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let guard = co
        .token
        .try_acquire(std::time::Duration::from_secs(2));
    let guard = match guard {
        Some(g) => g,
        None => {
            return Ok(if co.coordinator_state.any_merge_in_flight() {
                MergeOutcome::AnotherMergerActive
            } else {
                MergeOutcome::Contended
            });
        }
    };

    co.coordinator_state.enter_merge();
    let result = drain_and_merge(co, worker_id);
    co.coordinator_state.exit_merge();
    drop(guard);
    result?;
    Ok(MergeOutcome::Handled)
}

fn drain_and_merge(co: &Coordinator, worker_id: i64) -> Result<()> {
    let mut pending = co.coordinator_state.drain_merge_queue();
    // LIFO: process most-recently-produced parts first.
    while let Some(tmp_built) = pending.pop() {
        let started = Instant::now();
        let current_build = co.paths.current_build();
        let built_file_name = tmp_built
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("build.root")
            .to_string();

        if !current_build.exists() {
            fs::copy(&tmp_built, &current_build)?;
        } else {
            co.tools.merger().merge_into(&current_build, &tmp_built)?;
        }

        let final_built = co.paths.build.join(&built_file_name);
        fs::rename(&tmp_built, &final_built)?;

        record(
            &co.paths.times,
            "merge",
            &TimingRecord {
                job_type: "merge".into(),
                time: started.elapsed().as_secs_f64(),
                timestamp: timestamp_now(),
                id: built_file_name,
                worker: worker_id as f64,
                data_path: current_build.display().to_string(),
            },
        )?;
    }
    Ok(())
}

/// C11: copies the cumulative artifact, decorates it, and publishes a
/// timestamped snapshot (or the final wrap-up artifact).
pub fn snapshot(co: &Coordinator, worker_id: i64, final_name: Option<&str>) -> Result<Option<PathBuf>> {
    let current_build = co.paths.current_build();
    if !current_build.exists() {
        return Ok(None);
    }

    let started = Instant::now();
    co.coordinator_state
        .snapshot_needs_current_build
        .store(true, std::sync::atomic::Ordering::Relaxed);

    let guard = co.token.try_acquire(std::time::Duration::from_secs(2));
    let guard = match guard {
        Some(g) => g,
        None => {
            co.coordinator_state
                .snapshot_needs_current_build
                .store(false, std::sync::atomic::Ordering::Relaxed);
            return Ok(None);
        }
    };

    let tmp_name = final_name
        .map(|n| n.to_string())
        .unwrap_or_else(|| format!("{}.root", Local::now().format("%Y-%m-%d-%H%M%S")));
    let tmp_snapshot = co.paths.tmp.join(format!("{tmp_name}.inprogress"));
    fs::copy(&current_build, &tmp_snapshot)?;
    drop(guard);
    co.coordinator_state
        .snapshot_needs_current_build
        .store(false, std::sync::atomic::Ordering::Relaxed);

    co.tools.decorator().decorate(&tmp_snapshot)?;

    let final_path = if final_name.is_some() {
        co.paths.output_dir.join(&tmp_name)
    } else {
        co.paths.snapshots.join(&tmp_name)
    };
    fs::rename(&tmp_snapshot, &final_path)?;

    if final_name.is_none() && co.config.snapshot.delete_previous {
        prune_previous_snapshots(co, &final_path)?;
    }

    record(
        &co.paths.times,
        "snapshot",
        &TimingRecord {
            job_type: "snapshot".into(),
            time: started.elapsed().as_secs_f64(),
            timestamp: timestamp_now(),
            id: tmp_name,
            worker: worker_id as f64,
            data_path: final_path.display().to_string(),
        },
    )?;

    info!(path = %final_path.display(), "published snapshot");
    Ok(Some(final_path))
}

fn prune_previous_snapshots(co: &Coordinator, keep: &Path) -> Result<()> {
    for entry in fs::read_dir(&co.paths.snapshots)? {
        let entry = entry?;
        let path = entry.path();
        if path != keep && path.extension().and_then(|e| e.to_str()) == Some("root") {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to prune previous snapshot");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn converted_name_follows_convention() {
        assert_eq!(
            converted_name(Path::new("/raw/run.dat_0007"), 7),
            "converted_run.dat_0007_0000.root"
        );
    }

    /// The zero-special-case raw file has no `_NNNN` suffix yet (it is
    /// enqueued with `ordinal: 0` before the DAQ has written a second
    /// part), but still needs the `_0000` suffix like every other ordinal.
    #[test]
    fn converted_name_appends_suffix_for_unsuffixed_zero_special_case() {
        assert_eq!(
            converted_name(Path::new("/raw/run.dat"), 0),
            "converted_run.dat_0000.root"
        );
    }

    #[test]
    fn built_name_replaces_converted_prefix() {
        assert_eq!(
            built_name("converted_run.dat_0007_0000.root"),
            "build_run.dat_0007_0000.root"
        );
    }

    #[test]
    fn compressed_raw_path_strips_suffix_before_naming() {
        assert_eq!(
            converted_name(Path::new("/raw/run.dat_0007.tar.gz"), 7),
            "converted_run.dat_0007_0000.root"
        );
    }

    fn test_coordinator(raw_run_folder: std::path::PathBuf) -> crate::coordinator::Coordinator {
        use crate::external::test_support::StubToolBundle;
        use std::sync::Arc;
        let mut config = crate::config::MonitorConfig::default();
        config.monitoring.output_parent = raw_run_folder.parent().unwrap().join("output");
        let tools: Arc<dyn crate::external::ToolBundle> = Arc::new(StubToolBundle::default());
        let co = crate::coordinator::Coordinator::new(raw_run_folder, config, tools);
        co.paths.ensure_directories().unwrap();
        co
    }

    /// S5: a raw part under the `skip_dirty_dat` threshold is never
    /// converted and no follow-up job is enqueued.
    #[test]
    fn skip_dirty_dat_skips_undersized_raw_part() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        let small = raw.join("run.dat_0000");
        std::fs::write(&small, vec![0u8; 100]).unwrap();

        let mut co = test_coordinator(raw.clone());
        co.config.monitoring.skip_dirty_dat = true;

        convert(&co, 0, &small, 0).unwrap();

        assert!(!co.paths.converted.join("converted_run.dat_0000_0000.root").exists());
        assert!(co.queue.is_empty());
    }

    /// S5: a converted part under the `skip_dirty_dat` threshold is never
    /// event-built; the built directory stays empty.
    #[test]
    fn skip_dirty_dat_skips_undersized_converted_part() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();

        let mut co = test_coordinator(raw.clone());
        co.config.monitoring.skip_dirty_dat = true;

        let converted = co.paths.converted.join("converted_run.dat_0000_0000.root");
        std::fs::write(&converted, vec![0u8; 100]).unwrap();

        build(&co, 0, &converted, 0).unwrap();

        assert!(!co.paths.build.join("build_run.dat_0000_0000.root").exists());
        assert!(!co.coordinator_state.has_pending_merges());
    }

    /// S6: a raw-bin part bigger than the split threshold is divided into
    /// fixed-size chunks, each independently enqueued with a sort-key
    /// derived from the triggering ordinal and chunk index.
    #[test]
    fn binary_split_enqueues_one_job_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();

        let mut co = test_coordinator(raw.clone());
        co.config.monitoring.binary_split_m = 1; // 1 MiB chunks

        let source = co.paths.tmp.join("run_raw.bin_0003");
        std::fs::write(&source, vec![0u8; 2 * 1024 * 1024 + 10]).unwrap();

        split_raw_bin(&co, &source, 3).unwrap();

        assert_eq!(co.queue.len(), 3);
        let mut sort_keys = Vec::new();
        while let Some(job) = co.queue.pop_timeout(Duration::from_millis(10)) {
            if let JobPayload::Convert { ordinal, .. } = job.payload {
                sort_keys.push(ordinal);
            }
        }
        sort_keys.sort();
        assert_eq!(sort_keys, vec![40_000, 40_001, 40_002]);
    }
}
