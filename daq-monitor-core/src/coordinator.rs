//! The worker pool (C7) and the idle/completion state machine (C12) that
//! ties every other component together into a run-to-completion driver.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::external::ToolBundle;
use crate::job::JobPayload;
use crate::masking::bootstrap_masking;
use crate::paths::{classify_and_prepare, Classification, RunPaths};
use crate::queue::JobQueue;
use crate::scanner::{scan_once, ScannerState};
use crate::stages::{self, MergeOutcome};
use crate::state::CoordinatorState;

const POP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Coordinator {
    pub raw_run_folder: PathBuf,
    pub paths: RunPaths,
    pub config: MonitorConfig,
    pub queue: JobQueue,
    pub token: crate::token::ExclusiveToken,
    pub scanner_state: ScannerState,
    pub coordinator_state: CoordinatorState,
    pub tools: Arc<dyn ToolBundle>,
    panicked: AtomicBool,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("raw_run_folder", &self.raw_run_folder)
            .field("output_dir", &self.paths.output_dir)
            .finish()
    }
}

/// Outcome of a completed (or short-circuited) monitoring run.
#[derive(Debug)]
pub struct RunOutcome {
    pub stopped_gracefully: bool,
    pub final_artifact: Option<PathBuf>,
}

impl Coordinator {
    pub fn new(
        raw_run_folder: PathBuf,
        mut config: MonitorConfig,
        tools: Arc<dyn ToolBundle>,
    ) -> Self {
        config.resolve_identity(&raw_run_folder);
        let output_name = config
            .monitoring
            .output_name
            .clone()
            .unwrap_or_else(|| "run".to_string());
        let output_dir = config.monitoring.output_parent.join(output_name);
        Coordinator {
            raw_run_folder,
            paths: RunPaths::new(output_dir),
            config,
            queue: JobQueue::new(),
            token: crate::token::ExclusiveToken::new(),
            scanner_state: ScannerState::new(),
            coordinator_state: CoordinatorState::new(),
            tools,
            panicked: AtomicBool::new(false),
        }
    }

    /// Drives one run to completion: bootstrap, worker pool, wrap-up.
    /// Returns `Ok` with the final artifact path on success, or a
    /// `MonitorError` for startup failures (`AlreadyDone`/`Skipped` are
    /// carried as `Err` on purpose; see `error.rs`).
    pub fn run_to_completion(self: Arc<Self>) -> Result<RunOutcome> {
        match classify_and_prepare(&self.paths)? {
            Classification::AlreadyDone => return Err(MonitorError::AlreadyDone(self.paths.output_dir.clone())),
            Classification::Skipped => return Err(MonitorError::Skipped(self.paths.output_dir.clone())),
            Classification::Fresh | Classification::Restart => {}
        }

        self.paths.ensure_directories()?;
        self.config.write_effective(&self.paths.monitoring_cfg())?;

        if !self.paths.masked_channels().exists() {
            bootstrap_masking(&self.raw_run_folder, &self.paths, self.tools.masker())?;
        }

        let n_workers = self.config.monitoring.max_workers;
        let mut handles = Vec::with_capacity(n_workers);
        for worker_id in 0..n_workers {
            let co = Arc::clone(&self);
            handles.push(
                thread::Builder::new()
                    .name(format!("daq-worker-{worker_id}"))
                    .spawn(move || worker_loop(&co, worker_id))
                    .expect("failed to spawn worker thread"),
            );
            // A short stagger between worker starts avoids a thundering
            // herd of simultaneous first scans.
            thread::sleep(Duration::from_millis(200));
        }

        let mut any_panicked = false;
        for (worker_id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(worker = worker_id, error = %e, "worker returned an error");
                    any_panicked = true;
                }
                Err(_) => {
                    error!(worker = worker_id, "worker thread panicked");
                    any_panicked = true;
                }
            }
        }

        if any_panicked {
            return Err(MonitorError::WorkerPanic(
                "one or more workers terminated abnormally".into(),
            ));
        }

        let stopped_gracefully = self.coordinator_state.stopped_gracefully.load(Ordering::Relaxed);
        let final_name = if stopped_gracefully {
            "stopped_run.root"
        } else {
            "full_run.root"
        };
        let final_artifact = if self.paths.current_build().exists() {
            stages::snapshot(&self, -1, Some(final_name))?
        } else {
            None
        };

        Ok(RunOutcome {
            stopped_gracefully,
            final_artifact,
        })
    }

    fn all_done(&self) -> bool {
        self.scanner_state.run_finished()
            && self.queue.is_empty()
            && !self.coordinator_state.any_merge_in_flight()
            && !self.coordinator_state.has_pending_merges()
    }

    fn graceful_stop_latched(&self) -> bool {
        if self.paths.stop_monitoring().exists() {
            self.coordinator_state
                .stopped_gracefully
                .store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn trigger_peer_shutdown(&self) {
        if !self.panicked.swap(true, Ordering::AcqRel) {
            let _ = std::fs::File::create(self.paths.stop_monitoring());
            warn!("writing stop_monitoring sentinel so peer workers exit cleanly");
        }
    }

    fn current_build_count(&self) -> u64 {
        std::fs::read_dir(&self.paths.build)
            .map(|rd| rd.filter_map(|e| e.ok()).count() as u64)
            .unwrap_or(0)
    }

    /// Decides whether a snapshot is due (S4.9's triggers) and, if so,
    /// enqueues a `Snapshot` job so the priority queue (not this call's
    /// own worker) governs when it actually dispatches, matching
    /// `start_monitoring_run.py`'s `job_queue.put((Priority.SNAP_SHOT, ...))`.
    fn maybe_snapshot(&self) {
        let forced = self.paths.get_snapshot_request().exists();
        let count = self.current_build_count();
        if self.coordinator_state.should_snapshot(
            forced,
            count,
            &self.config.snapshot.after,
            self.config.snapshot.every,
        ) {
            self.coordinator_state.record_snapshot_decision(count);
            if forced {
                let _ = std::fs::remove_file(self.paths.get_snapshot_request());
            }
            self.queue.push(JobPayload::Snapshot { forced });
        }
    }

    fn maybe_scan(&self, raw_run_folder: &Path) {
        let enqueued = scan_once(raw_run_folder, &self.queue, &self.scanner_state);
        if !enqueued.is_empty() {
            self.coordinator_state.mark_busy();
        }
    }

    fn check_idle_alert(&self) {
        if self.coordinator_state.should_alert_idle()
            && !self.paths.suppress_idle_info().exists()
        {
            info!(
                "still waiting for new raw parts; create `{}` to mark the run as done manually",
                self.paths.output_dir.join("hitsHistogram.txt").display()
            );
        }
    }
}

/// The symmetric per-worker loop (S4.5): every worker runs this identical
/// body; workers are interchangeable.
fn worker_loop(co: &Coordinator, worker_id: usize) -> Result<()> {
    let result = worker_loop_inner(co, worker_id);
    if result.is_err() {
        co.trigger_peer_shutdown();
    }
    result
}

fn worker_loop_inner(co: &Coordinator, worker_id: usize) -> Result<()> {
    loop {
        co.maybe_snapshot();

        if matches!(
            co.queue.peek_priority(),
            None | Some(crate::job::Priority::Conversion) | Some(crate::job::Priority::Idle)
        ) {
            co.maybe_scan(&co.raw_run_folder);
        }

        if co.all_done() {
            info!(worker = worker_id, "run complete, no more work");
            return Ok(());
        }

        if co.graceful_stop_latched() {
            info!(worker = worker_id, "graceful stop observed, exiting");
            return Ok(());
        }

        let job = match co.queue.pop_timeout(POP_TIMEOUT) {
            Some(j) => j,
            None => {
                co.coordinator_state.mark_idle();
                co.check_idle_alert();
                continue;
            }
        };
        co.coordinator_state.mark_busy();

        let wid = worker_id as i64;
        match job.payload {
            JobPayload::Convert { raw_path, ordinal } => {
                stages::convert(co, wid, &raw_path, ordinal)?;
            }
            JobPayload::Build {
                converted_path,
                ordinal,
            } => {
                stages::build(co, wid, &converted_path, ordinal)?;
            }
            JobPayload::Merge => match stages::merge(co, wid)? {
                MergeOutcome::Handled | MergeOutcome::AnotherMergerActive => {}
                MergeOutcome::Contended => {
                    co.queue.push(JobPayload::Merge);
                }
            },
            JobPayload::Snapshot { forced } => {
                stages::snapshot(co, wid, None).map_err(|e| {
                    error!(worker = worker_id, forced, error = %e, "snapshot job failed");
                    e
                })?;
            }
        }
    }
}
