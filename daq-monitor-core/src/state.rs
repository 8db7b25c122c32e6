//! Shared coordinator state (C12): the idle/completion bookkeeping and the
//! LIFO merge queue, all of it cheap scalars behind a small mutex so races
//! on read are tolerated (see SPEC_FULL.md S5).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum spacing between published snapshots, absent a forced request.
pub const SNAPSHOT_MIN_SPACING: Duration = Duration::from_secs(30);

/// Base spacing between idle alerts; grows by this amount per alert
/// (a simple linear backoff, matching the reference implementation's
/// `60 * n_alerts` spacing).
pub const IDLE_ALERT_BASE: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct CoordinatorState {
    pub last_n_built_at_snapshot_decision: AtomicU64,
    pub time_last_snapshot: Mutex<Instant>,
    pub snapshot_needs_current_build: AtomicBool,
    pub n_idle_alerts: AtomicU32,
    pub idle_since: Mutex<Option<Instant>>,
    pub stopped_gracefully: AtomicBool,
    merge_stack: Mutex<Vec<PathBuf>>,
    mergers_in_flight: AtomicU32,
}

impl CoordinatorState {
    pub fn new() -> Self {
        CoordinatorState {
            last_n_built_at_snapshot_decision: AtomicU64::new(0),
            time_last_snapshot: Mutex::new(Instant::now() - SNAPSHOT_MIN_SPACING),
            snapshot_needs_current_build: AtomicBool::new(false),
            n_idle_alerts: AtomicU32::new(0),
            idle_since: Mutex::new(None),
            stopped_gracefully: AtomicBool::new(false),
            merge_stack: Mutex::new(Vec::new()),
            mergers_in_flight: AtomicU32::new(0),
        }
    }

    /// Pushes a tmp built-part path onto the LIFO merge queue.
    pub fn push_merge(&self, tmp_built_path: PathBuf) {
        self.merge_stack.lock().unwrap().push(tmp_built_path);
    }

    /// Drains the entire merge queue at once, LIFO order preserved by the
    /// caller iterating the returned vector from the back... actually the
    /// vector itself is already in push order; callers should `pop()` to
    /// respect LIFO, or iterate in reverse for the same effect.
    pub fn drain_merge_queue(&self) -> Vec<PathBuf> {
        let mut guard = self.merge_stack.lock().unwrap();
        std::mem::take(&mut *guard)
    }

    pub fn has_pending_merges(&self) -> bool {
        !self.merge_stack.lock().unwrap().is_empty()
    }

    pub fn enter_merge(&self) {
        self.mergers_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn exit_merge(&self) {
        self.mergers_in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn any_merge_in_flight(&self) -> bool {
        self.mergers_in_flight.load(Ordering::Acquire) > 0
    }

    /// Whether a snapshot should run now, given the current build count.
    /// `after` and `every` come from the snapshot config section.
    pub fn should_snapshot(
        &self,
        forced: bool,
        current_build_count: u64,
        after: &[u64],
        every: u64,
    ) -> bool {
        if forced {
            return true;
        }
        let elapsed_ok = self.time_last_snapshot.lock().unwrap().elapsed() >= SNAPSHOT_MIN_SPACING;
        if !elapsed_ok {
            return false;
        }
        let last = self.last_n_built_at_snapshot_decision.load(Ordering::Relaxed);
        if current_build_count <= last {
            return false;
        }
        let crossed_after = after.iter().any(|&k| last < k && k <= current_build_count);
        let crossed_every = every > 0 && (current_build_count / every) > (last / every);
        crossed_after || crossed_every
    }

    pub fn record_snapshot_decision(&self, current_build_count: u64) {
        self.last_n_built_at_snapshot_decision
            .store(current_build_count, Ordering::Relaxed);
        *self.time_last_snapshot.lock().unwrap() = Instant::now();
    }

    pub fn mark_idle(&self) {
        let mut guard = self.idle_since.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Instant::now());
        }
    }

    pub fn mark_busy(&self) {
        *self.idle_since.lock().unwrap() = None;
        self.n_idle_alerts.store(0, Ordering::Relaxed);
    }

    /// Returns `true` (and bumps the alert counter) exactly once per
    /// exponentially-growing idle window, matching the reference
    /// implementation's "alert, then wait longer before alerting again".
    pub fn should_alert_idle(&self) -> bool {
        let since = match *self.idle_since.lock().unwrap() {
            Some(t) => t,
            None => return false,
        };
        let n = self.n_idle_alerts.load(Ordering::Relaxed);
        let threshold = IDLE_ALERT_BASE * (n + 1);
        if since.elapsed() >= threshold {
            self.n_idle_alerts.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_respects_minimum_spacing() {
        let state = CoordinatorState::new();
        state.record_snapshot_decision(0);
        assert!(!state.should_snapshot(false, 5, &[], 10_000));
    }

    #[test]
    fn snapshot_forced_ignores_spacing_and_progress() {
        let state = CoordinatorState::new();
        state.record_snapshot_decision(5);
        assert!(state.should_snapshot(true, 5, &[], 10_000));
    }

    #[test]
    fn merge_queue_is_lifo_when_popped() {
        let state = CoordinatorState::new();
        state.push_merge("a".into());
        state.push_merge("b".into());
        let drained = state.drain_merge_queue();
        assert_eq!(drained.last().unwrap(), &PathBuf::from("b"));
    }

    #[test]
    fn idle_alert_does_not_fire_immediately() {
        let state = CoordinatorState::new();
        state.mark_idle();
        assert!(!state.should_alert_idle());
    }
}
