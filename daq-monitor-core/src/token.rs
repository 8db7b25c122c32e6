//! The exclusive token guarding the cumulative artifact (C6).
//!
//! Modeled as a single-slot handoff rather than the teacher's TTL-based
//! lease (`scan/orchestration/lease.rs`): there is exactly one cumulative
//! artifact per run and exactly one legitimate holder at a time, so a
//! lease-renewal protocol would be solving a problem this system doesn't
//! have. `try_acquire` mirrors the `queue.Queue(maxsize=1).get(timeout=2)`
//! semantics of the reference implementation.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A single-slot mutual-exclusion handoff. `true` means the token is free.
pub struct ExclusiveToken {
    free: Mutex<bool>,
    condvar: Condvar,
}

impl std::fmt::Debug for ExclusiveToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveToken")
            .field("free", &*self.free.lock().unwrap())
            .finish()
    }
}

/// RAII guard returned by a successful acquire; dropping it releases the token.
pub struct TokenGuard<'a> {
    token: &'a ExclusiveToken,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.token.release();
    }
}

impl ExclusiveToken {
    pub fn new() -> Self {
        ExclusiveToken {
            free: Mutex::new(true),
            condvar: Condvar::new(),
        }
    }

    /// Attempts to acquire the token within `timeout`. Returns `None` on
    /// timeout so the caller (the merger stage) can decide whether to drop
    /// or re-enqueue its marker per S4.8's contention algorithm.
    pub fn try_acquire(&self, timeout: Duration) -> Option<TokenGuard<'_>> {
        let mut free = self.free.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while !*free {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .condvar
                .wait_timeout(free, deadline - now)
                .unwrap();
            free = guard;
            if result.timed_out() && !*free {
                return None;
            }
        }
        *free = false;
        Some(TokenGuard { token: self })
    }

    fn release(&self) {
        let mut free = self.free.lock().unwrap();
        *free = true;
        self.condvar.notify_one();
    }
}

impl Default for ExclusiveToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn second_acquire_times_out_while_held() {
        let token = Arc::new(ExclusiveToken::new());
        let guard = token.try_acquire(Duration::from_millis(50)).unwrap();
        assert!(token.try_acquire(Duration::from_millis(20)).is_none());
        drop(guard);
        assert!(token.try_acquire(Duration::from_millis(20)).is_some());
    }

    #[test]
    fn release_wakes_a_blocked_waiter() {
        let token = Arc::new(ExclusiveToken::new());
        let guard = token.try_acquire(Duration::from_millis(50)).unwrap();
        let token2 = token.clone();
        let handle = thread::spawn(move || token2.try_acquire(Duration::from_secs(2)).is_some());
        thread::sleep(Duration::from_millis(30));
        drop(guard);
        assert!(handle.join().unwrap());
    }
}
