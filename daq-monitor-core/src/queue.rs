//! The shared priority job queue (C5).
//!
//! Grounded on the teacher's `BinaryHeap`-backed `JobQueue`, but adapted
//! from a tokio-channel-driven queue to a blocking `Mutex` + `Condvar`,
//! since workers here are OS threads blocked on external-process calls
//! rather than async tasks (see DESIGN.md).

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::job::{Job, JobPayload};

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Job>,
}

/// A cheaply clonable handle to the shared priority queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Mutex<Inner>>,
    condvar: Arc<Condvar>,
    sequence: Arc<AtomicU64>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.lock().unwrap().heap.len();
        f.debug_struct("JobQueue").field("len", &len).finish()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        JobQueue {
            inner: Arc::new(Mutex::new(Inner::default())),
            condvar: Arc::new(Condvar::new()),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueues one payload, stamping it with the next monotonic sequence
    /// number so FIFO order is preserved within equal (priority, sort-key).
    pub fn push(&self, payload: JobPayload) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let job = Job::new(payload, seq);
        let mut inner = self.inner.lock().unwrap();
        inner.heap.push(job);
        self.condvar.notify_one();
    }

    /// Blocks up to `timeout` for a job to become available, returning
    /// `None` on timeout so the caller can fall back to scanning.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(job) = inner.heap.pop() {
                return Some(job);
            }
            let (guard, result) = self.condvar.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() && inner.heap.is_empty() {
                return None;
            }
        }
    }

    /// Peeks at the head priority without removing it, used by workers
    /// deciding whether it's worth invoking the raw-discovery scanner.
    pub fn peek_priority(&self) -> Option<crate::job::Priority> {
        self.inner
            .lock()
            .unwrap()
            .heap
            .peek()
            .map(|j| j.payload.priority())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let q = JobQueue::new();
        assert!(q.pop_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn push_then_pop_respects_priority() {
        let q = JobQueue::new();
        q.push(JobPayload::Convert { raw_path: "a".into(), ordinal: 1 });
        q.push(JobPayload::Merge);
        let job = q.pop_timeout(Duration::from_millis(20)).unwrap();
        assert!(matches!(job.payload, JobPayload::Merge));
    }

    #[test]
    fn blocked_pop_wakes_on_push() {
        let q = JobQueue::new();
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(30));
        q.push(JobPayload::Merge);
        let job = handle.join().unwrap();
        assert!(job.is_some());
    }
}
