//! The job data model: priority ordering, payload kinds, and the wrapper
//! that gives the queue a total order (priority, then sort-key).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Dispatch priority. Lower value wins. Ordering follows the reference
/// orchestrator (`start_monitoring_run.py`'s `Priority` IntEnum) rather than
/// the alternative MERGE-after-SNAPSHOT ordering also allowed by the design
/// notes; see DESIGN.md for the rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    MergeEventBuilding = 1,
    Snapshot = 2,
    EventBuilding = 3,
    Conversion = 4,
    /// Never queued; used only to represent "the queue head is idle work".
    Idle = 5,
}

/// The work payload. Each variant carries exactly what its stage needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobPayload {
    Convert {
        raw_path: PathBuf,
        /// Raw ordinal, carried forward so downstream stages preserve it.
        ordinal: i64,
    },
    Build {
        converted_path: PathBuf,
        ordinal: i64,
    },
    /// A marker that says "there is at least one tmp built-part waiting to
    /// be merged"; the merge queue itself holds the actual paths.
    Merge,
    Snapshot {
        forced: bool,
    },
}

impl JobPayload {
    pub fn priority(&self) -> Priority {
        match self {
            JobPayload::Merge => Priority::MergeEventBuilding,
            JobPayload::Snapshot { .. } => Priority::Snapshot,
            JobPayload::Build { .. } => Priority::EventBuilding,
            JobPayload::Convert { .. } => Priority::Conversion,
        }
    }

    /// Sort-key within a priority tier. Conversion/build jobs sort by
    /// negated ordinal, so the newest raw parts dispatch first and the
    /// monitor stays close to the live edge of the run. Merge/snapshot
    /// markers are unordered amongst themselves (key 0).
    pub fn sort_key(&self) -> i64 {
        match self {
            JobPayload::Convert { ordinal, .. } => -ordinal,
            JobPayload::Build { ordinal, .. } => -ordinal,
            JobPayload::Merge => 0,
            JobPayload::Snapshot { .. } => 0,
        }
    }
}

/// A queued unit of work plus a monotonic sequence number that breaks ties
/// between equal (priority, sort_key) pairs in FIFO order.
#[derive(Debug, Clone)]
pub struct Job {
    pub payload: JobPayload,
    pub sequence: u64,
}

impl Job {
    pub fn new(payload: JobPayload, sequence: u64) -> Self {
        Job { payload, sequence }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.payload.priority() == other.payload.priority()
            && self.payload.sort_key() == other.payload.sort_key()
            && self.sequence == other.sequence
    }
}
impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    /// `BinaryHeap` is a max-heap; we want the *lowest* priority value and
    /// the *lowest* sort-key to pop first, so the comparison is reversed.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .payload
            .priority()
            .cmp(&self.payload.priority())
            .then_with(|| other.payload.sort_key().cmp(&self.payload.sort_key()))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn merge_outranks_everything() {
        let mut heap = BinaryHeap::new();
        heap.push(Job::new(JobPayload::Convert { raw_path: "a".into(), ordinal: 9 }, 0));
        heap.push(Job::new(JobPayload::Snapshot { forced: false }, 1));
        heap.push(Job::new(JobPayload::Merge, 2));
        let top = heap.pop().unwrap();
        assert!(matches!(top.payload, JobPayload::Merge));
    }

    #[test]
    fn newer_ordinal_dispatches_first_within_tier() {
        let mut heap = BinaryHeap::new();
        heap.push(Job::new(JobPayload::Convert { raw_path: "a".into(), ordinal: 2 }, 0));
        heap.push(Job::new(JobPayload::Convert { raw_path: "b".into(), ordinal: 7 }, 1));
        let top = heap.pop().unwrap();
        match top.payload {
            JobPayload::Convert { ordinal, .. } => assert_eq!(ordinal, 7),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn fifo_within_equal_priority_and_sort_key() {
        let mut heap = BinaryHeap::new();
        heap.push(Job::new(JobPayload::Merge, 5));
        heap.push(Job::new(JobPayload::Merge, 2));
        heap.push(Job::new(JobPayload::Merge, 9));
        assert_eq!(heap.pop().unwrap().sequence, 2);
        assert_eq!(heap.pop().unwrap().sequence, 5);
        assert_eq!(heap.pop().unwrap().sequence, 9);
    }
}
