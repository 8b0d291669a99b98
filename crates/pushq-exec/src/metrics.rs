//! Per-worker counters.
//!
//! Observability only; nothing in the scheduler reads them back. Counters use
//! relaxed atomics so recording stays off the critical path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Default)]
pub struct WorkerStats {
    exec_count: AtomicU64,
    exec_nanos: AtomicU64,
    steal_count: AtomicU64,
    robbed_count: AtomicU64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exec(&self, took: Duration) {
        self.exec_count.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(took.as_nanos()).unwrap_or(u64::MAX);
        self.exec_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn record_steal(&self) {
        self.steal_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_robbed(&self) {
        self.robbed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, worker: usize) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            worker,
            exec_count: self.exec_count.load(Ordering::Relaxed),
            exec_time_ms: self.exec_nanos.load(Ordering::Relaxed) / 1_000_000,
            steal_count: self.steal_count.load(Ordering::Relaxed),
            robbed_count: self.robbed_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub worker: usize,
    /// Tasks executed by the worker, own or stolen.
    pub exec_count: u64,
    pub exec_time_ms: u64,
    /// Tasks this worker stole from others.
    pub steal_count: u64,
    /// Tasks others stole from this worker.
    pub robbed_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let s = WorkerStats::new();
        s.record_exec(Duration::from_millis(3));
        s.record_exec(Duration::from_millis(4));
        s.record_steal();
        s.record_robbed();
        s.record_robbed();
        let snap = s.snapshot(2);
        assert_eq!(snap.worker, 2);
        assert_eq!(snap.exec_count, 2);
        assert_eq!(snap.exec_time_ms, 7);
        assert_eq!(snap.steal_count, 1);
        assert_eq!(snap.robbed_count, 2);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"robbed_count\":2"));
    }
}
