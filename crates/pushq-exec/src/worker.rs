//! One pool thread's state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::Thread;

use once_cell::sync::OnceCell;
use pushq_core::WorkerId;

use crate::deque::WorkDeque;
use crate::metrics::WorkerStats;
use crate::task::Task;

pub(crate) const NO_VICTIM: usize = usize::MAX;

pub(crate) struct Worker {
    pub(crate) index: usize,
    pub(crate) id: WorkerId,
    pub(crate) deque: WorkDeque<Task>,
    /// Index of the worker this one last stole from, or `NO_VICTIM`.
    victim: AtomicUsize,
    pub(crate) stats: WorkerStats,
    /// Set by the worker thread itself before it can register as idle, so
    /// anyone who finds it on the inactive queue can unpark it.
    thread: OnceCell<Thread>,
}

impl Worker {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            id: WorkerId::fresh(),
            deque: WorkDeque::new(),
            victim: AtomicUsize::new(NO_VICTIM),
            stats: WorkerStats::new(),
            thread: OnceCell::new(),
        }
    }

    pub(crate) fn victim(&self) -> usize {
        self.victim.load(Ordering::Relaxed)
    }

    pub(crate) fn set_victim(&self, v: usize) {
        self.victim.store(v, Ordering::Relaxed);
    }

    pub(crate) fn bind_current_thread(&self) {
        let _ = self.thread.set(std::thread::current());
    }

    pub(crate) fn unpark(&self) {
        if let Some(t) = self.thread.get() {
            t.unpark();
        }
    }
}
