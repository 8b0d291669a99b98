//! Fixed-size work-stealing pool.
//!
//! Each worker owns a [`WorkDeque`](crate::deque::WorkDeque). A worker takes
//! from its own queue first, then steals, preferring the victim it last stole
//! from (a worker that just had work taken probably holds more pieces of the
//! same batch) before scanning everyone once. Idle workers spin briefly,
//! park for short intervals, and after 64 fruitless rounds register on the
//! inactive queue and park until a producer removes and unparks them. Only
//! one worker is woken per signal.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pushq_core::{Error, Result};
use tracing::{debug, trace};

use crate::metrics::WorkerStatsSnapshot;
use crate::task::Task;
use crate::worker::{Worker, NO_VICTIM};

const PARK_AFTER: u32 = 64;
const NAP_EVERY: u32 = 16;
const NAP: Duration = Duration::from_nanos(100);

thread_local! {
    static CURRENT: RefCell<Option<(Arc<PoolShared>, usize)>> = const { RefCell::new(None) };
}

fn current() -> Option<(Arc<PoolShared>, usize)> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Called by `Task::join`. Returns false when the calling thread is not a
/// pool worker, in which case the caller must block instead.
pub(crate) fn help_until_finished(task: &Task) -> bool {
    match current() {
        Some((shared, idx)) => {
            shared.join_loop(idx, task);
            true
        }
        None => false,
    }
}

/// Run one queued task on the calling worker, if it can find one. `None`
/// when the caller is not a pool worker.
pub fn help_once() -> Option<bool> {
    let (shared, idx) = current()?;
    match shared.find_work(idx) {
        Some(t) => {
            shared.exec(idx, &t);
            Some(true)
        }
        None => Some(false),
    }
}

struct PoolShared {
    workers: Vec<Worker>,
    inactive: Mutex<VecDeque<usize>>,
    terminate: AtomicBool,
    next_fallback: AtomicUsize,
}

impl PoolShared {
    fn find_work(&self, idx: usize) -> Option<Task> {
        self.workers[idx].deque.pop().or_else(|| self.steal(idx))
    }

    fn steal(&self, idx: usize) -> Option<Task> {
        let me = &self.workers[idx];
        let v = me.victim();
        if v != NO_VICTIM && v != idx {
            if let Some(t) = self.workers[v].deque.steal() {
                self.record_steal(idx, v);
                return Some(t);
            }
        }
        let n = self.workers.len();
        for k in 1..n {
            let j = (idx + k) % n;
            if let Some(t) = self.workers[j].deque.steal() {
                me.set_victim(j);
                self.record_steal(idx, j);
                return Some(t);
            }
        }
        me.set_victim(NO_VICTIM);
        None
    }

    fn record_steal(&self, thief: usize, victim: usize) {
        self.workers[thief].stats.record_steal();
        self.workers[victim].stats.record_robbed();
        trace!(thief, victim, "steal");
    }

    fn exec(&self, idx: usize, t: &Task) {
        let start = Instant::now();
        t.exec();
        self.workers[idx].stats.record_exec(start.elapsed());
    }

    /// Wake one parked worker, if any.
    fn signal_work(&self) {
        let w = self.inactive.lock().pop_front();
        if let Some(i) = w {
            self.workers[i].unpark();
        }
    }

    fn push_to(&self, i: usize, t: Task) {
        self.workers[i].deque.push(t);
    }

    fn fallback(&self) -> usize {
        self.next_fallback.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    fn leave_inactive(&self, idx: usize) {
        self.inactive.lock().retain(|&w| w != idx);
    }

    fn run(&self, idx: usize) {
        let me = &self.workers[idx];
        let mut retry = 0u32;
        while !self.terminate.load(Ordering::Acquire) {
            if let Some(t) = self.find_work(idx) {
                self.exec(idx, &t);
                retry = 0;
                continue;
            }
            retry += 1;
            if retry == PARK_AFTER {
                self.inactive.lock().push_back(idx);
                // Re-check after registering: a producer that pushed before
                // seeing us on the queue must not be missed.
                if let Some(t) = self.find_work(idx) {
                    self.leave_inactive(idx);
                    self.exec(idx, &t);
                } else if !self.terminate.load(Ordering::Acquire) {
                    trace!(worker = %me.id, "parking");
                    thread::park();
                    self.leave_inactive(idx);
                }
                retry = 0;
            } else if retry % NAP_EVERY == 0 {
                thread::park_timeout(NAP);
            } else {
                std::hint::spin_loop();
            }
        }
    }

    fn join_loop(&self, idx: usize, task: &Task) {
        let mut retry = 0u32;
        while !task.finished() {
            if let Some(t) = self.workers[idx].deque.pop() {
                self.exec(idx, &t);
                retry = 0;
            } else if let Some(t) = self.steal(idx) {
                self.exec(idx, &t);
                retry = 0;
            } else if self.terminate.load(Ordering::Acquire) {
                return;
            } else {
                retry += 1;
                if retry == NAP_EVERY {
                    thread::park_timeout(NAP);
                    retry = 0;
                }
            }
        }
    }
}

pub struct Pool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Start `size` worker threads. The size is fixed for the pool's life.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("pool size must be at least 1".into()));
        }
        let shared = Arc::new(PoolShared {
            workers: (0..size).map(Worker::new).collect(),
            inactive: Mutex::new(VecDeque::with_capacity(size)),
            terminate: AtomicBool::new(false),
            next_fallback: AtomicUsize::new(0),
        });
        let pool = Pool {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(size)),
        };

        for idx in 0..size {
            let s = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("pushq-worker-{idx}"))
                .spawn(move || worker_main(s, idx))
                .map_err(|e| Error::Pool(format!("spawn worker {idx}: {e}")))?;
            pool.threads.lock().push(handle);
        }
        debug!(size, "pool started");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.shared.workers.len()
    }

    /// Index of the calling thread if it is a worker of this pool.
    pub fn current_worker(&self) -> Option<usize> {
        current().and_then(|(s, idx)| Arc::ptr_eq(&s, &self.shared).then_some(idx))
    }

    /// Schedule `task` as a child of the current computation. On a worker of
    /// this pool the task goes to the worker's own queue; from anywhere else
    /// this is [`submit`](Self::submit).
    pub fn fork(&self, task: &Task) {
        match self.current_worker() {
            Some(idx) => {
                self.shared.push_to(idx, task.clone());
                self.shared.signal_work();
            }
            None => {
                self.submit(task.clone());
            }
        }
    }

    /// Hand `task` to the pool: the caller's own queue when it is a worker,
    /// else an idle worker, else a fallback worker. Never drops the task.
    pub fn submit(&self, task: Task) -> Task {
        if let Some(idx) = self.current_worker() {
            self.shared.push_to(idx, task.clone());
            self.shared.signal_work();
            return task;
        }
        let idle = self.shared.inactive.lock().pop_front();
        match idle {
            Some(i) => {
                self.shared.push_to(i, task.clone());
                self.shared.workers[i].unpark();
            }
            None => {
                let i = self.shared.fallback();
                self.shared.push_to(i, task.clone());
                // The fallback may have gone idle meanwhile.
                self.shared.signal_work();
            }
        }
        task
    }

    /// Like `submit`, but reports whether the task went to a thread other
    /// than the caller.
    pub fn dispatch(&self, task: Task) -> bool {
        let idle = self.shared.inactive.lock().pop_front();
        if let Some(i) = idle {
            self.shared.push_to(i, task);
            self.shared.workers[i].unpark();
            return true;
        }
        let i = self.shared.fallback();
        self.shared.push_to(i, task);
        self.shared.signal_work();
        self.current_worker() != Some(i)
    }

    /// Wake one parked worker, if any.
    pub fn signal_work(&self) {
        self.shared.signal_work();
    }

    pub fn stats(&self) -> Vec<WorkerStatsSnapshot> {
        self.shared
            .workers
            .iter()
            .map(|w| w.stats.snapshot(w.index))
            .collect()
    }

    /// Stop all workers and wait for them. Idempotent. Queued tasks that
    /// never ran stay unfinished.
    pub fn shutdown(&self) {
        if self.shared.terminate.swap(true, Ordering::AcqRel) {
            return;
        }
        for w in &self.shared.workers {
            w.unpark();
        }
        let me = thread::current().id();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for h in handles {
            if h.thread().id() == me {
                continue;
            }
            let _ = h.join();
        }
        for s in self.stats() {
            debug!(
                worker = s.worker,
                execs = s.exec_count,
                exec_ms = s.exec_time_ms,
                steals = s.steal_count,
                robbed = s.robbed_count,
                "worker stats"
            );
        }
        debug!(size = self.size(), "pool stopped");
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("size", &self.size()).finish()
    }
}

fn worker_main(shared: Arc<PoolShared>, idx: usize) {
    shared.workers[idx].bind_current_thread();
    CURRENT.with(|c| *c.borrow_mut() = Some((Arc::clone(&shared), idx)));
    debug!(worker = %shared.workers[idx].id, idx, "worker started");
    shared.run(idx);
    debug!(worker = %shared.workers[idx].id, idx, "worker stopped");
    CURRENT.with(|c| *c.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn fib(pool: Arc<Pool>, n: u64, out: Arc<AtomicU64>) -> Task {
        Task::new(move || {
            if n < 2 {
                out.fetch_add(n, Ordering::Relaxed);
                return Ok(());
            }
            let left = fib(Arc::clone(&pool), n - 1, Arc::clone(&out));
            pool.fork(&left);
            fib(Arc::clone(&pool), n - 2, Arc::clone(&out)).exec();
            left.join()
        })
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        assert!(matches!(Pool::new(0), Err(Error::Config(_))));
    }

    #[test]
    fn nested_fork_join_completes_for_every_size() {
        for size in [1, 2, 4] {
            let pool = Arc::new(Pool::new(size).unwrap());
            let out = Arc::new(AtomicU64::new(0));
            let root = pool.submit(fib(Arc::clone(&pool), 18, Arc::clone(&out)));
            root.join().unwrap();
            assert_eq!(out.load(Ordering::Relaxed), 2584, "size {size}");
            pool.shutdown();
        }
    }

    #[test]
    fn failing_task_does_not_stall_the_pool() {
        let pool = Pool::new(2).unwrap();
        let bad = pool.submit(Task::new(|| panic!("bad task")));
        assert!(matches!(bad.join(), Err(Error::Panicked(_))));
        let good = pool.submit(Task::new(|| Ok(())));
        good.join().unwrap();
    }

    #[test]
    fn help_once_runs_queued_children() {
        assert_eq!(help_once(), None);
        let pool = Arc::new(Pool::new(1).unwrap());
        let outer = {
            let pool = Arc::clone(&pool);
            Task::new(move || {
                let child = Task::new(|| Ok(()));
                pool.fork(&child);
                assert_eq!(help_once(), Some(true));
                assert!(child.finished());
                assert_eq!(help_once(), Some(false));
                child.join()
            })
        };
        pool.submit(outer).join().unwrap();
    }

    #[test]
    fn dispatch_from_foreign_thread_goes_elsewhere() {
        let pool = Pool::new(2).unwrap();
        let t = Task::new(|| Ok(()));
        assert!(pool.dispatch(t.clone()));
        t.join().unwrap();
        assert_eq!(pool.current_worker(), None);
    }

    #[test]
    fn stats_cover_every_worker() {
        let pool = Pool::new(3).unwrap();
        let tasks: Vec<_> = (0..50).map(|_| pool.submit(Task::new(|| Ok(())))).collect();
        for t in &tasks {
            t.join().unwrap();
        }
        // Counters are bumped after a task publishes; settle them first.
        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.len(), 3);
        let execs: u64 = stats.iter().map(|s| s.exec_count).sum();
        let steals: u64 = stats.iter().map(|s| s.steal_count).sum();
        let robbed: u64 = stats.iter().map(|s| s.robbed_count).sum();
        assert_eq!(execs, 50);
        assert_eq!(steals, robbed);
    }
}
