//! The fork/join task.
//!
//! A `Task` wraps one boxed closure. `exec` runs it at most once, traps errors
//! and panics, and publishes the terminal status with a single
//! compare-and-swap, so concurrent joiners observe one transition and at most
//! one thread performs the wake-up.
//!
//! Status transitions:
//!
//! ```text
//! Unset ──exec──▶ Success | Error
//!   │
//!   └─waiter─▶ Notifying ──exec──▶ Success | Error   (+ notify monitor)
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use pushq_core::{Error, Result, TaskId};

const UNSET: u8 = 0;
const NOTIFYING: u8 = 1;
const SUCCESS: u8 = 2;
const ERROR: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Unset,
    /// Not finished; a blocked waiter asked to be notified.
    Notifying,
    Success,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Error)
    }
}

type Body = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct TaskInner {
    id: TaskId,
    status: AtomicU8,
    body: Mutex<Option<Body>>,
    error: Mutex<Option<Error>>,
    monitor: Mutex<()>,
    done: Condvar,
}

/// Cloneable handle to one unit of work.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            inner: Arc::new(TaskInner {
                id: TaskId::fresh(),
                status: AtomicU8::new(UNSET),
                body: Mutex::new(Some(Box::new(body))),
                error: Mutex::new(None),
                monitor: Mutex::new(()),
                done: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Run the body on the current thread. Failures are stored, not returned;
    /// a joiner sees them. Running an already-run task does nothing.
    pub fn exec(&self) {
        let body = self.inner.body.lock().take();
        let Some(body) = body else {
            return;
        };

        let outcome = match catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(panic) => Err(Error::Panicked(panic_message(&*panic))),
        };

        match outcome {
            Ok(()) => self.publish(SUCCESS),
            Err(e) => {
                tracing::error!(task = %self.inner.id, error = %e, "task failed");
                *self.inner.error.lock() = Some(e);
                self.publish(ERROR);
            }
        }
    }

    fn publish(&self, terminal: u8) {
        let status = &self.inner.status;
        loop {
            let cur = status.load(Ordering::Acquire);
            if cur >= SUCCESS {
                return;
            }
            if status
                .compare_exchange(cur, terminal, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if cur == NOTIFYING {
                    let _g = self.inner.monitor.lock();
                    self.inner.done.notify_all();
                }
                return;
            }
        }
    }

    /// Non-blocking poll.
    pub fn finished(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn status(&self) -> TaskStatus {
        match self.inner.status.load(Ordering::Acquire) {
            UNSET => TaskStatus::Unset,
            NOTIFYING => TaskStatus::Notifying,
            SUCCESS => TaskStatus::Success,
            _ => TaskStatus::Error,
        }
    }

    /// Wait for the task and surface its outcome.
    ///
    /// On a pool worker the caller keeps executing queued and stolen work
    /// while it waits. Any other thread blocks on the task's monitor.
    pub fn join(&self) -> Result<()> {
        if !self.finished() && !crate::pool::help_until_finished(self) {
            self.wait_for_finish();
        }
        self.result()
    }

    /// Block on the monitor until the task finishes, regardless of the
    /// calling thread. Never use this from a worker for a task that may sit
    /// in that worker's own queue.
    pub fn wait_for_finish(&self) {
        if self.finished() {
            return;
        }
        let mut g = self.inner.monitor.lock();
        loop {
            let cur = self.inner.status.load(Ordering::Acquire);
            if cur >= SUCCESS {
                return;
            }
            if cur == UNSET {
                // Either we register as waiter, or exec already published.
                let _ = self.inner.status.compare_exchange(
                    UNSET,
                    NOTIFYING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            self.inner.done.wait(&mut g);
        }
    }

    /// Outcome of a finished task. Calling this before the task finished is
    /// an invariant violation.
    pub fn result(&self) -> Result<()> {
        match self.inner.status.load(Ordering::Acquire) {
            SUCCESS => Ok(()),
            ERROR => Err(self
                .inner
                .error
                .lock()
                .clone()
                .unwrap_or_else(|| Error::Invariant("task error missing".into()))),
            s => Err(Error::Invariant(format!("task {} not finished (status {s})", self.inner.id))),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn exec_runs_body_once() {
        let n = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&n);
        let t = Task::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(t.status(), TaskStatus::Unset);
        t.exec();
        t.exec();
        assert_eq!(n.load(Ordering::SeqCst), 1);
        assert_eq!(t.status(), TaskStatus::Success);
        t.join().unwrap();
    }

    #[test]
    fn errors_and_panics_are_captured() {
        let t = Task::new(|| Err(Error::eval("boom")));
        t.exec();
        assert_eq!(t.status(), TaskStatus::Error);
        assert!(matches!(t.join(), Err(Error::Eval(m)) if m == "boom"));

        let p = Task::new(|| panic!("kaput"));
        p.exec();
        assert!(matches!(p.join(), Err(Error::Panicked(m)) if m == "kaput"));
    }

    #[test]
    fn foreign_waiter_is_woken() {
        let t = Task::new(|| {
            thread::sleep(Duration::from_millis(20));
            Ok(())
        });
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let t = t.clone();
                thread::spawn(move || t.join())
            })
            .collect();
        thread::sleep(Duration::from_millis(5));
        let runner = t.clone();
        thread::spawn(move || runner.exec()).join().unwrap();
        for w in waiters {
            w.join().unwrap().unwrap();
        }
        assert!(t.finished());
    }

    #[test]
    fn result_before_finish_is_an_invariant_error() {
        let t = Task::new(|| Ok(()));
        assert!(matches!(t.result(), Err(Error::Invariant(_))));
    }
}
