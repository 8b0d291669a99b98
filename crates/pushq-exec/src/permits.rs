//! Counting permits with RAII guards.
//!
//! Callers acquire a guard before writing into a shared consumer; dropping the
//! guard returns the permit (panic-safe). `try_acquire` never blocks and is
//! what order-preserving sinks use; `acquire` blocks and is reserved for
//! consumers whose holders never wait on the pool while holding a permit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct PermitsInner {
    capacity: usize,
    available: AtomicUsize,
    lock: Mutex<()>,
    freed: Condvar,
}

impl PermitsInner {
    fn try_take(&self) -> bool {
        loop {
            let cur = self.available.load(Ordering::Relaxed);
            if cur == 0 {
                return false;
            }
            if self
                .available
                .compare_exchange(cur, cur - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
        // Taking the lock orders this release against a waiter's re-check.
        let _g = self.lock.lock();
        self.freed.notify_one();
    }
}

#[derive(Clone)]
pub struct Permits {
    inner: Arc<PermitsInner>,
}

impl Permits {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PermitsInner {
                capacity,
                available: AtomicUsize::new(capacity),
                lock: Mutex::new(()),
                freed: Condvar::new(),
            }),
        }
    }

    pub fn try_acquire(&self) -> Option<PermitGuard> {
        if self.inner.try_take() {
            Some(PermitGuard {
                inner: Arc::clone(&self.inner),
            })
        } else {
            None
        }
    }

    /// Block until a permit is free.
    pub fn acquire(&self) -> PermitGuard {
        if let Some(g) = self.try_acquire() {
            return g;
        }
        let mut lock = self.inner.lock.lock();
        loop {
            if let Some(g) = self.try_acquire() {
                return g;
            }
            self.inner.freed.wait(&mut lock);
        }
    }

    /// Current number of free permits (advisory).
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl std::fmt::Debug for Permits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permits")
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// Holds one permit until dropped.
pub struct PermitGuard {
    inner: Arc<PermitsInner>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        self.inner.release();
    }
}
