//! Per-worker double-ended work queue.
//!
//! The owning worker pushes and pops at the back (LIFO, so the most recently
//! forked and cache-warm task runs first); thieves take from the front, where
//! the oldest and usually largest pieces of work sit.
//!
//! The queue is coarsely locked. Every push, pop, and steal goes through the
//! same `parking_lot::Mutex`, so a push happens-before the pop or steal that
//! returns the element, and each element is handed out exactly once.

use std::collections::VecDeque;

use parking_lot::Mutex;

pub struct WorkDeque<T> {
    q: Mutex<VecDeque<T>>,
}

impl<T> Default for WorkDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkDeque<T> {
    pub fn new() -> Self {
        Self {
            q: Mutex::new(VecDeque::new()),
        }
    }

    /// Owner side.
    pub fn push(&self, v: T) {
        self.q.lock().push_back(v);
    }

    /// Owner side.
    pub fn pop(&self) -> Option<T> {
        self.q.lock().pop_back()
    }

    /// Thief side.
    pub fn steal(&self) -> Option<T> {
        self.q.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.q.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.lock().is_empty()
    }
}
