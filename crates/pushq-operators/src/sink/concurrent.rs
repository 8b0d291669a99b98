//! Unordered fan-in.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use pushq_core::{Result, SinkId, Tuple};
use pushq_exec::Permits;

use super::Sink;

/// Thread-safe target of a [`ConcurrentSink`].
pub trait Consumer: Send + Sync + 'static {
    fn consume(&self, batch: &[Tuple]) -> Result<()>;

    /// All handles ended.
    fn finish(&self) -> Result<()>;

    /// Some handle failed.
    fn abort(&self);
}

struct Shared<C> {
    consumer: Arc<C>,
    open: AtomicUsize,
    failed: AtomicBool,
    permits: Permits,
}

/// Every fork writes straight into the shared consumer, at most
/// `permits` of them at a time. Arrival order is not preserved.
pub struct ConcurrentSink<C: Consumer> {
    id: SinkId,
    shared: Arc<Shared<C>>,
    done: bool,
}

impl<C: Consumer> ConcurrentSink<C> {
    pub fn new(consumer: Arc<C>, permits: Permits) -> Self {
        Self {
            id: SinkId::fresh(),
            shared: Arc::new(Shared {
                consumer,
                open: AtomicUsize::new(1),
                failed: AtomicBool::new(false),
                permits,
            }),
            done: false,
        }
    }

    fn abort(&mut self) {
        self.done = true;
        if !self.shared.failed.swap(true, Ordering::AcqRel) {
            self.shared.consumer.abort();
        }
        self.shared.open.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<C: Consumer> Sink for ConcurrentSink<C> {
    fn id(&self) -> SinkId {
        self.id
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn output(&mut self, batch: &[Tuple]) -> Result<()> {
        if self.shared.failed.load(Ordering::Acquire) {
            return Ok(());
        }
        let _permit = self.shared.permits.acquire();
        self.shared.consumer.consume(batch)
    }

    fn end(mut self: Box<Self>) -> Result<()> {
        self.done = true;
        let last = self.shared.open.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && !self.shared.failed.load(Ordering::Acquire) {
            return self.shared.consumer.finish();
        }
        Ok(())
    }

    fn fail(mut self: Box<Self>) {
        self.abort();
    }

    fn fork(&mut self) -> Box<dyn Sink> {
        self.shared.open.fetch_add(1, Ordering::AcqRel);
        Box::new(ConcurrentSink {
            id: SinkId::fresh(),
            shared: Arc::clone(&self.shared),
            done: false,
        })
    }

    fn partition(&mut self, _stop_at: SinkId) -> Box<dyn Sink> {
        self.fork()
    }
}

impl<C: Consumer> Drop for ConcurrentSink<C> {
    fn drop(&mut self) {
        if !self.done {
            self.abort();
        }
    }
}
