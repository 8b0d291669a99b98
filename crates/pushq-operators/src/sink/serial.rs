//! Order-preserving sinks.
//!
//! A [`SerialSink`] is a chain of segments, one per handle, in fork order.
//! The head segment holds the token: its output is processed in order. Later
//! segments either buffer their output or, while holding one of a bounded
//! number of permits, let the stage process what it can out of order. When
//! the head ends, the token moves to the next segment, and the thread that
//! moved it flushes that segment's buffer. No global lock is held while a
//! stage runs.
//!
//! Buffered rows behind the head are bounded per chain. A writer that would
//! exceed the bound waits for the token to advance: pool workers run queued
//! tasks meanwhile, other threads block. A worker that finds nothing to run
//! for a while buffers anyway, since the segment holding the token may be
//! suspended beneath it on its own stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use pushq_core::{Error, Result, SinkId, Tuple};
use pushq_exec::{help_once, Permits};

use super::{begin_and_fail, Sink};

/// Default bound on buffered rows, per permit.
pub const ROWS_PER_PERMIT: usize = 256;

const IDLE_WAIT: Duration = Duration::from_micros(50);
const IDLE_WAITS: u32 = 16;

/// Per-segment behavior of a [`SerialSink`].
///
/// The chain never runs two calls for the same stage concurrently, except
/// `fail`, which may arrive while another call is in progress and must not
/// block on it.
pub trait SerialStage: Send + Sync + Sized + 'static {
    fn output_in_order(&self, batch: &[Tuple]) -> Result<()>;

    /// Process a prefix of `batch` without the token. Returns how many
    /// tuples were consumed; the rest is buffered until the token arrives.
    fn output_out_of_order(&self, _batch: &[Tuple]) -> Result<usize> {
        Ok(0)
    }

    /// Stage for a new segment ordered directly after this one.
    fn fork(&self) -> Self;

    fn partition(&self, _stop_at: SinkId) -> Self {
        self.fork()
    }

    /// Called in segment order once a segment is closed and flushed.
    /// `last` is set for the final segment of the chain.
    fn end(&self, last: bool) -> Result<()>;

    fn fail(&self);
}

struct Segment<H> {
    stage: Option<Arc<H>>,
    pending: Vec<Tuple>,
    closed: bool,
    next: Option<u64>,
}

struct Chain<H> {
    segments: HashMap<u64, Segment<H>>,
    head: u64,
    next_id: u64,
    /// Some thread is processing the head in order.
    draining: bool,
    /// Rows sitting in segment buffers.
    buffered: usize,
    limit: usize,
}

impl<H> Chain<H> {
    fn over_limit(&self, seg: u64, rows: usize) -> bool {
        self.head != seg
            && self.segments.contains_key(&seg)
            && self.buffered > 0
            && self.buffered + rows > self.limit
    }
}

struct Shared<H> {
    chain: Mutex<Chain<H>>,
    failed: AtomicBool,
    permits: Permits,
    /// Signalled when buffered rows drain, the token moves, or the chain fails.
    room: Condvar,
}

impl<H: SerialStage> Shared<H> {
    /// Process closed and buffered segments from the head on until a live
    /// segment with nothing buffered is reached.
    fn drain(self: &Arc<Self>, mut chain: MutexGuard<'_, Chain<H>>) -> Result<()> {
        if chain.draining {
            return Ok(());
        }
        chain.draining = true;
        loop {
            if self.failed.load(Ordering::Acquire) {
                chain.draining = false;
                return Ok(());
            }
            let head = chain.head;
            let Some(seg) = chain.segments.get_mut(&head) else {
                chain.draining = false;
                return Ok(());
            };

            if !seg.pending.is_empty() {
                let batch = std::mem::take(&mut seg.pending);
                let stage = seg.stage.clone();
                chain.buffered -= batch.len();
                self.room.notify_all();
                let r = MutexGuard::unlocked(&mut chain, || match stage {
                    Some(st) => st.output_in_order(&batch),
                    None => Ok(()),
                });
                if let Err(e) = r {
                    chain.draining = false;
                    drop(chain);
                    self.abort();
                    return Err(e);
                }
                continue;
            }

            if seg.closed {
                let next = seg.next;
                let stage = seg.stage.take();
                chain.segments.remove(&head);
                if let Some(n) = next {
                    chain.head = n;
                    self.room.notify_all();
                }
                let last = next.is_none();
                let r = MutexGuard::unlocked(&mut chain, || match stage {
                    Some(st) => st.end(last),
                    None => Ok(()),
                });
                if let Err(e) = r {
                    chain.draining = false;
                    drop(chain);
                    self.abort();
                    return Err(e);
                }
                if last {
                    chain.draining = false;
                    return Ok(());
                }
                continue;
            }

            chain.draining = false;
            return Ok(());
        }
    }

    /// Wait until `rows` more rows may be buffered for `seg`, `seg` takes
    /// the token, or the chain fails.
    fn make_room<'a>(&self, mut chain: MutexGuard<'a, Chain<H>>, seg: u64, rows: usize) -> MutexGuard<'a, Chain<H>> {
        let mut idle = 0;
        while chain.over_limit(seg, rows) && !self.failed.load(Ordering::Acquire) {
            match MutexGuard::unlocked(&mut chain, help_once) {
                Some(true) => idle = 0,
                Some(false) => {
                    idle += 1;
                    if idle > IDLE_WAITS {
                        break;
                    }
                    self.room.wait_for(&mut chain, IDLE_WAIT);
                }
                None => self.room.wait(&mut chain),
            }
        }
        chain
    }

    /// Append `rows` to the buffer of `seg`, then drain.
    fn buffer(self: &Arc<Self>, chain: MutexGuard<'_, Chain<H>>, seg: u64, rows: &[Tuple]) -> Result<()> {
        let mut chain = self.make_room(chain, seg, rows.len());
        if self.failed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(s) = chain.segments.get_mut(&seg) {
            s.pending.extend_from_slice(rows);
            chain.buffered += rows.len();
        }
        self.drain(chain)
    }

    /// Fail every stage still attached to the chain. Later output is dropped.
    fn abort(&self) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stages: Vec<Arc<H>> = {
            let mut chain = self.chain.lock();
            chain.buffered = 0;
            self.room.notify_all();
            chain
                .segments
                .values_mut()
                .filter_map(|s| {
                    s.pending.clear();
                    s.stage.take()
                })
                .collect()
        };
        for st in stages {
            st.fail();
        }
    }
}

/// One handle of an ordered segment chain.
pub struct SerialSink<H: SerialStage> {
    id: SinkId,
    seg: u64,
    stage: Arc<H>,
    shared: Arc<Shared<H>>,
    done: bool,
}

impl<H: SerialStage> SerialSink<H> {
    /// Root handle of a new chain. `permits` bounds concurrent out-of-order
    /// writers; buffered rows are bounded by [`ROWS_PER_PERMIT`] per permit
    /// until [`with_buffer_limit`](Self::with_buffer_limit) says otherwise.
    pub fn new(stage: H, permits: Permits) -> Self {
        let limit = permits.capacity().max(1) * ROWS_PER_PERMIT;
        let stage = Arc::new(stage);
        let mut segments = HashMap::new();
        segments.insert(
            0,
            Segment {
                stage: Some(Arc::clone(&stage)),
                pending: Vec::new(),
                closed: false,
                next: None,
            },
        );
        Self {
            id: SinkId::fresh(),
            seg: 0,
            stage,
            shared: Arc::new(Shared {
                chain: Mutex::new(Chain {
                    segments,
                    head: 0,
                    next_id: 1,
                    draining: false,
                    buffered: 0,
                    limit,
                }),
                failed: AtomicBool::new(false),
                permits,
                room: Condvar::new(),
            }),
            done: false,
        }
    }

    /// Bound the rows buffered behind the head of this handle's chain. A
    /// single batch larger than the bound is still accepted into an empty
    /// chain.
    pub fn with_buffer_limit(self, rows: usize) -> Self {
        self.shared.chain.lock().limit = rows.max(1);
        self
    }

    fn spawn(&mut self, stage: H) -> SerialSink<H> {
        let stage = Arc::new(stage);
        let mut chain = self.shared.chain.lock();
        let id = chain.next_id;
        chain.next_id += 1;
        let next = chain.segments.get(&self.seg).and_then(|s| s.next);
        chain.segments.insert(
            id,
            Segment {
                stage: Some(Arc::clone(&stage)),
                pending: Vec::new(),
                closed: false,
                next,
            },
        );
        if let Some(s) = chain.segments.get_mut(&self.seg) {
            s.next = Some(id);
        }
        drop(chain);
        if self.shared.failed.load(Ordering::Acquire) {
            stage.fail();
        }
        SerialSink {
            id: SinkId::fresh(),
            seg: id,
            stage,
            shared: Arc::clone(&self.shared),
            done: false,
        }
    }

    fn close(&mut self) -> Result<()> {
        self.done = true;
        let mut chain = self.shared.chain.lock();
        match chain.segments.get_mut(&self.seg) {
            Some(s) => s.closed = true,
            None => return Ok(()),
        }
        self.shared.drain(chain)
    }
}

impl<H: SerialStage> Sink for SerialSink<H> {
    fn id(&self) -> SinkId {
        self.id
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn output(&mut self, batch: &[Tuple]) -> Result<()> {
        if batch.is_empty() || self.shared.failed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut chain = self.shared.chain.lock();
        let is_head = chain.head == self.seg;
        let buffering = match chain.segments.get(&self.seg) {
            Some(seg) => !seg.pending.is_empty(),
            None => return Err(Error::Invariant("output on a closed segment".into())),
        };

        if is_head && !chain.draining && !buffering {
            chain.draining = true;
            drop(chain);
            let r = self.stage.output_in_order(batch);
            let mut chain = self.shared.chain.lock();
            chain.draining = false;
            if let Err(e) = r {
                drop(chain);
                self.shared.abort();
                return Err(e);
            }
            return self.shared.drain(chain);
        }

        if is_head || buffering {
            return self.shared.buffer(chain, self.seg, batch);
        }

        drop(chain);
        let consumed = match self.shared.permits.try_acquire() {
            Some(_permit) => match self.stage.output_out_of_order(batch) {
                Ok(n) => n,
                Err(e) => {
                    self.shared.abort();
                    return Err(e);
                }
            },
            None => 0,
        };
        if consumed < batch.len() {
            let chain = self.shared.chain.lock();
            return self.shared.buffer(chain, self.seg, &batch[consumed..]);
        }
        Ok(())
    }

    fn end(mut self: Box<Self>) -> Result<()> {
        self.close()
    }

    fn fail(mut self: Box<Self>) {
        self.done = true;
        self.shared.abort();
    }

    fn fork(&mut self) -> Box<dyn Sink> {
        let stage = self.stage.fork();
        Box::new(self.spawn(stage))
    }

    fn partition(&mut self, stop_at: SinkId) -> Box<dyn Sink> {
        if stop_at == self.id {
            return self.fork();
        }
        let stage = self.stage.partition(stop_at);
        Box::new(self.spawn(stage))
    }
}

impl<H: SerialStage> Drop for SerialSink<H> {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            self.shared.abort();
        }
    }
}

struct Valved {
    sink: Box<dyn Sink>,
    begun: bool,
}

struct ValveShared {
    slot: Mutex<Option<Valved>>,
    failed: AtomicBool,
}

impl ValveShared {
    /// Fail the downstream unless someone is writing to it right now; that
    /// writer settles it when it lets go.
    fn settle(&self) {
        let taken = match self.slot.try_lock() {
            Some(mut g) => g.take(),
            None => None,
        };
        if let Some(v) = taken {
            if v.begun {
                v.sink.fail();
            } else {
                begin_and_fail(v.sink);
            }
        }
    }
}

/// Stage that funnels every segment into one single-writer downstream sink.
/// The downstream sees one `begin`, the segments' output in fork order, and
/// one `end` (or `fail`).
#[derive(Clone)]
pub struct ValveStage {
    shared: Arc<ValveShared>,
}

impl ValveStage {
    pub fn new(sink: Box<dyn Sink>) -> Self {
        Self {
            shared: Arc::new(ValveShared {
                slot: Mutex::new(Some(Valved { sink, begun: false })),
                failed: AtomicBool::new(false),
            }),
        }
    }
}

impl SerialStage for ValveStage {
    fn output_in_order(&self, batch: &[Tuple]) -> Result<()> {
        let r = {
            let mut g = self.shared.slot.lock();
            match g.as_mut() {
                None => Ok(()),
                Some(v) => {
                    let begun = if v.begun {
                        Ok(())
                    } else {
                        v.begun = true;
                        v.sink.begin()
                    };
                    begun.and_then(|()| v.sink.output(batch))
                }
            }
        };
        if self.shared.failed.load(Ordering::Acquire) {
            self.shared.settle();
        }
        r
    }

    fn fork(&self) -> Self {
        self.clone()
    }

    fn end(&self, last: bool) -> Result<()> {
        if !last {
            return Ok(());
        }
        let taken = self.shared.slot.lock().take();
        match taken {
            Some(Valved { sink, begun: true }) => sink.end(),
            Some(Valved { sink, begun: false }) => super::begin_and_end(sink),
            None => Ok(()),
        }
    }

    fn fail(&self) {
        if !self.shared.failed.swap(true, Ordering::AcqRel) {
            self.shared.settle();
        }
    }
}

/// An ordering valve: many concurrent writers, one ordered downstream.
pub type SerialValve = SerialSink<ValveStage>;

impl SerialSink<ValveStage> {
    pub fn valve(sink: Box<dyn Sink>, permits: Permits) -> Self {
        SerialSink::new(ValveStage::new(sink), permits)
    }
}
