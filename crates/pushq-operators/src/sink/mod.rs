//! Push-based sink protocol.
//!
//! Every operator exposes a [`Sink`] to its upstream. A producer brackets
//! its output with `begin` and exactly one of `end`/`fail`. Both consume the
//! handle, so a finished sink cannot be used again.
//!
//! `fork` hands out a new handle to the same destination that is ordered
//! after everything written through the origin, including output written
//! later through the origin. The fork is placed immediately after its origin,
//! so the following reads top to bottom in merge order:
//!
//! ```text
//! let b = a.fork();   // a, b
//! let c = a.fork();   // a, c, b
//! ```
//!
//! Dropping a handle that was neither ended nor failed counts as `fail`.

mod concurrent;
mod result;
mod serial;

pub use concurrent::{ConcurrentSink, Consumer};
pub use result::{ResultHandle, ResultSink};
pub use serial::{SerialSink, SerialStage, SerialValve, ValveStage, ROWS_PER_PERMIT};

use pushq_core::{Result, SinkId, Tuple};

pub trait Sink: Send {
    fn id(&self) -> SinkId;

    fn begin(&mut self) -> Result<()>;

    fn output(&mut self, batch: &[Tuple]) -> Result<()>;

    fn end(self: Box<Self>) -> Result<()>;

    /// Abort this handle. Implementations begin their downstream if they
    /// have not, then forward `fail` rather than `end`.
    fn fail(self: Box<Self>);

    fn fork(&mut self) -> Box<dyn Sink>;

    /// A handle for interposing stages in front of the sink `stop_at`
    /// further down the chain. Sinks forward the request until they reach
    /// `stop_at`, which answers with a plain fork.
    fn partition(&mut self, stop_at: SinkId) -> Box<dyn Sink>;
}

/// Replace `sink` with a fork of itself and return the origin. Output
/// through the returned handle precedes output through `sink` afterwards.
pub fn fork_swap(sink: &mut Box<dyn Sink>) -> Box<dyn Sink> {
    let next = sink.fork();
    std::mem::replace(sink, next)
}

/// Run `f` on a begun sink and finish it: `end` on success, `fail` on error.
pub fn bracket<F>(mut sink: Box<dyn Sink>, f: F) -> Result<()>
where
    F: FnOnce(&mut dyn Sink) -> Result<()>,
{
    if let Err(e) = sink.begin() {
        sink.fail();
        return Err(e);
    }
    match f(sink.as_mut()) {
        Ok(()) => sink.end(),
        Err(e) => {
            sink.fail();
            Err(e)
        }
    }
}

/// `begin` then `fail`, ignoring a failing `begin`.
pub fn begin_and_fail(mut sink: Box<dyn Sink>) {
    let _ = sink.begin();
    sink.fail();
}

/// `begin` then `end`.
pub fn begin_and_end(mut sink: Box<dyn Sink>) -> Result<()> {
    if let Err(e) = sink.begin() {
        sink.fail();
        return Err(e);
    }
    sink.end()
}
