//! Root collector.

use std::sync::Arc;

use parking_lot::Mutex;
use pushq_core::{Error, Result, SinkId, Tuple};
use pushq_exec::Permits;

use super::serial::ROWS_PER_PERMIT;
use super::{SerialValve, Sink};

#[derive(Default)]
struct Collected {
    rows: Vec<Tuple>,
    open: usize,
    ended: bool,
    failed: bool,
}

/// In-memory single-writer sink. Sits behind a valve, which serializes
/// writers; forks only share the buffer.
struct Collector {
    id: SinkId,
    state: Arc<Mutex<Collected>>,
    done: bool,
}

impl Collector {
    fn finish(&mut self, failed: bool) {
        self.done = true;
        let mut st = self.state.lock();
        st.open -= 1;
        if failed {
            st.failed = true;
        } else if st.open == 0 {
            st.ended = true;
        }
    }
}

impl Sink for Collector {
    fn id(&self) -> SinkId {
        self.id
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn output(&mut self, batch: &[Tuple]) -> Result<()> {
        self.state.lock().rows.extend_from_slice(batch);
        Ok(())
    }

    fn end(mut self: Box<Self>) -> Result<()> {
        self.finish(false);
        Ok(())
    }

    fn fail(mut self: Box<Self>) {
        self.finish(true);
    }

    fn fork(&mut self) -> Box<dyn Sink> {
        self.state.lock().open += 1;
        Box::new(Collector {
            id: SinkId::fresh(),
            state: Arc::clone(&self.state),
            done: false,
        })
    }

    fn partition(&mut self, _stop_at: SinkId) -> Box<dyn Sink> {
        self.fork()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if !self.done {
            self.finish(true);
        }
    }
}

/// Reads the collected output once the pipeline has finished.
pub struct ResultHandle {
    state: Arc<Mutex<Collected>>,
}

impl ResultHandle {
    /// The ordered output, or `Aborted` if the root saw `fail`.
    pub fn take(&self) -> Result<Vec<Tuple>> {
        let mut st = self.state.lock();
        if st.failed {
            return Err(Error::Aborted);
        }
        if !st.ended {
            return Err(Error::Invariant("pipeline output not ended".into()));
        }
        Ok(std::mem::take(&mut st.rows))
    }
}

pub struct ResultSink;

impl ResultSink {
    /// An ordering valve over an in-memory collector.
    pub fn new(permits: Permits) -> (Box<dyn Sink>, ResultHandle) {
        let limit = permits.capacity().max(1) * ROWS_PER_PERMIT;
        Self::with_limit(permits, limit)
    }

    /// Like [`new`](Self::new), holding at most `buffered_rows` rows behind
    /// the head at a time.
    pub fn with_limit(permits: Permits, buffered_rows: usize) -> (Box<dyn Sink>, ResultHandle) {
        let state = Arc::new(Mutex::new(Collected {
            open: 1,
            ..Collected::default()
        }));
        let collector = Collector {
            id: SinkId::fresh(),
            state: Arc::clone(&state),
            done: false,
        };
        let root = SerialValve::valve(Box::new(collector), permits).with_buffer_limit(buffered_rows);
        (Box::new(root), ResultHandle { state })
    }
}
