//! ForBind: per-tuple expansion.
//!
//! For every input tuple the bind expression yields a sequence; each item
//! produces one output tuple, optionally extended by the item and by its
//! 1-based position in the sequence.
//!
//! Work splits two ways. A batch longer than the sequential threshold is
//! halved recursively, each half on its own forked sink. Within one tuple,
//! items are drained into buffers of `fork_buffer` items; a full buffer
//! hands the rest of the sequence to a forked continuation before emitting
//! its own share, so a long sequence spreads over the pool as well.

use std::sync::Arc;

use parking_lot::Mutex;
use pushq_core::{Result, Scalar, SinkId, Tuple};
use pushq_exec::Task;
use tracing::trace;

use crate::block::Block;
use crate::context::QueryContext;
use crate::expr::{Expr, Items};
use crate::sink::{begin_and_end, begin_and_fail, bracket, fork_swap, Sink};

pub struct ForBind {
    expr: Arc<dyn Expr>,
    allow_empty: bool,
    bind_item: bool,
    bind_position: bool,
}

impl ForBind {
    /// With `allow_empty`, an empty sequence still yields one tuple with
    /// `Null` bound for the item and `0` for the position.
    pub fn new(expr: impl Expr, allow_empty: bool) -> Self {
        Self {
            expr: Arc::new(expr),
            allow_empty,
            bind_item: true,
            bind_position: false,
        }
    }

    pub fn with_item(mut self, bind: bool) -> Self {
        self.bind_item = bind;
        self
    }

    pub fn with_position(mut self, bind: bool) -> Self {
        self.bind_position = bind;
        self
    }
}

impl Block for ForBind {
    fn output_width(&self, input_width: usize) -> usize {
        input_width + usize::from(self.bind_item) + usize::from(self.bind_position)
    }

    fn create(&self, ctx: &Arc<QueryContext>, sink: Box<dyn Sink>) -> Result<Box<dyn Sink>> {
        Ok(Box::new(ForBindSink {
            id: SinkId::fresh(),
            ctx: Arc::clone(ctx),
            binder: Arc::new(Binder {
                expr: Arc::clone(&self.expr),
                allow_empty: self.allow_empty,
                bind_item: self.bind_item,
                bind_position: self.bind_position,
            }),
            sink,
        }))
    }
}

struct Binder {
    expr: Arc<dyn Expr>,
    allow_empty: bool,
    bind_item: bool,
    bind_position: bool,
}

impl Binder {
    fn emit(&self, t: &Tuple, item: Scalar, pos: i64) -> Tuple {
        match (self.bind_item, self.bind_position) {
            (true, true) => t.concat(&[item, Scalar::I64(pos)]),
            (true, false) => t.concat(&[item]),
            (false, true) => t.concat(&[Scalar::I64(pos)]),
            (false, false) => t.clone(),
        }
    }
}

struct ForBindSink {
    id: SinkId,
    ctx: Arc<QueryContext>,
    binder: Arc<Binder>,
    sink: Box<dyn Sink>,
}

impl Sink for ForBindSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn output(&mut self, batch: &[Tuple]) -> Result<()> {
        let ss = fork_swap(&mut self.sink);
        let batch: Arc<[Tuple]> = batch.into();
        let len = batch.len();
        bind_range(&self.ctx, &self.binder, ss, batch, 0, len)
    }

    fn end(self: Box<Self>) -> Result<()> {
        begin_and_end(self.sink)
    }

    fn fail(self: Box<Self>) {
        begin_and_fail(self.sink);
    }

    fn fork(&mut self) -> Box<dyn Sink> {
        Box::new(ForBindSink {
            id: SinkId::fresh(),
            ctx: Arc::clone(&self.ctx),
            binder: Arc::clone(&self.binder),
            sink: self.sink.fork(),
        })
    }

    fn partition(&mut self, stop_at: SinkId) -> Box<dyn Sink> {
        Box::new(ForBindSink {
            id: SinkId::fresh(),
            ctx: Arc::clone(&self.ctx),
            binder: Arc::clone(&self.binder),
            sink: self.sink.partition(stop_at),
        })
    }
}

/// Bind `batch[start..end]` into `sink`. Returns only after every task it
/// forked has finished.
fn bind_range(
    ctx: &Arc<QueryContext>,
    binder: &Arc<Binder>,
    mut sink: Box<dyn Sink>,
    batch: Arc<[Tuple]>,
    start: usize,
    end: usize,
) -> Result<()> {
    let len = end - start;
    if len >= 2 && len > ctx.seq_threshold {
        let mid = start + len / 2;
        let second = sink.fork();
        let first = {
            let (ctx, binder, batch) = (Arc::clone(ctx), Arc::clone(binder), Arc::clone(&batch));
            Task::new(move || bind_range(&ctx, &binder, sink, batch, start, mid))
        };
        ctx.pool.fork(&first);
        let r = bind_range(ctx, binder, second, batch, mid, end);
        let joined = first.join();
        return joined.and(r);
    }

    for t in &batch[start..end] {
        let ss = fork_swap(&mut sink);
        if let Err(e) = bind_tuple(ctx, binder, ss, t) {
            begin_and_fail(sink);
            return Err(e);
        }
    }
    begin_and_end(sink)
}

/// A forked continuation of a slice and the slot its own continuation
/// lands in.
struct Continuation {
    task: Task,
    slot: Slot,
}

type Slot = Arc<Mutex<Option<Continuation>>>;

fn bind_tuple(ctx: &Arc<QueryContext>, binder: &Arc<Binder>, sink: Box<dyn Sink>, t: &Tuple) -> Result<()> {
    let items = match binder.expr.evaluate(ctx, t) {
        Ok(items) => items,
        Err(e) => {
            begin_and_fail(sink);
            return Err(e);
        }
    };
    let slot: Slot = Arc::new(Mutex::new(None));
    let slice = Slice {
        ctx: Arc::clone(ctx),
        binder: Arc::clone(binder),
        tuple: t.clone(),
        sink,
        items,
        pos: 0,
        first: true,
    };
    let mut r = slice.run(&slot);

    // Continuations are joined in sequence order; each one published its
    // successor before finishing.
    let mut next = slot.lock().take();
    while let Some(c) = next {
        let joined = c.task.join();
        r = r.and(joined);
        next = c.slot.lock().take();
    }
    r
}

/// One buffer's worth of a tuple's sequence.
struct Slice {
    ctx: Arc<QueryContext>,
    binder: Arc<Binder>,
    tuple: Tuple,
    sink: Box<dyn Sink>,
    items: Items,
    /// Position of the last item before this slice.
    pos: i64,
    first: bool,
}

impl Slice {
    fn run(mut self, slot: &Slot) -> Result<()> {
        let cap = self.ctx.fork_buffer.max(1);
        let mut buf = Vec::with_capacity(cap);
        let mut exhausted = false;
        while buf.len() < cap {
            match self.items.next() {
                Some(Ok(item)) => buf.push(item),
                Some(Err(e)) => {
                    begin_and_fail(self.sink);
                    return Err(e);
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        let binder = Arc::clone(&self.binder);
        let tuple = self.tuple.clone();
        let pos = self.pos;

        if !exhausted {
            let next_slot: Slot = Arc::new(Mutex::new(None));
            let rest = Slice {
                ctx: Arc::clone(&self.ctx),
                binder: Arc::clone(&self.binder),
                tuple: self.tuple,
                sink: self.sink.fork(),
                items: self.items,
                pos: pos + cap as i64,
                first: false,
            };
            let task = {
                let next_slot = Arc::clone(&next_slot);
                Task::new(move || rest.run(&next_slot))
            };
            trace!(pos, cap, "forking sequence continuation");
            *slot.lock() = Some(Continuation {
                task: task.clone(),
                slot: next_slot,
            });
            self.ctx.pool.fork(&task);
        }

        if buf.is_empty() {
            if self.first && exhausted && binder.allow_empty {
                let row = binder.emit(&tuple, Scalar::Null, 0);
                return bracket(self.sink, |s| s.output(&[row]));
            }
            return begin_and_end(self.sink);
        }

        let rows: Vec<Tuple> = buf
            .into_iter()
            .enumerate()
            .map(|(i, item)| binder.emit(&tuple, item, pos + i as i64 + 1))
            .collect();
        bracket(self.sink, |s| s.output(&rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{FnExpr, Literal};
    use crate::pipeline::execute;
    use pushq_core::{tuple, Error};
    use pushq_exec::Pool;

    fn ctx(pool: usize, buf: usize) -> Arc<QueryContext> {
        Arc::new(QueryContext::new(Arc::new(Pool::new(pool).unwrap())).with_fork_buffer(buf))
    }

    #[test]
    fn binds_item_and_position() {
        for (pool, buf) in [(1, 1), (1, 20), (4, 2), (4, 3)] {
            let ctx = ctx(pool, buf);
            let block = ForBind::new(Literal::new([10i64, 20, 30]), false).with_position(true);
            let out = execute(&ctx, Arc::new(block), vec![vec![tuple![]]]).unwrap();
            assert_eq!(
                out,
                vec![tuple![10i64, 1i64], tuple![20i64, 2i64], tuple![30i64, 3i64]],
                "pool {pool} buffer {buf}"
            );
        }
    }

    #[test]
    fn tiny_thresholds_still_terminate() {
        let pool = Arc::new(Pool::new(2).unwrap());
        let clamped = QueryContext::new(Arc::clone(&pool)).with_seq_threshold(0);
        assert_eq!(clamped.seq_threshold, 1);
        // The field is public; a zero written past the builder must not
        // split single rows forever either.
        let mut raw = QueryContext::new(pool);
        raw.seq_threshold = 0;

        for ctx in [Arc::new(clamped), Arc::new(raw)] {
            for rows in [1i64, 5] {
                let input: Vec<Tuple> = (0..rows).map(|i| tuple![i]).collect();
                let block = ForBind::new(Literal::new([1i64, 2]), false);
                let out = execute(&ctx, Arc::new(block), vec![input]).unwrap();
                let want: Vec<Tuple> = (0..rows).flat_map(|i| [tuple![i, 1i64], tuple![i, 2i64]]).collect();
                assert_eq!(out, want, "threshold {} rows {rows}", ctx.seq_threshold);
            }
        }
    }

    #[test]
    fn empty_sequence_respects_allow_empty() {
        let ctx = ctx(2, 20);
        let empty = || Literal::new(Vec::<i64>::new());

        let keep = ForBind::new(empty(), true).with_position(true);
        let out = execute(&ctx, Arc::new(keep), vec![vec![tuple![7i64]]]).unwrap();
        assert_eq!(out, vec![Tuple::new(vec![Scalar::I64(7), Scalar::Null, Scalar::I64(0)])]);

        let drop_it = ForBind::new(empty(), false);
        let out = execute(&ctx, Arc::new(drop_it), vec![vec![tuple![7i64]]]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn position_only_and_passthrough_widths() {
        let b = ForBind::new(Literal::new([1i64]), false).with_item(false).with_position(true);
        assert_eq!(b.output_width(2), 3);
        let b = ForBind::new(Literal::new([1i64]), false).with_item(false);
        assert_eq!(b.output_width(2), 2);
    }

    #[test]
    fn evaluation_error_fails_the_query() {
        let ctx = ctx(2, 4);
        let expr = FnExpr::values(|t| match t[0].as_i64() {
            Some(13) => Err(Error::eval("unlucky")),
            Some(n) => Ok(vec![Scalar::I64(n)]),
            None => Ok(vec![]),
        });
        let input: Vec<Tuple> = (0..40i64).map(|v| tuple![v]).collect();
        let err = execute(&ctx, Arc::new(ForBind::new(expr, false)), vec![input]).unwrap_err();
        assert!(matches!(err, Error::Eval(m) if m == "unlucky"));
    }
}
