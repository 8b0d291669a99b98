//! Table join (build/probe).
//!
//! Output tuple = left ++ right bindings, or left ++ null padding in
//! left-join mode when nothing matched.
//!
//! The probe stream arrives through an ordered segment chain. A segment
//! scans runs of rows covered by the published snapshot (same group key, or
//! any row when ungrouped) and probes each run through its own left-block
//! chain. A row the snapshot does not cover stops a segment that lacks the
//! token; the token holder rebuilds from that row and republishes. So
//! segments behind the head probe speculatively against whatever table is
//! current, but only rows of that table's own group.
//!
//! Build: the right block runs on the row that defines the group, its
//! output is drained into a fresh [`JoinTable`], and `{table, group key}` is
//! published as one immutable snapshot.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use pushq_core::{Cmp, Error, Result, Scalar, SinkId, Tuple};
use pushq_exec::Permits;
use tracing::debug;

use super::table::{default_table_factory, JoinTable, TableFactory};
use crate::block::Block;
use crate::context::QueryContext;
use crate::expr::Expr;
use crate::sink::{
    begin_and_end, begin_and_fail, bracket, fork_swap, ConcurrentSink, Consumer, SerialSink,
    SerialStage, SerialValve, Sink,
};

#[derive(Clone)]
struct JoinSpec {
    cmp: Cmp,
    general: bool,
    left_join: bool,
    skip_sort: bool,
    l: Arc<dyn Block>,
    l_expr: Arc<dyn Expr>,
    r: Arc<dyn Block>,
    r_expr: Arc<dyn Expr>,
    o: Option<Arc<dyn Block>>,
    group: Option<usize>,
    ordered_left: bool,
    ordered_right: bool,
    left_permits: Option<usize>,
    right_permits: Option<usize>,
    factory: TableFactory,
}

impl JoinSpec {
    fn keys(&self, expr: &dyn Expr, ctx: &QueryContext, t: &Tuple) -> Result<Vec<Scalar>> {
        if self.general {
            expr.evaluate(ctx, t)?.collect()
        } else {
            Ok(expr.evaluate_to_item(ctx, t)?.into_iter().collect())
        }
    }

    fn right_width(&self, input_width: usize) -> usize {
        self.r.output_width(input_width).saturating_sub(input_width)
    }

    fn output_width(&self, input_width: usize) -> usize {
        let joined = self.l.output_width(input_width) + self.right_width(input_width);
        match &self.o {
            Some(o) => o.output_width(joined),
            None => joined,
        }
    }

    fn group_key(&self, t: &Tuple) -> Result<Option<Scalar>> {
        match self.group {
            None => Ok(None),
            Some(g) => t
                .get(g)
                .cloned()
                .map(Some)
                .ok_or_else(|| Error::eval(format!("group column {g} out of range for width {}", t.len()))),
        }
    }
}

/// Joins every probe row with the rows the right block produces for its
/// group.
pub struct TableJoin {
    spec: JoinSpec,
}

impl TableJoin {
    /// `l` runs on each probe run and `l_expr` yields the probe keys of its
    /// output; `r` runs once per group and `r_expr` yields the build keys of
    /// its output. A probe key `p` matches a build key `b` when `p <cmp> b`.
    /// With `general`, keys are whole sequences and any pair may match;
    /// otherwise each side binds at most one key.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cmp: Cmp,
        general: bool,
        left_join: bool,
        skip_sort: bool,
        l: impl Block,
        l_expr: impl Expr,
        r: impl Block,
        r_expr: impl Expr,
        o: Option<Arc<dyn Block>>,
    ) -> Self {
        Self {
            spec: JoinSpec {
                cmp,
                general,
                left_join,
                skip_sort,
                l: Arc::new(l),
                l_expr: Arc::new(l_expr),
                r: Arc::new(r),
                r_expr: Arc::new(r_expr),
                o,
                group: None,
                ordered_left: true,
                ordered_right: true,
                left_permits: None,
                right_permits: None,
                factory: default_table_factory(),
            },
        }
    }

    /// Partition the probe stream into runs sharing column `col`; each run
    /// is probed against a table built for its own key.
    pub fn with_group(mut self, col: usize) -> Self {
        self.spec.group = Some(col);
        self
    }

    pub fn with_ordered_left(mut self, ordered: bool) -> Self {
        self.spec.ordered_left = ordered;
        self
    }

    /// Without ordering, build entries get ordinals in arrival order.
    pub fn with_ordered_right(mut self, ordered: bool) -> Self {
        self.spec.ordered_right = ordered;
        self
    }

    pub fn with_left_permits(mut self, n: usize) -> Self {
        self.spec.left_permits = Some(n.max(1));
        self
    }

    pub fn with_right_permits(mut self, n: usize) -> Self {
        self.spec.right_permits = Some(n.max(1));
        self
    }

    pub fn with_table_factory(mut self, factory: TableFactory) -> Self {
        self.spec.factory = factory;
        self
    }
}

impl Block for TableJoin {
    fn output_width(&self, input_width: usize) -> usize {
        self.spec.output_width(input_width)
    }

    fn create(&self, ctx: &Arc<QueryContext>, sink: Box<dyn Sink>) -> Result<Box<dyn Sink>> {
        let stage = JoinStage {
            spec: Arc::new(self.spec.clone()),
            ctx: Arc::clone(ctx),
            state: Arc::new(RwLock::new(None)),
            sink: Mutex::new(Some(sink)),
        };
        let sink = SerialSink::new(stage, Permits::new(ctx.output_permits)).with_buffer_limit(ctx.buffer_limit());
        Ok(Box::new(sink))
    }
}

/// One published build.
struct Snapshot {
    table: Arc<dyn JoinTable>,
    group_key: Option<Scalar>,
}

impl Snapshot {
    fn covers(&self, key: &Option<Scalar>) -> bool {
        match (key, &self.group_key) {
            (None, _) => true,
            (Some(k), Some(g)) => k.compare(g) == Ordering::Equal,
            (Some(_), None) => false,
        }
    }
}

type Published = Arc<RwLock<Option<Arc<Snapshot>>>>;

struct JoinStage {
    spec: Arc<JoinSpec>,
    ctx: Arc<QueryContext>,
    state: Published,
    /// Downstream position of this segment; locked only to fork it.
    sink: Mutex<Option<Box<dyn Sink>>>,
}

impl JoinStage {
    fn with_sink(&self, sink: Option<Box<dyn Sink>>) -> Self {
        Self {
            spec: Arc::clone(&self.spec),
            ctx: Arc::clone(&self.ctx),
            state: Arc::clone(&self.state),
            sink: Mutex::new(sink),
        }
    }

    fn current(&self) -> Option<Arc<Snapshot>> {
        self.state.read().clone()
    }

    /// Probe the longest prefix the published snapshot covers, rebuilding on
    /// a group change when holding the token. Returns the rows consumed.
    fn process(&self, batch: &[Tuple], in_order: bool) -> Result<usize> {
        let mut i = 0;
        while i < batch.len() {
            let key = self.spec.group_key(&batch[i])?;
            let snap = match self.current() {
                Some(s) if s.covers(&key) => s,
                _ if in_order => {
                    self.load(&batch[i], key)?;
                    continue;
                }
                _ => return Ok(i),
            };
            let mut end = i + 1;
            while end < batch.len() && snap.covers(&self.spec.group_key(&batch[end])?) {
                end += 1;
            }
            self.probe(snap, &batch[i..end])?;
            i = end;
        }
        Ok(batch.len())
    }

    fn probe(&self, snap: Arc<Snapshot>, run: &[Tuple]) -> Result<()> {
        let ds = {
            let mut guard = self.sink.lock();
            match guard.as_mut() {
                Some(s) => fork_swap(s),
                None => return Err(Error::Aborted),
            }
        };
        let input_width = run.first().map_or(0, Tuple::len);
        let padding = self
            .spec
            .output_width(input_width)
            .saturating_sub(self.spec.l.output_width(input_width));
        let sink: Box<dyn Sink> = if self.spec.ordered_left {
            let permits = self.spec.left_permits.unwrap_or(self.ctx.output_permits);
            Box::new(SerialValve::valve(ds, Permits::new(permits)).with_buffer_limit(permits * self.ctx.fork_buffer))
        } else {
            ds
        };
        let probe = Probe {
            id: SinkId::fresh(),
            spec: Arc::clone(&self.spec),
            ctx: Arc::clone(&self.ctx),
            snap,
            sink,
            padding,
        };
        let left = self.spec.l.create(&self.ctx, Box::new(probe))?;
        bracket(left, |s| s.output(run))
    }

    fn load(&self, t: &Tuple, group_key: Option<Scalar>) -> Result<()> {
        let spec = &self.spec;
        let consumer = Arc::new(Load {
            spec: Arc::clone(spec),
            ctx: Arc::clone(&self.ctx),
            offset: t.len(),
            state: Mutex::new(Building {
                table: Some((spec.factory)(spec.cmp, spec.general, spec.skip_sort)),
                next_ordinal: 1,
            }),
            aborted: AtomicBool::new(false),
        });
        let right_permits = spec.right_permits.unwrap_or(self.ctx.output_permits);
        let fan_in = if spec.ordered_right { 1 } else { right_permits };
        let target: Box<dyn Sink> = Box::new(ConcurrentSink::new(Arc::clone(&consumer), Permits::new(fan_in)));
        let target: Box<dyn Sink> = if spec.ordered_right {
            Box::new(SerialValve::valve(target, Permits::new(right_permits)).with_buffer_limit(right_permits * self.ctx.fork_buffer))
        } else {
            target
        };
        let right = spec.r.create(&self.ctx, target)?;
        bracket(right, |s| s.output(std::slice::from_ref(t)))?;

        if consumer.aborted.load(AtomicOrdering::Acquire) {
            return Err(Error::Aborted);
        }
        let mut table = consumer
            .state
            .lock()
            .table
            .take()
            .ok_or_else(|| Error::Invariant("join table taken twice".into()))?;
        table.finish();
        debug!(group = ?group_key, entries = table.len(), "join table built");
        *self.state.write() = Some(Arc::new(Snapshot {
            table: Arc::from(table),
            group_key,
        }));
        Ok(())
    }
}

impl SerialStage for JoinStage {
    fn output_in_order(&self, batch: &[Tuple]) -> Result<()> {
        self.process(batch, true).map(|_| ())
    }

    fn output_out_of_order(&self, batch: &[Tuple]) -> Result<usize> {
        self.process(batch, false)
    }

    fn fork(&self) -> Self {
        let next = self.sink.lock().as_mut().map(|s| s.fork());
        self.with_sink(next)
    }

    fn partition(&self, stop_at: SinkId) -> Self {
        let next = self.sink.lock().as_mut().map(|s| s.partition(stop_at));
        self.with_sink(next)
    }

    fn end(&self, _last: bool) -> Result<()> {
        match self.sink.lock().take() {
            Some(s) => begin_and_end(s),
            None => Ok(()),
        }
    }

    fn fail(&self) {
        let taken = self.sink.lock().take();
        if let Some(s) = taken {
            begin_and_fail(s);
        }
    }
}

struct Building {
    table: Option<Box<dyn JoinTable>>,
    next_ordinal: u64,
}

/// Drains the right block's output into the table under construction.
struct Load {
    spec: Arc<JoinSpec>,
    ctx: Arc<QueryContext>,
    /// Columns before this index belong to the row that defined the group.
    offset: usize,
    state: Mutex<Building>,
    aborted: AtomicBool,
}

impl Consumer for Load {
    fn consume(&self, batch: &[Tuple]) -> Result<()> {
        for t in batch {
            let keys = self.spec.keys(self.spec.r_expr.as_ref(), &self.ctx, t)?;
            let bindings: Arc<[Scalar]> = t.array().get(self.offset..).unwrap_or(&[]).into();
            let mut st = self.state.lock();
            let ordinal = st.next_ordinal;
            st.next_ordinal += 1;
            if let Some(table) = st.table.as_mut() {
                table.add(&keys, bindings, ordinal);
            }
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }

    fn abort(&self) {
        self.aborted.store(true, AtomicOrdering::Release);
    }
}

/// Receives the left block's output and emits joined rows.
struct Probe {
    id: SinkId,
    spec: Arc<JoinSpec>,
    ctx: Arc<QueryContext>,
    snap: Arc<Snapshot>,
    sink: Box<dyn Sink>,
    padding: usize,
}

impl Probe {
    fn join_into(&self, s: &mut Box<dyn Sink>, batch: &[Tuple]) -> Result<()> {
        for lt in batch {
            let keys = self.spec.keys(self.spec.l_expr.as_ref(), &self.ctx, lt)?;
            let matches = self.snap.table.probe(&keys);
            if matches.is_empty() {
                if self.spec.left_join {
                    s.output(&[lt.concat(&vec![Scalar::Null; self.padding])])?;
                }
                continue;
            }
            let rows: Vec<Tuple> = matches.iter().map(|b| lt.concat(b)).collect();
            match &self.spec.o {
                None => s.output(&rows)?,
                Some(o) => {
                    // s, target, cont: the nested block's output lands between
                    // what this tuple's predecessors wrote and what follows.
                    let mut target = s.fork();
                    let cont = target.fork();
                    let prev = std::mem::replace(s, cont);
                    prev.end()?;
                    bracket(o.create(&self.ctx, target)?, |n| n.output(&rows))?;
                    s.begin()?;
                }
            }
        }
        Ok(())
    }
}

impl Sink for Probe {
    fn id(&self) -> SinkId {
        self.id
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn output(&mut self, batch: &[Tuple]) -> Result<()> {
        let mut s = fork_swap(&mut self.sink);
        if let Err(e) = s.begin() {
            s.fail();
            return Err(e);
        }
        match self.join_into(&mut s, batch) {
            Ok(()) => s.end(),
            Err(e) => {
                s.fail();
                Err(e)
            }
        }
    }

    fn end(self: Box<Self>) -> Result<()> {
        begin_and_end(self.sink)
    }

    fn fail(self: Box<Self>) {
        begin_and_fail(self.sink);
    }

    fn fork(&mut self) -> Box<dyn Sink> {
        Box::new(Probe {
            id: SinkId::fresh(),
            spec: Arc::clone(&self.spec),
            ctx: Arc::clone(&self.ctx),
            snap: Arc::clone(&self.snap),
            sink: self.sink.fork(),
            padding: self.padding,
        })
    }

    fn partition(&mut self, stop_at: SinkId) -> Box<dyn Sink> {
        Box::new(Probe {
            id: SinkId::fresh(),
            spec: Arc::clone(&self.spec),
            ctx: Arc::clone(&self.ctx),
            snap: Arc::clone(&self.snap),
            sink: self.sink.partition(stop_at),
            padding: self.padding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::ForBind;
    use crate::block::BlockChain;
    use crate::expr::{Column, FnExpr, Literal};
    use crate::join::MultiKeyTable;
    use crate::pipeline::execute;
    use pushq_core::tuple;
    use pushq_exec::Pool;
    use std::sync::atomic::AtomicUsize;

    fn ctx(pool: usize) -> Arc<QueryContext> {
        Arc::new(QueryContext::new(Arc::new(Pool::new(pool).unwrap())))
    }

    /// Right side binds (item, position) for the items 5, 5, 7; the key is
    /// the item.
    fn five_five_seven(left_join: bool, o: Option<Arc<dyn Block>>) -> TableJoin {
        TableJoin::new(
            Cmp::Eq,
            false,
            left_join,
            false,
            BlockChain::new(),
            Column(0),
            ForBind::new(Literal::new([5i64, 5, 7]), false).with_position(true),
            Column(1),
            o,
        )
    }

    #[test]
    fn inner_join_matches_in_build_order() {
        let join = five_five_seven(false, None);
        assert_eq!(join.output_width(1), 3);
        let out = execute(&ctx(2), Arc::new(join), vec![vec![tuple![5i64], tuple![6i64]]]).unwrap();
        assert_eq!(out, vec![tuple![5i64, 5i64, 1i64], tuple![5i64, 5i64, 2i64]]);
    }

    #[test]
    fn left_join_pads_unmatched_rows() {
        let out = execute(
            &ctx(2),
            Arc::new(five_five_seven(true, None)),
            vec![vec![tuple![6i64], tuple![7i64]]],
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                Tuple::new(vec![Scalar::I64(6), Scalar::Null, Scalar::Null]),
                tuple![7i64, 7i64, 3i64],
            ]
        );
    }

    #[test]
    fn nested_block_runs_per_matched_group() {
        let o: Arc<dyn Block> = Arc::new(ForBind::new(Literal::new(["x"]), false));
        let join = five_five_seven(true, Some(o));
        assert_eq!(join.output_width(1), 4);
        let out = execute(&ctx(4), Arc::new(join), vec![vec![tuple![5i64], tuple![9i64]]]).unwrap();
        assert_eq!(
            out,
            vec![
                tuple![5i64, 5i64, 1i64, "x"],
                tuple![5i64, 5i64, 2i64, "x"],
                Tuple::new(vec![Scalar::I64(9), Scalar::Null, Scalar::Null, Scalar::Null]),
            ]
        );
    }

    #[test]
    fn group_change_rebuilds_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let factory: TableFactory = {
            let builds = Arc::clone(&builds);
            Arc::new(move |cmp: Cmp, _general: bool, skip_sort: bool| -> Box<dyn JoinTable> {
                builds.fetch_add(1, AtomicOrdering::SeqCst);
                Box::new(MultiKeyTable::new(cmp, skip_sort))
            })
        };
        // Right side for group g binds g*10 and g*10+1.
        let right = ForBind::new(
            FnExpr::values(|t: &Tuple| {
                let g = t[0].as_i64().unwrap_or(0);
                Ok(vec![Scalar::I64(g * 10), Scalar::I64(g * 10 + 1)])
            }),
            false,
        );
        let join = TableJoin::new(Cmp::Eq, false, false, false, BlockChain::new(), Column(1), right, Column(2), None)
            .with_group(0)
            .with_table_factory(factory);

        let input = vec![
            tuple![1i64, 10i64],
            tuple![1i64, 11i64],
            tuple![2i64, 20i64],
            tuple![2i64, 99i64],
            tuple![1i64, 10i64],
        ];
        let out = execute(&ctx(1), Arc::new(join), vec![input]).unwrap();
        assert_eq!(builds.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(
            out,
            vec![
                tuple![1i64, 10i64, 10i64],
                tuple![1i64, 11i64, 11i64],
                tuple![2i64, 20i64, 20i64],
                tuple![1i64, 10i64, 10i64],
            ]
        );
    }

    #[test]
    fn general_comparison_uses_every_key() {
        // Probe keys (1, 6) against build keys 5, 5, 7 with p < b.
        let join = TableJoin::new(
            Cmp::Lt,
            true,
            false,
            false,
            BlockChain::new(),
            FnExpr::values(|_t: &Tuple| Ok(vec![Scalar::I64(1), Scalar::I64(6)])),
            ForBind::new(Literal::new([5i64, 5, 7]), false).with_position(true),
            Column(1),
            None,
        );
        let out = execute(&ctx(2), Arc::new(join), vec![vec![tuple![0i64]]]).unwrap();
        let positions: Vec<i64> = out.iter().map(|t| t[2].as_i64().unwrap()).collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[test]
    fn build_failure_fails_the_query() {
        let join = TableJoin::new(
            Cmp::Eq,
            false,
            false,
            false,
            BlockChain::new(),
            Column(0),
            ForBind::new(Literal::new([1i64, 2]), false),
            FnExpr::values(|_t: &Tuple| Err(Error::eval("bad build key"))),
            None,
        );
        let err = execute(&ctx(2), Arc::new(join), vec![vec![tuple![1i64]]]).unwrap_err();
        assert!(matches!(err, Error::Eval(m) if m == "bad build key"));
    }
}
