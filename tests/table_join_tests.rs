//! Table join behavior through the public pipeline API.

use std::sync::Arc;

use pushq_core::{tuple, Cmp, Scalar, Tuple};
use pushq_exec::{Permits, Pool};
use pushq_operators::sink::{ResultSink, Sink};
use pushq_operators::{execute, Block, BlockChain, Column, FnExpr, ForBind, Literal, QueryContext, TableJoin};

fn ctx(pool: usize) -> Arc<QueryContext> {
    Arc::new(
        QueryContext::new(Arc::new(Pool::new(pool).unwrap()))
            .with_seq_threshold(2)
            .with_fork_buffer(2),
    )
}

/// Pass-through bind: one output row per input row, forking downstream
/// sinks on the way so the join sees many segments.
fn splitter() -> ForBind {
    ForBind::new(Literal::new([0i64]), false).with_item(false)
}

fn right_items() -> ForBind {
    ForBind::new(Literal::new([5i64, 5, 7]), false).with_position(true)
}

#[test]
fn inner_join_with_two_matches() {
    let join = TableJoin::new(Cmp::Eq, false, false, false, BlockChain::new(), Column(0), right_items(), Column(1), None);
    let out = execute(&ctx(4), Arc::new(join), vec![vec![tuple![5i64]]]).unwrap();
    assert_eq!(out, vec![tuple![5i64, 5i64, 1i64], tuple![5i64, 5i64, 2i64]]);

    let join = TableJoin::new(Cmp::Eq, false, false, false, BlockChain::new(), Column(0), right_items(), Column(1), None);
    let out = execute(&ctx(4), Arc::new(join), vec![vec![tuple![4i64]]]).unwrap();
    assert!(out.is_empty());
}

#[test]
fn left_join_padding_covers_the_nested_block() {
    let nested: Arc<dyn pushq_operators::Block> =
        Arc::new(ForBind::new(Literal::new(["n"]), false).with_position(true));
    let join = TableJoin::new(
        Cmp::Eq,
        false,
        true,
        false,
        BlockChain::new(),
        Column(0),
        right_items(),
        Column(1),
        Some(nested),
    );
    let out = execute(&ctx(2), Arc::new(join), vec![vec![tuple![1i64]]]).unwrap();
    // 1 (left) + 2 (right bindings) + 2 (nested item and position)
    assert_eq!(out, vec![Tuple::new(vec![Scalar::I64(1), Scalar::Null, Scalar::Null, Scalar::Null, Scalar::Null])]);
}

/// Rows `(g, v)`; group g builds the keys `g*100 .. g*100+4`.
fn grouped_join() -> TableJoin {
    let right = ForBind::new(
        FnExpr::values(|t: &Tuple| {
            let g = t[0].as_i64().unwrap_or(0);
            Ok((0..4).map(|i| Scalar::I64(g * 100 + i)).collect())
        }),
        false,
    );
    TableJoin::new(Cmp::Eq, false, true, false, BlockChain::new(), Column(1), right, Column(2), None).with_group(0)
}

#[test]
fn grouped_probes_never_see_a_neighbouring_group() {
    // Value 101 belongs to group 1; in group 2 it must not match.
    let mut input = Vec::new();
    for round in 0..10i64 {
        let g = round % 3;
        for v in [g * 100 + 1, 101, g * 100 + 3] {
            input.push(tuple![g, v]);
        }
    }
    let expected: Vec<Tuple> = input
        .iter()
        .map(|t| {
            let (g, v) = (t[0].as_i64().unwrap(), t[1].as_i64().unwrap());
            if v / 100 == g && v % 100 < 4 {
                t.concat(&[Scalar::I64(v)])
            } else {
                t.concat(&[Scalar::Null])
            }
        })
        .collect();

    for pool in [1, 4] {
        let chain = BlockChain::new().then(splitter()).then(grouped_join());
        let out = execute(&ctx(pool), Arc::new(chain), vec![input.clone()]).unwrap();
        assert_eq!(out, expected, "pool {pool}");
    }
}

fn as_ints(rows: &[Tuple]) -> Vec<Vec<i64>> {
    rows.iter()
        .map(|t| t.array().iter().map(|v| v.as_i64().unwrap_or(-1)).collect())
        .collect()
}

/// Rows `(i, i % 9)` probed on column 1 against keys 0..7 then 0..3, so
/// keys below 3 match twice and 7, 8 never match.
fn fan_in_join(ordered_left: bool, ordered_right: bool) -> BlockChain {
    let right = ForBind::new(Literal::new((0..7i64).chain(0..3)), false).with_position(true);
    let join = TableJoin::new(Cmp::Eq, false, true, false, BlockChain::new(), Column(1), right, Column(2), None)
        .with_ordered_left(ordered_left)
        .with_ordered_right(ordered_right)
        .with_left_permits(2)
        .with_right_permits(3);
    BlockChain::new().then(splitter()).then(join)
}

#[test]
fn unordered_sides_keep_the_same_rows() {
    let input: Vec<Tuple> = (0..60i64).map(|i| tuple![i, i % 9]).collect();
    let baseline = execute(&ctx(1), Arc::new(fan_in_join(true, true)), vec![input.clone()]).unwrap();
    // Six full cycles of 12 rows, then keys 0..6 give 9.
    assert_eq!(baseline.len(), 6 * 12 + 9);
    let mut want = as_ints(&baseline);
    want.sort();

    for (ordered_left, ordered_right) in [(false, true), (true, false), (false, false)] {
        for pool in [1, 4, 8] {
            let out = execute(
                &ctx(pool),
                Arc::new(fan_in_join(ordered_left, ordered_right)),
                vec![input.clone()],
            )
            .unwrap();
            let mut got = as_ints(&out);
            got.sort();
            assert_eq!(got, want, "left {ordered_left} right {ordered_right} pool {pool}");
        }
    }
}

#[test]
fn ordered_sides_with_single_permits_match_the_sequential_run() {
    let input: Vec<Tuple> = (0..40i64).map(|i| tuple![i, i % 9]).collect();
    let baseline = execute(&ctx(1), Arc::new(fan_in_join(true, true)), vec![input.clone()]).unwrap();
    for pool in [2, 8] {
        let right = ForBind::new(Literal::new((0..7i64).chain(0..3)), false).with_position(true);
        let join = TableJoin::new(Cmp::Eq, false, true, false, BlockChain::new(), Column(1), right, Column(2), None)
            .with_left_permits(1)
            .with_right_permits(1);
        let chain = BlockChain::new().then(splitter()).then(join);
        let out = execute(&ctx(pool), Arc::new(chain), vec![input.clone()]).unwrap();
        assert_eq!(out, baseline, "pool {pool}");
    }
}

#[test]
fn partition_is_forwarded_to_the_downstream_stop() {
    let ctx = ctx(2);
    let (root, handle) = ResultSink::new(Permits::new(2));
    let stop = root.id();

    // (x) -> bind 5 -> (x, 5) -> join on the item against 5, 5, 7.
    let right = ForBind::new(Literal::new([5i64, 5, 7]), false).with_position(true);
    let join = TableJoin::new(Cmp::Eq, false, false, false, BlockChain::new(), Column(1), right, Column(2), None);
    let bind = ForBind::new(Literal::new([5i64]), false);
    let mut first = bind.create(&ctx, join.create(&ctx, root).unwrap()).unwrap();
    let mut second = first.partition(stop);

    second.begin().unwrap();
    second.output(&[tuple![2i64]]).unwrap();
    second.end().unwrap();
    first.begin().unwrap();
    first.output(&[tuple![1i64]]).unwrap();
    first.end().unwrap();

    assert_eq!(
        as_ints(&handle.take().unwrap()),
        vec![vec![1, 5, 5, 1], vec![1, 5, 5, 2], vec![2, 5, 5, 1], vec![2, 5, 5, 2]]
    );
}
