//! Fork order defines merge order at the root, whatever the completion
//! order of the writers.

use std::thread;

use pushq_core::{tuple, Error, Tuple};
use pushq_exec::Permits;
use pushq_operators::sink::{fork_swap, ResultSink, Sink};

#[test]
fn forks_merge_in_issue_order_across_threads() {
    let (mut root, handle) = ResultSink::new(Permits::new(4));
    root.begin().unwrap();

    // Issue 32 handles in order: each fork_swap hands out the current
    // position and keeps its successor.
    let handles: Vec<Box<dyn Sink>> = (0..32).map(|_| fork_swap(&mut root)).collect();
    root.end().unwrap();

    // Finish them in reverse from separate threads.
    let writers: Vec<_> = handles
        .into_iter()
        .enumerate()
        .rev()
        .map(|(i, mut s)| {
            thread::spawn(move || {
                s.begin()?;
                s.output(&[tuple![i as i64, 0i64]])?;
                s.output(&[tuple![i as i64, 1i64]])?;
                s.end()
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap().unwrap();
    }

    let out = handle.take().unwrap();
    let expected: Vec<Tuple> = (0..32i64).flat_map(|i| [tuple![i, 0i64], tuple![i, 1i64]]).collect();
    assert_eq!(out, expected);
}

#[test]
fn fork_is_placed_right_after_its_origin() {
    let (mut a, handle) = ResultSink::new(Permits::new(1));
    a.begin().unwrap();
    let mut b = a.fork();
    let mut c = a.fork();
    for (s, v) in [(&mut b, 2i64), (&mut c, 1), (&mut a, 0)] {
        s.output(&[tuple![v]]).unwrap();
    }
    b.end().unwrap();
    c.end().unwrap();
    a.end().unwrap();
    assert_eq!(handle.take().unwrap(), vec![tuple![0i64], tuple![1i64], tuple![2i64]]);
}

#[test]
fn one_failure_aborts_the_root() {
    let (mut root, handle) = ResultSink::new(Permits::new(2));
    root.begin().unwrap();
    let mut late = root.fork();
    root.output(&[tuple![1i64]]).unwrap();
    root.end().unwrap();
    late.begin().unwrap();
    late.fail();
    assert!(matches!(handle.take(), Err(Error::Aborted)));
}
