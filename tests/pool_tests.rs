//! Scheduler behavior under load: termination, exactly-once execution,
//! joins from foreign threads, and failure isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use pushq_core::Error;
use pushq_exec::{Pool, Task, TaskStatus};

fn sum_range(pool: &Arc<Pool>, lo: u64, hi: u64, out: &Arc<AtomicUsize>) -> pushq_core::Result<()> {
    if hi - lo <= 4 {
        out.fetch_add((lo..hi).sum::<u64>() as usize, Ordering::SeqCst);
        return Ok(());
    }
    let mid = lo + (hi - lo) / 2;
    let left = {
        let (pool, out) = (Arc::clone(pool), Arc::clone(out));
        Task::new(move || sum_range(&pool, lo, mid, &out))
    };
    pool.fork(&left);
    let r = sum_range(pool, mid, hi, out);
    left.join().and(r)
}

#[test]
fn nested_fork_join_terminates_for_every_pool_size() {
    for size in [1, 2, 3, 8] {
        let pool = Arc::new(Pool::new(size).unwrap());
        let out = Arc::new(AtomicUsize::new(0));
        let root = {
            let (p, o) = (Arc::clone(&pool), Arc::clone(&out));
            Task::new(move || sum_range(&p, 0, 10_000, &o))
        };
        pool.submit(root.clone());
        root.join().unwrap();
        assert_eq!(root.status(), TaskStatus::Success);
        assert_eq!(out.load(Ordering::SeqCst), (0..10_000u64).sum::<u64>() as usize, "size {size}");
    }
}

#[test]
fn each_task_runs_exactly_once() {
    let pool = Pool::new(4).unwrap();
    let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..2_000).map(|_| AtomicUsize::new(0)).collect());
    let tasks: Vec<Task> = (0..2_000)
        .map(|i| {
            let hits = Arc::clone(&hits);
            pool.submit(Task::new(move || {
                hits[i].fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
        })
        .collect();
    for t in &tasks {
        t.join().unwrap();
        // A second exec is a no-op.
        t.exec();
    }
    assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    pool.shutdown();
    let execs: u64 = pool.stats().iter().map(|s| s.exec_count).sum();
    assert_eq!(execs, 2_000);
}

#[test]
fn many_foreign_threads_join_the_same_task() {
    let pool = Arc::new(Pool::new(2).unwrap());
    let gate = Arc::new(std::sync::Barrier::new(9));
    let task = {
        let gate = Arc::clone(&gate);
        Task::new(move || {
            gate.wait();
            Ok(())
        })
    };
    pool.submit(task.clone());
    let joiners: Vec<_> = (0..8)
        .map(|_| {
            let (t, gate) = (task.clone(), Arc::clone(&gate));
            thread::spawn(move || {
                gate.wait();
                t.join()
            })
        })
        .collect();
    for j in joiners {
        j.join().unwrap().unwrap();
    }
    assert!(task.finished());
}

#[test]
fn failures_are_captured_and_do_not_stall_the_pool() {
    let pool = Pool::new(2).unwrap();
    let bad = pool.submit(Task::new(|| Err(Error::eval("boom"))));
    let panicky = pool.submit(Task::new(|| panic!("kaboom")));
    let good = pool.submit(Task::new(|| Ok(())));

    assert!(matches!(bad.join(), Err(Error::Eval(m)) if m == "boom"));
    assert!(matches!(panicky.join(), Err(Error::Panicked(_))));
    good.join().unwrap();
    assert_eq!(bad.status(), TaskStatus::Error);

    // Joining again reports the same captured error.
    assert!(matches!(bad.join(), Err(Error::Eval(_))));
}
