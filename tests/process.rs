// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process lifecycle: launch, join, detach, sleeping and composition.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kcsp::channel::{Chan, OpResult};
use kcsp::{Process, parallel, proc, proc_for, this_proc};

#[test]
fn join_observes_side_effects() {
    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);

    let mut p = Process::new(move || {
        this_proc::delay_for(Duration::from_millis(10));
        c.fetch_add(1, Ordering::Relaxed);
    });
    p.launch();
    p.join();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

#[test]
fn join_after_termination_returns_immediately() {
    let mut p = proc(|| {});
    p.launch();
    // Give it ample time to finish before joining.
    this_proc::delay_for(Duration::from_millis(30));
    let start = Instant::now();
    p.join();
    assert!(start.elapsed() < Duration::from_millis(25));
}

#[test]
fn detached_process_still_runs() {
    let (tx, rx) = Chan::<&'static str>::create();
    let mut p = proc(move || {
        assert_eq!(tx.send("ran"), OpResult::Ok);
    });
    p.launch();
    p.detach();
    assert_eq!(p.get_id(), None);
    assert_eq!(rx.recv(), Ok("ran"));
}

#[test]
fn ids_are_distinct() {
    let a = proc(|| {});
    let b = proc(|| {});
    assert_ne!(a.get_id(), b.get_id());
    assert!(a.get_id().is_some());
    // Never launched; dropping the handles releases the contexts.
}

#[test]
fn sleepers_wake_in_deadline_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let base = Instant::now();

    let mut procs = Vec::new();
    for (idx, offset) in [(0usize, 30u64), (1, 60), (2, 90)] {
        let order = Arc::clone(&order);
        procs.push(proc(move || {
            this_proc::delay_until(base + Duration::from_millis(offset));
            order.lock().unwrap().push(idx);
        }));
    }
    parallel(procs);

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn proc_for_visits_every_item() {
    let sum = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&sum);

    let mut p = proc_for(1..=10usize, move |i| {
        s.fetch_add(i, Ordering::Relaxed);
    });
    p.launch();
    p.join();
    assert_eq!(sum.load(Ordering::Relaxed), 55);
}

#[test]
fn nested_parallel() {
    let hits = Arc::new(AtomicUsize::new(0));

    let outer: Vec<_> = (0..4)
        .map(|_| {
            let hits = Arc::clone(&hits);
            proc(move || {
                let inner: Vec<_> = (0..4)
                    .map(|_| {
                        let hits = Arc::clone(&hits);
                        proc(move || {
                            hits.fetch_add(1, Ordering::Relaxed);
                        })
                    })
                    .collect();
                parallel(inner);
            })
        })
        .collect();
    parallel(outer);

    assert_eq!(hits.load(Ordering::Relaxed), 16);
}

#[test]
fn yield_now_returns() {
    parallel([
        proc(|| {
            for _ in 0..100 {
                this_proc::yield_now();
            }
        }),
        proc(|| {
            for _ in 0..100 {
                this_proc::yield_now();
            }
        }),
    ]);
}
