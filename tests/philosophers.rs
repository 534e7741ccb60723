// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Dining philosophers with a security guard: six philosophers, six
//! forks, and a guard that admits at most five to the table. Sequential
//! fork pickup plus the guard makes deadlock impossible; the test asserts
//! every philosopher finishes all of their eating rounds.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kcsp::alt::Alt;
use kcsp::channel::{self, OpResult, Rx, Tx};
use kcsp::{parallel, proc, this_proc};

const N: usize = 6;
const ROUNDS: usize = 3;

fn philosopher(
    i: usize,
    left: Tx<usize>,
    right: Tx<usize>,
    down: Tx<usize>,
    up: Tx<usize>,
    meals: Arc<Vec<AtomicUsize>>,
) {
    for _ in 0..ROUNDS {
        // Think.
        this_proc::delay_for(Duration::from_millis(1));

        // Ask the guard for a seat.
        assert_eq!(down.send(i), OpResult::Ok);

        // Pick up both forks (grab, then matching release below).
        assert_eq!(left.send(i), OpResult::Ok);
        assert_eq!(right.send(i), OpResult::Ok);

        // Eat.
        meals[i].fetch_add(1, Ordering::Relaxed);
        this_proc::delay_for(Duration::from_millis(1));

        // Put the forks back and leave the table.
        assert_eq!(left.send(i), OpResult::Ok);
        assert_eq!(right.send(i), OpResult::Ok);
        assert_eq!(up.send(i), OpResult::Ok);
    }
}

/// A fork serves whichever neighbour grabs it first, then waits for that
/// neighbour's release before serving anyone again.
fn fork(left: Rx<usize>, right: Rx<usize>) {
    for _ in 0..2 * ROUNDS {
        let side = std::cell::Cell::new(0u8);
        Alt::new()
            .recv(&left, |_| side.set(1))
            .recv(&right, |_| side.set(2))
            .select();
        let release = match side.get() {
            1 => left.recv(),
            2 => right.recv(),
            _ => unreachable!("a fork selection always commits"),
        };
        release.expect("the holder always releases");
    }
}

/// The guard admits at most N-1 philosophers to the table.
fn security(down: Vec<Rx<usize>>, up: Vec<Rx<usize>>) {
    let seated = std::cell::Cell::new(0usize);
    for _ in 0..2 * N * ROUNDS {
        Alt::new()
            .recv_for_if(seated.get() < N - 1, down.iter(), |_| {
                seated.set(seated.get() + 1);
            })
            .recv_for_if(seated.get() > 0, up.iter(), |_| {
                seated.set(seated.get() - 1);
            })
            .select();
    }
    assert_eq!(seated.get(), 0);
}

#[test]
fn no_philosopher_starves() {
    // Per philosopher: the left/right fork grab channels and the guard's
    // down/up channels.
    let (left_txs, left_rxs) = channel::create_n::<usize>(N);
    let (right_txs, right_rxs) = channel::create_n::<usize>(N);
    let (down_txs, down_rxs) = channel::create_n::<usize>(N);
    let (up_txs, up_rxs) = channel::create_n::<usize>(N);

    let meals: Arc<Vec<AtomicUsize>> = Arc::new((0..N).map(|_| AtomicUsize::new(0)).collect());

    let mut procs = Vec::new();

    let mut left_txs = left_txs.into_iter();
    let mut right_txs = right_txs.into_iter();
    let mut down_txs = down_txs.into_iter();
    let mut up_txs = up_txs.into_iter();
    for i in 0..N {
        let (left, right) = (left_txs.next().unwrap(), right_txs.next().unwrap());
        let (down, up) = (down_txs.next().unwrap(), up_txs.next().unwrap());
        let meals = Arc::clone(&meals);
        procs.push(proc(move || philosopher(i, left, right, down, up, meals)));
    }

    // Fork i sits between philosopher i (their left hand) and philosopher
    // (i+1) % N (their right hand).
    let mut right_rxs: Vec<Option<Rx<usize>>> = right_rxs.into_iter().map(Some).collect();
    for (i, left_rx) in left_rxs.into_iter().enumerate() {
        let right_rx = right_rxs[(i + 1) % N].take().unwrap();
        procs.push(proc(move || fork(left_rx, right_rx)));
    }

    procs.push(proc(move || security(down_rxs, up_rxs)));

    parallel(procs);

    for (i, count) in meals.iter().enumerate() {
        assert_eq!(
            count.load(Ordering::Relaxed),
            ROUNDS,
            "philosopher {i} must eat every round"
        );
    }
}
