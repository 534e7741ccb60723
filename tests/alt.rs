// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Committed-choice semantics.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use kcsp::alt::Alt;
use kcsp::channel::{self, Chan, OpResult};
use kcsp::timer::Egg;
use kcsp::{parallel, proc, this_proc};

/// Exactly one of {channel callback, timeout callback, skip callback}
/// runs per select.
#[test]
fn exactly_once_commit() {
    const ROUNDS: usize = 500;

    let (tx, rx) = Chan::<usize>::create();

    parallel([
        proc(move || {
            for i in 0..ROUNDS {
                // Odd rounds leave the Alt to its (short) timeout.
                if i % 2 == 0 {
                    assert_eq!(tx.send(i), OpResult::Ok);
                }
            }
        }),
        proc(move || {
            let mut received = 0;
            let mut timeouts = 0;
            while received < ROUNDS / 2 {
                let fired = Cell::new(0u32);
                let egg = Egg::new(Duration::from_millis(2));
                Alt::new()
                    .recv(&rx, |_| fired.set(fired.get() + 1))
                    .timeout(&egg, || fired.set(fired.get() + 10))
                    .select();
                match fired.get() {
                    1 => received += 1,
                    10 => timeouts += 1,
                    n => panic!("expected exactly one callback, saw {n}"),
                }
            }
            let _ = timeouts;
        }),
    ]);
}

#[test]
fn skip_fires_when_nothing_is_ready() {
    let (_tx, rx) = Chan::<u8>::create();
    let outcome = Cell::new("none");
    Alt::new()
        .recv(&rx, |_| outcome.set("recv"))
        .skip(|| outcome.set("skip"))
        .select();
    assert_eq!(outcome.get(), "skip");
}

#[test]
fn ready_choice_beats_skip() {
    let (tx, rx) = Chan::<u8>::create();
    parallel([
        proc(move || {
            assert_eq!(tx.send(5), OpResult::Ok);
        }),
        proc(move || {
            // Let the sender park first.
            this_proc::delay_for(Duration::from_millis(20));
            let outcome = Cell::new("none");
            Alt::new()
                .recv(&rx, |v| {
                    assert_eq!(v, 5);
                    outcome.set("recv");
                })
                .skip(|| outcome.set("skip"))
                .select();
            assert_eq!(outcome.get(), "recv");
        }),
    ]);
}

#[test]
fn timeout_fires_on_silent_channels() {
    let (_tx, rx) = Chan::<u8>::create();
    let fired = Cell::new(false);
    let start = Instant::now();
    let egg = Egg::new(Duration::from_millis(30));
    Alt::new()
        .recv(&rx, |_| panic!("nothing was sent"))
        .timeout(&egg, || fired.set(true))
        .select();
    assert!(fired.get());
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn empty_alt_with_timeout() {
    let fired = Cell::new(false);
    let egg = Egg::new(Duration::from_millis(10));
    Alt::new().timeout(&egg, || fired.set(true)).select();
    assert!(fired.get());
}

#[test]
fn guards_collapse_to_base_form() {
    let (_tx, rx) = Chan::<u8>::create();
    let outcome = Cell::new("none");
    Alt::new()
        .recv_if(false, &rx, |_| outcome.set("recv"))
        .skip_if(true, || outcome.set("skip"))
        .select();
    assert_eq!(outcome.get(), "skip");
}

/// Registering both directions of one channel is a clash: the channel is
/// excluded from the selection, so only the timeout can fire.
#[test]
fn clashed_channel_never_fires() {
    let (tx, rx) = Chan::<u8>::create();
    let outcome = Cell::new("none");
    let egg = Egg::new(Duration::from_millis(20));
    Alt::new()
        .send(&tx, 1, || outcome.set("send"))
        .recv(&rx, |_| outcome.set("recv"))
        .timeout(&egg, || outcome.set("timeout"))
        .select();
    assert_eq!(outcome.get(), "timeout");
}

/// An alting sender completes against a plain parked receiver.
#[test]
fn alt_send_completes() {
    let (tx, rx) = Chan::<u8>::create();
    parallel([
        proc(move || {
            assert_eq!(rx.recv(), Ok(77));
        }),
        proc(move || {
            this_proc::delay_for(Duration::from_millis(10));
            let sent = Cell::new(false);
            Alt::new().send(&tx, 77, || sent.set(true)).select();
            assert!(sent.get());
        }),
    ]);
}

/// Two Alts facing each other in opposite directions on a shared pair of
/// channels: the priority rule must let both sides make progress.
#[test]
fn two_alts_opposite_directions() {
    const ROUNDS: usize = 2000;

    let (tx_a, rx_a) = Chan::<usize>::create();
    let (tx_b, rx_b) = Chan::<usize>::create();

    parallel([
        proc(move || {
            let mut commits = 0;
            while commits < ROUNDS {
                let done = Cell::new(false);
                Alt::new()
                    .send(&tx_a, commits, || done.set(true))
                    .recv(&rx_b, |_| done.set(true))
                    .select();
                assert!(done.get());
                commits += 1;
            }
        }),
        proc(move || {
            let mut commits = 0;
            while commits < ROUNDS {
                let done = Cell::new(false);
                Alt::new()
                    .recv(&rx_a, |_| done.set(true))
                    .send(&tx_b, commits, || done.set(true))
                    .select();
                assert!(done.get());
                commits += 1;
            }
        }),
    ]);
}

/// 200 writers, one reader Alt-selecting across all of them: the uniform
/// random tie-break must keep every writer live.
#[test]
fn stressed_alt() {
    const WRITERS: usize = 200;
    const SELECTIONS: usize = 50_000;

    let (txs, rxs) = channel::create_n::<usize>(WRITERS);
    let observed: Arc<Vec<AtomicUsize>> =
        Arc::new((0..WRITERS).map(|_| AtomicUsize::new(0)).collect());

    let mut procs = Vec::new();
    for (id, tx) in txs.into_iter().enumerate() {
        procs.push(proc(move || {
            // Each writer stamps its id on everything it sends.
            loop {
                if tx.send(id) != OpResult::Ok {
                    break;
                }
            }
        }));
    }
    {
        let observed = Arc::clone(&observed);
        procs.push(proc(move || {
            for _ in 0..SELECTIONS {
                Alt::new()
                    .recv_for(rxs.iter(), |id| {
                        observed[id].fetch_add(1, Ordering::Relaxed);
                    })
                    .select();
            }
            // Dropping the receive ends shuts the writers down.
        }));
    }

    parallel(procs);

    for (id, count) in observed.iter().enumerate() {
        assert!(
            count.load(Ordering::Relaxed) > 0,
            "writer {id} was never observed"
        );
    }
}
