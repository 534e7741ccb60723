// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Channel semantics: rendezvous, close, timeouts, and heavy traffic.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use kcsp::alt::Alt;
use kcsp::channel::{self, Chan, OpResult};
use kcsp::{parallel, proc, this_proc};

#[test]
fn rendezvous_moves_one_value() {
    let (tx, rx) = Chan::<String>::create();
    parallel([
        proc(move || assert_eq!(tx.send("hello".to_string()), OpResult::Ok)),
        proc(move || assert_eq!(rx.recv().as_deref(), Ok("hello"))),
    ]);
}

/// Two processes exchange values over two channels; both sides count
/// exactly the expected number of exchanges.
#[test]
fn ping_pong() {
    const ROUNDS: u32 = 1000;

    let (ping_tx, ping_rx) = Chan::<u32>::create();
    let (pong_tx, pong_rx) = Chan::<u32>::create();

    parallel([
        proc(move || {
            let mut count = 0;
            for i in 0..ROUNDS {
                assert_eq!(ping_tx.send(i), OpResult::Ok);
                assert_eq!(pong_rx.recv(), Ok(i));
                count += 1;
            }
            assert_eq!(count, ROUNDS);
        }),
        proc(move || {
            let mut count = 0;
            for _ in 0..ROUNDS {
                let v = ping_rx.recv().expect("ping still open");
                assert_eq!(pong_tx.send(v), OpResult::Ok);
                count += 1;
            }
            assert_eq!(count, ROUNDS);
        }),
    ]);
}

/// Closing wakes a suspended receiver with `Closed`, and `is_closed` never
/// goes back to open.
#[test]
fn close_wakes_parked_receiver() {
    let (tx, rx) = Chan::<u8>::create();
    parallel([
        proc(move || {
            assert_eq!(rx.recv(), Err(OpResult::Closed));
            assert!(rx.is_closed());
        }),
        proc(move || {
            // Give the receiver time to park first.
            this_proc::delay_for(Duration::from_millis(20));
            tx.close();
            assert!(tx.is_closed());
        }),
    ]);
}

/// Dropping the last endpoint closes the channel and wakes the peer.
#[test]
fn drop_closes() {
    let (tx, rx) = Chan::<u8>::create();
    parallel([
        proc(move || {
            assert_eq!(tx.send(1), OpResult::Closed);
        }),
        proc(move || {
            this_proc::delay_for(Duration::from_millis(20));
            drop(rx);
        }),
    ]);
}

#[test]
fn send_on_closed_channel() {
    let (tx, rx) = Chan::<u8>::create();
    rx.close();
    assert_eq!(tx.send(7), OpResult::Closed);
}

#[test]
fn timed_recv_expires() {
    let (_tx, rx) = Chan::<u8>::create();
    let start = Instant::now();
    assert_eq!(rx.recv_for(Duration::from_millis(25)), Err(OpResult::Timeout));
    assert!(start.elapsed() >= Duration::from_millis(25));
}

#[test]
fn timed_send_expires() {
    let (tx, _rx) = Chan::<u8>::create();
    assert_eq!(
        tx.send_for(9, Duration::from_millis(25)),
        OpResult::Timeout
    );
}

#[test]
fn timed_recv_completes_before_deadline() {
    let (tx, rx) = Chan::<u8>::create();
    parallel([
        proc(move || {
            this_proc::delay_for(Duration::from_millis(10));
            assert_eq!(tx.send(42), OpResult::Ok);
        }),
        proc(move || {
            assert_eq!(rx.recv_until(Instant::now() + Duration::from_secs(5)), Ok(42));
        }),
    ]);
}

/// A timed sender and a punctual receiver: whoever wins the claim race,
/// no value may be both delivered and reported as timed out, and none may
/// vanish.
#[test]
fn timed_send_claim_race() {
    const ROUNDS: usize = 200;

    let sent = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = Chan::<usize>::create();
    let sent2 = Arc::clone(&sent);
    let received2 = Arc::clone(&received);

    parallel([
        proc(move || {
            for i in 0..ROUNDS {
                if tx.send_for(i, Duration::from_micros(50)) == OpResult::Ok {
                    sent2.fetch_add(1, Ordering::Relaxed);
                }
            }
            // Closing tells the receiver no more values are coming.
        }),
        proc(move || {
            while rx.recv().is_ok() {
                received2.fetch_add(1, Ordering::Relaxed);
            }
        }),
    ]);

    assert_eq!(
        sent.load(Ordering::Relaxed),
        received.load(Ordering::Relaxed),
        "every send reported Ok must be received exactly once"
    );
}

/// Seven writers fan in through a router onto three readers. Every
/// written value is observed exactly once across the readers.
#[test]
fn any_to_any_traffic() {
    const WRITERS: usize = 7;
    const READERS: usize = 3;
    const PER_WRITER: usize = 12_000;
    const TOTAL: usize = WRITERS * PER_WRITER;
    const PER_READER: usize = TOTAL / READERS;

    let (wtxs, wrxs) = channel::create_n::<(usize, usize)>(WRITERS);
    let (rtxs, rrxs) = channel::create_n::<(usize, usize)>(READERS);

    // One count per writer, summed across all readers.
    let counts: Arc<Vec<AtomicUsize>> =
        Arc::new((0..WRITERS).map(|_| AtomicUsize::new(0)).collect());

    let mut procs = Vec::new();
    for (id, wtx) in wtxs.into_iter().enumerate() {
        procs.push(proc(move || {
            for seq in 0..PER_WRITER {
                assert_eq!(wtx.send((id, seq)), OpResult::Ok);
            }
        }));
    }
    procs.push(proc(move || {
        let got = std::cell::Cell::new(None);
        for k in 0..TOTAL {
            Alt::new()
                .recv_for(wrxs.iter(), |v| got.set(Some(v)))
                .select();
            let v = got.take().expect("router selection must receive");
            assert_eq!(rtxs[k % READERS].send(v), OpResult::Ok);
        }
    }));
    for rrx in rrxs {
        let counts = Arc::clone(&counts);
        procs.push(proc(move || {
            for _ in 0..PER_READER {
                let (writer, _seq) = rrx.recv().expect("router still routing");
                counts[writer].fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    parallel(procs);

    for (writer, count) in counts.iter().enumerate() {
        assert_eq!(
            count.load(Ordering::Relaxed),
            PER_WRITER,
            "writer {writer} items must all be observed"
        );
    }
}

/// The receive iterator ends exactly when the channel closes.
#[test]
fn recv_iterator_drains_until_close() {
    let (tx, rx) = Chan::<u32>::create();
    parallel([
        proc(move || {
            for i in 0..100 {
                assert_eq!(tx.send(i), OpResult::Ok);
            }
        }),
        proc(move || {
            let all: Vec<u32> = rx.iter().collect();
            assert_eq!(all, (0..100).collect::<Vec<_>>());
        }),
    ]);
}
