// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pipeline topologies: the commstime ring and a concurrent prime sieve.

use kcsp::channel::{Chan, OpResult, Rx, Tx};
use kcsp::{parallel, proc};

/// The classic commstime ring:
///
/// ```text
///   0   successor
///   |   | (+1)  ^
///   v   v       |
///   prefix -> delta -> consumer
/// ```
///
/// The consumer must observe exactly 0,1,2,…,N−1 in order.
#[test]
fn commstime() {
    const ITERS: usize = 1000;

    fn successor(tx: Tx<usize>, rx: Rx<usize>) {
        for i in &rx {
            if tx.send(i + 1) != OpResult::Ok {
                break;
            }
        }
    }

    fn prefix(tx: Tx<usize>, rx: Rx<usize>) {
        if tx.send(0) != OpResult::Ok {
            return;
        }
        for i in &rx {
            if tx.send(i) != OpResult::Ok {
                break;
            }
        }
    }

    fn delta(tx: Tx<usize>, rx: Rx<usize>, consume: Tx<usize>) {
        for i in &rx {
            if consume.send(i) != OpResult::Ok {
                break;
            }
            if tx.send(i) != OpResult::Ok {
                break;
            }
        }
    }

    // a: prefix -> delta, b: delta -> successor,
    // c: successor -> prefix, d: delta -> consumer
    let (tx_a, rx_a) = Chan::<usize>::create();
    let (tx_b, rx_b) = Chan::<usize>::create();
    let (tx_c, rx_c) = Chan::<usize>::create();
    let (tx_d, rx_d) = Chan::<usize>::create();

    parallel([
        proc(move || successor(tx_c, rx_b)),
        proc(move || prefix(tx_a, rx_c)),
        proc(move || delta(tx_b, rx_a, tx_d)),
        proc(move || {
            let received: Vec<usize> = rx_d.iter().take(ITERS).collect();
            let expected: Vec<usize> = (0..ITERS).collect();
            assert_eq!(received, expected);
            // Dropping rx_d closes the ring down.
        }),
    ]);
}

/// A chain of filters seeded by a number generator; the first value out of
/// the n-th channel is the n-th prime.
#[test]
fn concurrent_sieve() {
    const N: usize = 10;

    fn generate(tx: Tx<usize>) {
        let mut i = 2;
        loop {
            if tx.send(i) != OpResult::Ok {
                break;
            }
            i += 1;
        }
    }

    fn filter(rx: Rx<usize>, tx: Tx<usize>) {
        let Ok(prime) = rx.recv() else {
            return;
        };
        for i in &rx {
            if i % prime != 0 && tx.send(i) != OpResult::Ok {
                break;
            }
        }
    }

    let (mut txs, mut rxs) = kcsp::channel::create_n::<usize>(N);

    let mut procs = Vec::with_capacity(N);
    procs.push({
        let tx = txs.remove(0);
        proc(move || generate(tx))
    });
    for _ in 0..N - 1 {
        let rx = rxs.remove(0);
        let tx = txs.remove(0);
        procs.push(proc(move || filter(rx, tx)));
    }
    let last = rxs.remove(0);
    procs.push(proc(move || {
        assert_eq!(last.recv(), Ok(29), "the 10th prime");
        // Dropping the last receiver collapses the chain.
    }));

    parallel(procs);
}
