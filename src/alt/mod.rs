// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guarded committed choice over channel operations.
//!
//! An [`Alt`] accumulates *choices* (sends, receives, a timeout, a skip)
//! and [`Alt::select`] commits to exactly one of them: the chosen channel
//! operation completes (and only that one), then its callback runs. If no
//! choice can complete immediately the process parks until one can, until
//! the earliest timeout fires, or, when a skip case is present, not at
//! all.
//!
//! ```no_run
//! use kcsp::alt::Alt;
//! use kcsp::channel;
//!
//! let (_tx, rx) = channel::create::<u32>();
//! let (tx2, _rx2) = channel::create::<u32>();
//! Alt::new()
//!     .recv(&rx, |v| println!("got {v}"))
//!     .send(&tx2, 7, || println!("sent"))
//!     .select();
//! ```
//!
//! Registering the same channel in both directions is a *clash*: neither
//! direction of that channel participates in the selection.

mod choice;
mod sync;

pub(crate) use sync::{AltCore, AltResult, AltState, AltSync, ChoiceRef, SyncState};

use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::alt::choice::{ChoiceDyn, ChoiceRecv, ChoiceSend};
use crate::channel::{ChanId, Rx, Tx};
use crate::runtime::scheduler::Scheduler;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuditState {
    Tx,
    Rx,
    Clash,
}

/// Per-channel bookkeeping of the registered choices.
struct ChoiceAudit {
    state: AuditState,
    indices: Vec<usize>,
}

enum Winner {
    Choice(usize),
    Timeout,
    Skip,
}

/// A committed-choice builder; see the [module docs](self).
#[must_use = "an Alt does nothing until `select()` is called"]
pub struct Alt<'a> {
    choices: Vec<Box<dyn ChoiceDyn + 'a>>,
    audit: BTreeMap<ChanId, ChoiceAudit>,
    birth: Instant,
    deadline: Option<Instant>,
    timeout_fn: Option<Box<dyn FnOnce() + 'a>>,
    has_skip: bool,
    skip_fn: Option<Box<dyn FnOnce() + 'a>>,
}

// === impl Alt ===

impl<'a> Alt<'a> {
    pub fn new() -> Self {
        Self {
            choices: Vec::new(),
            audit: BTreeMap::new(),
            birth: Instant::now(),
            deadline: None,
            timeout_fn: None,
            has_skip: false,
            skip_fn: None,
        }
    }

    fn add_choice(&mut self, id: ChanId, direction: AuditState, choice: Box<dyn ChoiceDyn + 'a>) {
        match self.audit.get_mut(&id) {
            None => {
                let idx = self.choices.len();
                self.choices.push(choice);
                self.audit.insert(
                    id,
                    ChoiceAudit {
                        state: direction,
                        indices: vec![idx],
                    },
                );
            }
            Some(audit) if audit.state == direction => {
                let idx = self.choices.len();
                self.choices.push(choice);
                audit.indices.push(idx);
            }
            Some(audit) => {
                // Both directions of one channel: the channel drops out of
                // the selection entirely.
                audit.state = AuditState::Clash;
            }
        }
    }

    /// Adds a send choice.
    pub fn send<T>(mut self, tx: &'a Tx<T>, item: T, func: impl FnOnce() + 'a) -> Self
    where
        T: Send + 'a,
    {
        if !tx.is_closed() {
            self.add_choice(
                tx.id(),
                AuditState::Tx,
                Box::new(ChoiceSend::new(tx, item, Box::new(func))),
            );
        }
        self
    }

    /// Adds a send choice when `guard` holds.
    pub fn send_if<T>(self, guard: bool, tx: &'a Tx<T>, item: T, func: impl FnOnce() + 'a) -> Self
    where
        T: Send + 'a,
    {
        if guard { self.send(tx, item, func) } else { self }
    }

    /// Adds one send choice per endpoint, replicating `item`.
    pub fn send_for<T, I, F>(mut self, txs: I, item: T, func: F) -> Self
    where
        T: Send + Clone + 'a,
        I: IntoIterator<Item = &'a Tx<T>>,
        F: FnOnce() + Clone + 'a,
    {
        for tx in txs {
            self = self.send(tx, item.clone(), func.clone());
        }
        self
    }

    /// Adds a receive choice.
    pub fn recv<T>(mut self, rx: &'a Rx<T>, func: impl FnOnce(T) + 'a) -> Self
    where
        T: Send + 'a,
    {
        if !rx.is_closed() {
            self.add_choice(
                rx.id(),
                AuditState::Rx,
                Box::new(ChoiceRecv::new(rx, Box::new(func))),
            );
        }
        self
    }

    /// Adds a receive choice when `guard` holds.
    pub fn recv_if<T>(self, guard: bool, rx: &'a Rx<T>, func: impl FnOnce(T) + 'a) -> Self
    where
        T: Send + 'a,
    {
        if guard { self.recv(rx, func) } else { self }
    }

    /// Adds one receive choice per endpoint.
    pub fn recv_for<T, I, F>(mut self, rxs: I, func: F) -> Self
    where
        T: Send + 'a,
        I: IntoIterator<Item = &'a Rx<T>>,
        F: FnOnce(T) + Clone + 'a,
    {
        for rx in rxs {
            self = self.recv(rx, func.clone());
        }
        self
    }

    /// Adds one receive choice per endpoint when `guard` holds.
    pub fn recv_for_if<T, I, F>(self, guard: bool, rxs: I, func: F) -> Self
    where
        T: Send + 'a,
        I: IntoIterator<Item = &'a Rx<T>>,
        F: FnOnce(T) + Clone + 'a,
    {
        if guard { self.recv_for(rxs, func) } else { self }
    }

    /// Adds a timeout case. When several are registered, the earliest
    /// deadline and its callback win.
    pub fn timeout<Tm>(mut self, timer: &Tm, func: impl FnOnce() + 'a) -> Self
    where
        Tm: Timer + Clone,
    {
        let mut armed = timer.clone();
        armed.reset();
        let tp = armed.deadline();
        if self.deadline.is_none_or(|cur| tp < cur) {
            self.deadline = Some(tp);
            self.timeout_fn = Some(Box::new(func));
        }
        self
    }

    /// Adds a timeout case when `guard` holds.
    pub fn timeout_if<Tm>(self, guard: bool, timer: &Tm, func: impl FnOnce() + 'a) -> Self
    where
        Tm: Timer + Clone,
    {
        if guard { self.timeout(timer, func) } else { self }
    }

    /// Adds a skip case: if no channel choice can complete immediately,
    /// `select` runs `func` instead of parking.
    pub fn skip(mut self, func: impl FnOnce() + 'a) -> Self {
        if !self.has_skip {
            self.has_skip = true;
            self.skip_fn = Some(Box::new(func));
        }
        self
    }

    /// Adds a skip case when `guard` holds.
    pub fn skip_if(self, guard: bool, func: impl FnOnce() + 'a) -> Self {
        if guard { self.skip(func) } else { self }
    }

    /// Commits to exactly one choice, runs its callback, and consumes the
    /// Alt.
    ///
    /// Exactly one of a channel callback, the timeout callback or the skip
    /// callback runs; never zero, never two.
    pub fn select(mut self) {
        // De-clash and pick one representative per channel; duplicate
        // same-direction choices on one channel are chosen among uniformly
        // at random.
        let mut picks = Vec::with_capacity(self.audit.len());
        for audit in self.audit.values() {
            if audit.state == AuditState::Clash {
                continue;
            }
            let idx = match audit.indices.len() {
                1 => audit.indices[0],
                n => audit.indices[fastrand::usize(..n)],
            };
            picks.push(idx);
        }

        let winner = match picks.len() {
            0 => self.select_0(),
            1 => self.select_1(picks[0]),
            _ => self.select_n(&picks),
        };

        match winner {
            Winner::Choice(idx) => self.choices[idx].run(),
            Winner::Timeout => {
                debug_assert!(self.deadline.is_some());
                if let Some(func) = self.timeout_fn.take() {
                    func();
                }
            }
            Winner::Skip => {
                if let Some(func) = self.skip_fn.take() {
                    func();
                }
            }
        }
    }

    /// No channel choices: fall straight through to skip, the timeout, or
    /// an indefinite park.
    fn select_0(&mut self) -> Winner {
        if self.has_skip {
            return Winner::Skip;
        }
        match self.deadline {
            Some(tp) => {
                Scheduler::self_().sleep_until(tp);
                Winner::Timeout
            }
            None => {
                Scheduler::self_().wait();
                unreachable!("state not recoverable: empty selection resumed");
            }
        }
    }

    /// A single channel choice skips the shuffle but shares the machinery.
    fn select_1(&mut self, idx: usize) -> Winner {
        self.select_with(&[idx])
    }

    fn select_n(&mut self, picks: &[usize]) -> Winner {
        self.select_with(picks)
    }

    fn select_with(&mut self, picks: &[usize]) -> Winner {
        let core = AltCore::new(Scheduler::running(), self.birth);
        let core_ptr = NonNull::from(&core);
        let tokens: Vec<NonNull<()>> = picks
            .iter()
            .map(|&i| token_of(&*self.choices[i]))
            .collect();
        let index_of = |token: NonNull<()>| -> usize {
            let k = tokens
                .iter()
                .position(|&t| t == token)
                .expect("selected token belongs to this Alt");
            picks[k]
        };

        let mut guard = core.splk().lock();
        for (k, &i) in picks.iter().enumerate() {
            self.choices[i].enter(core_ptr, tokens[k]);
        }

        let mut ready = Vec::with_capacity(picks.len());
        let winner = loop {
            // The checking phase: gather ready choices, try them in random
            // order, repeat until one commits or none are ready.
            while core.selected().is_none() {
                ready.clear();
                ready.extend((0..picks.len()).filter(|&k| self.choices[picks[k]].is_ready()));
                if ready.is_empty() {
                    break;
                }
                if ready.len() > 1 {
                    fastrand::shuffle(&mut ready);
                }
                for &k in &ready {
                    if self.choices[picks[k]].try_complete() == AltResult::Ok {
                        core.commit_local(tokens[k]);
                        break;
                    }
                }
            }

            if let Some(token) = core.selected() {
                core.set_state(AltState::Done);
                drop(guard);
                break Winner::Choice(index_of(token));
            }
            if self.has_skip {
                core.set_state(AltState::Done);
                drop(guard);
                break Winner::Skip;
            }

            core.set_state(AltState::Waiting);
            if core.take_disturbed() {
                // A channel closed while we were checking; its wake-up
                // could not reach us under the lock, so look again instead
                // of parking.
                core.set_state(AltState::Checking);
                continue;
            }
            Scheduler::self_().alt_wait(&core, self.deadline, guard);
            core.set_state(AltState::Done);

            if let Some(token) = core.selected() {
                break Winner::Choice(index_of(token));
            }
            if let Some(tp) = self.deadline {
                if Instant::now() >= tp {
                    break Winner::Timeout;
                }
            }
            // Woken with nothing selected and no expired deadline: a
            // closing channel kicked us. Re-arm and re-evaluate.
            guard = core.splk().lock();
            core.rearm();
        };

        for &i in picks {
            self.choices[i].leave();
        }
        winner
    }
}

impl Default for Alt<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Alt<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Alt")
            .field("choices", &self.choices.len())
            .field("deadline", &self.deadline)
            .field("has_skip", &self.has_skip)
            .finish()
    }
}

fn token_of(choice: &(dyn ChoiceDyn + '_)) -> NonNull<()> {
    let thin = core::ptr::from_ref(choice).cast::<()>();
    NonNull::new(thin.cast_mut()).expect("boxed choice is never null")
}
