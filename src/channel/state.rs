// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The channel state machine.
//!
//! A channel has one end slot per direction, each holding at most one
//! published [`ChanEnd`]: a descriptor living on the stack (or in the Alt
//! choice) of a suspended process, carrying the owning context, a pointer
//! to the value slot, and (for alting ends) a reference to the choice
//! mediating the operation. Publishing an end and suspending happens under
//! the channel spinlock, with the lock released only after the context
//! switch (the safe-park protocol), so a completer that finds an end in a
//! slot can rely on the owner being fully suspended.
//!
//! The `consumed` flags tell a woken end whether its rendezvous happened;
//! a parked sender that wakes with `tx_consumed` still clear was woken by
//! `close`.
//!
//! ## Two alting ends
//!
//! When both ends belong to Alts, neither side may commit unilaterally:
//! each must win its own Alt's selection flag, and a naive handshake
//! deadlocks or livelocks when both Alts are mid-check. The tie is broken
//! by age: the choice whose Alt started earlier *offers* the rendezvous
//! through the channel's sync cell and spins; the younger side *accepts*
//! by completing the transfer and flipping the cell. See `alt_send` below
//! and the matching acceptance arm in `alt_recv`.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::time::Instant;

use crate::alt::{AltResult, AltState, AltSync, ChoiceRef, SyncState};
use crate::channel::OpResult;
use crate::runtime::context::Context;
use crate::runtime::scheduler::Scheduler;
use crate::sync::{Spinlock, spin_until};

/// A suspended (or alting) endpoint, published in a channel's end slot.
///
/// The descriptor is owned by the suspended process; the channel borrows
/// it only for the duration of the rendezvous.
pub(crate) struct ChanEnd<T> {
    ctx: NonNull<Context>,
    /// The value slot: `Some` on a sending end, `None` on a receiving end
    /// until the rendezvous moves the value across.
    item: *mut Option<T>,
    /// Present when this end is mediated by an Alt.
    choice: Option<ChoiceRef>,
}

impl<T> ChanEnd<T> {
    pub(crate) fn new(
        ctx: NonNull<Context>,
        item: *mut Option<T>,
        choice: Option<ChoiceRef>,
    ) -> Self {
        Self { ctx, item, choice }
    }
}

/// Which suspended end a completer is finishing on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndVariant {
    Tx,
    Rx,
}

pub(crate) struct ChannelCore<T> {
    splk: Spinlock,
    closed: AtomicBool,

    tx_end: AtomicPtr<ChanEnd<T>>,
    tx_consumed: AtomicBool,

    rx_end: AtomicPtr<ChanEnd<T>>,
    rx_consumed: AtomicBool,

    alt_sync: AltSync,
}

// Safety: the end slots are raw pointers into suspended stacks, handed
// across threads under the protocol documented above; `T: Send` because a
// rendezvous moves values between workers.
unsafe impl<T: Send> Send for ChannelCore<T> {}
// Safety: see above; all shared state is atomic or lock-protected.
unsafe impl<T: Send> Sync for ChannelCore<T> {}

// === impl ChannelCore ===

impl<T> ChannelCore<T> {
    pub(crate) fn new() -> Self {
        Self {
            splk: Spinlock::new(),
            closed: AtomicBool::new(false),
            tx_end: AtomicPtr::new(ptr::null_mut()),
            tx_consumed: AtomicBool::new(false),
            rx_end: AtomicPtr::new(ptr::null_mut()),
            rx_consumed: AtomicBool::new(false),
            alt_sync: AltSync::new(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the channel and wakes any suspended end. Monotonic and
    /// idempotent.
    pub(crate) fn close(&self) {
        let _guard = self.splk.lock();
        self.closed.store(true, Ordering::Release);

        let tx = self.tx_end.swap(ptr::null_mut(), Ordering::AcqRel);
        if !tx.is_null() {
            // Safety: a published end is valid until its owner reschedules.
            let tx = unsafe { &*tx };
            match &tx.choice {
                Some(choice) => choice.maybe_wakeup(),
                // Safety: see above; the claim gate keeps us from waking a
                // timed end its timer already woke.
                None => {
                    if unsafe { tx.ctx.as_ref() }.claim.try_wake() {
                        Scheduler::self_().schedule(tx.ctx);
                    }
                }
            }
        }
        let rx = self.rx_end.swap(ptr::null_mut(), Ordering::AcqRel);
        if !rx.is_null() {
            // Safety: as for the sending end.
            let rx = unsafe { &*rx };
            match &rx.choice {
                Some(choice) => choice.maybe_wakeup(),
                None => {
                    // Safety: see above.
                    if unsafe { rx.ctx.as_ref() }.claim.try_wake() {
                        Scheduler::self_().schedule(rx.ctx);
                    }
                }
            }
        }
    }

    // --- non-alting path ---

    pub(crate) fn send(&self, end: &ChanEnd<T>) -> OpResult {
        debug_assert!(
            self.tx_end.load(Ordering::Relaxed).is_null(),
            "two concurrent senders on one synchronous channel"
        );
        debug_assert!(!self.tx_consumed.load(Ordering::Relaxed));

        let guard = self.splk.lock();
        if self.is_closed() {
            return OpResult::Closed;
        }

        let rx = self.rx_end.swap(ptr::null_mut(), Ordering::AcqRel);
        if !rx.is_null() && self.try_complete_send(rx, end) {
            return OpResult::Ok;
        }

        self.tx_end
            .store(ptr::from_ref(end).cast_mut(), Ordering::Release);
        Scheduler::self_().wait_with_lock(guard);

        if self.tx_consumed.swap(false, Ordering::AcqRel) {
            OpResult::Ok
        } else {
            OpResult::Closed
        }
    }

    pub(crate) fn send_until(&self, end: &ChanEnd<T>, tp: Instant) -> OpResult {
        debug_assert!(self.tx_end.load(Ordering::Relaxed).is_null());
        debug_assert!(!self.tx_consumed.load(Ordering::Relaxed));

        let guard = self.splk.lock();
        if self.is_closed() {
            return OpResult::Closed;
        }

        let rx = self.rx_end.swap(ptr::null_mut(), Ordering::AcqRel);
        if !rx.is_null() && self.try_complete_send(rx, end) {
            return OpResult::Ok;
        }

        // Arm the wake-claim before the end becomes visible: from then on
        // a completer and the sleep timer race on one CAS and only the
        // winner reschedules us.
        // Safety: `end.ctx` is the running context.
        let ctx = unsafe { end.ctx.as_ref() };
        ctx.claim.arm();
        self.tx_end
            .store(ptr::from_ref(end).cast_mut(), Ordering::Release);

        let timed_out = Scheduler::self_().wait_until(tp, guard);

        let guard = self.splk.lock();
        self.tx_end.store(ptr::null_mut(), Ordering::Release);
        ctx.claim.disarm();
        drop(guard);

        if self.tx_consumed.swap(false, Ordering::AcqRel) {
            OpResult::Ok
        } else if timed_out && !self.is_closed() {
            OpResult::Timeout
        } else {
            OpResult::Closed
        }
    }

    /// Completes a send against a parked (or alting) receive end. Returns
    /// `false` when the peer could not be claimed; the slot stays cleared
    /// either way and the loser cleans it up itself.
    fn try_complete_send(&self, rx: *mut ChanEnd<T>, end: &ChanEnd<T>) -> bool {
        // Safety: a published end is valid until its owner reschedules,
        // which only the claim/selection winner may trigger.
        let rx = unsafe { &*rx };
        let won = match &rx.choice {
            Some(choice) => choice.try_select(),
            // Safety: see above.
            None => unsafe { rx.ctx.as_ref() }.claim.try_wake(),
        };
        if won {
            // Safety: both value slots are exclusively borrowed for the
            // rendezvous while the ends are published.
            unsafe { *rx.item = (*end.item).take() };
            self.rx_consumed.store(true, Ordering::Release);
            Scheduler::self_().schedule(rx.ctx);
        }
        won
    }

    pub(crate) fn recv(&self, end: &ChanEnd<T>) -> OpResult {
        debug_assert!(
            self.rx_end.load(Ordering::Relaxed).is_null(),
            "two concurrent receivers on one synchronous channel"
        );
        debug_assert!(!self.rx_consumed.load(Ordering::Relaxed));

        let guard = self.splk.lock();
        if self.is_closed() {
            return OpResult::Closed;
        }

        let tx = self.tx_end.swap(ptr::null_mut(), Ordering::AcqRel);
        if !tx.is_null() && self.try_complete_recv(tx, end) {
            return OpResult::Ok;
        }

        self.rx_end
            .store(ptr::from_ref(end).cast_mut(), Ordering::Release);
        Scheduler::self_().wait_with_lock(guard);

        if self.rx_consumed.swap(false, Ordering::AcqRel) {
            OpResult::Ok
        } else {
            OpResult::Closed
        }
    }

    pub(crate) fn recv_until(&self, end: &ChanEnd<T>, tp: Instant) -> OpResult {
        debug_assert!(self.rx_end.load(Ordering::Relaxed).is_null());
        debug_assert!(!self.rx_consumed.load(Ordering::Relaxed));

        let guard = self.splk.lock();
        if self.is_closed() {
            return OpResult::Closed;
        }

        let tx = self.tx_end.swap(ptr::null_mut(), Ordering::AcqRel);
        if !tx.is_null() && self.try_complete_recv(tx, end) {
            return OpResult::Ok;
        }

        // Safety: `end.ctx` is the running context.
        let ctx = unsafe { end.ctx.as_ref() };
        ctx.claim.arm();
        self.rx_end
            .store(ptr::from_ref(end).cast_mut(), Ordering::Release);

        let timed_out = Scheduler::self_().wait_until(tp, guard);

        let guard = self.splk.lock();
        self.rx_end.store(ptr::null_mut(), Ordering::Release);
        ctx.claim.disarm();
        drop(guard);

        if self.rx_consumed.swap(false, Ordering::AcqRel) {
            OpResult::Ok
        } else if timed_out && !self.is_closed() {
            OpResult::Timeout
        } else {
            OpResult::Closed
        }
    }

    /// Mirror of [`Self::try_complete_send`] for the receiving side.
    fn try_complete_recv(&self, tx: *mut ChanEnd<T>, end: &ChanEnd<T>) -> bool {
        // Safety: as in `try_complete_send`.
        let tx = unsafe { &*tx };
        let won = match &tx.choice {
            Some(choice) => choice.try_select(),
            // Safety: see above.
            None => unsafe { tx.ctx.as_ref() }.claim.try_wake(),
        };
        if won {
            // Safety: see `try_complete_send`.
            unsafe { *end.item = (*tx.item).take() };
            self.tx_consumed.store(true, Ordering::Release);
            Scheduler::self_().schedule(tx.ctx);
        }
        won
    }

    // --- alting path ---

    /// Finishes a rendezvous where exactly one end is suspended outside an
    /// Alt; `variant` names the suspended side to consume and wake.
    fn complete_normal(&self, variant: EndVariant) {
        let tx = self.tx_end.swap(ptr::null_mut(), Ordering::AcqRel);
        let rx = self.rx_end.swap(ptr::null_mut(), Ordering::AcqRel);
        debug_assert!(!tx.is_null() && !rx.is_null());

        // Safety: both ends are published and their owners suspended (or
        // held in their Alt's selection).
        unsafe { *(*rx).item = (*(*tx).item).take() };
        match variant {
            EndVariant::Tx => {
                self.tx_consumed.store(true, Ordering::Release);
                // Safety: see above.
                Scheduler::self_().schedule(unsafe { (*tx).ctx });
            }
            EndVariant::Rx => {
                self.rx_consumed.store(true, Ordering::Release);
                // Safety: see above.
                Scheduler::self_().schedule(unsafe { (*rx).ctx });
            }
        }
    }

    /// Finishes a two-Alt rendezvous on behalf of a spinning offerer.
    ///
    /// Runs without the channel lock on the accepter's fast path: the
    /// offerer holds the lock and is spinning on the sync cell, so nobody
    /// else can touch the end slots.
    fn complete_sync(&self) {
        debug_assert_eq!(self.alt_sync.state(), SyncState::Offered);
        let tx = self.tx_end.swap(ptr::null_mut(), Ordering::AcqRel);
        let rx = self.rx_end.swap(ptr::null_mut(), Ordering::AcqRel);
        debug_assert!(!tx.is_null() && !rx.is_null());

        // Safety: both ends are alting ends pinned by their Alts until the
        // sync cell resolves.
        unsafe { *(*rx).item = (*(*tx).item).take() };
        self.alt_sync.accept();
    }

    pub(crate) fn alt_send_enter(&self, end: *const ChanEnd<T>) {
        debug_assert!(self.tx_end.load(Ordering::Relaxed).is_null());
        debug_assert!(!self.tx_consumed.load(Ordering::Relaxed));
        let _guard = self.splk.lock();
        self.tx_end.store(end.cast_mut(), Ordering::Release);
    }

    pub(crate) fn alt_send_leave(&self) {
        self.alt_sync.retract_offer();
        let _guard = self.splk.lock();
        self.tx_end.store(ptr::null_mut(), Ordering::Release);
        self.tx_consumed.store(false, Ordering::Release);
    }

    pub(crate) fn alt_send_ready(&self) -> bool {
        // No spinlock: a stale answer only costs a retry.
        !self.is_closed() && !self.rx_end.load(Ordering::Acquire).is_null()
    }

    pub(crate) fn alt_recv_enter(&self, end: *const ChanEnd<T>) {
        debug_assert!(self.rx_end.load(Ordering::Relaxed).is_null());
        debug_assert!(!self.rx_consumed.load(Ordering::Relaxed));
        let _guard = self.splk.lock();
        self.rx_end.store(end.cast_mut(), Ordering::Release);
    }

    pub(crate) fn alt_recv_leave(&self) {
        self.alt_sync.retract_offer();
        let _guard = self.splk.lock();
        self.rx_end.store(ptr::null_mut(), Ordering::Release);
        self.rx_consumed.store(false, Ordering::Release);
    }

    pub(crate) fn alt_recv_ready(&self) -> bool {
        !self.is_closed() && !self.tx_end.load(Ordering::Acquire).is_null()
    }

    /// Attempts to complete the alting send whose end is published in this
    /// channel. Called with the owning Alt's lock held, so the channel lock
    /// is only ever tried, never waited on (the reverse order exists in
    /// `try_select`).
    pub(crate) fn alt_send(&self) -> AltResult {
        // Note: our entered end is usually still in `tx_end`, but a
        // concurrent close may already have retracted it; the closed check
        // below fires first in that case.
        let _guard = match self.splk.try_lock() {
            Some(guard) => guard,
            None => {
                // The cell must be inspected before anything else: while it
                // reads `Offered` the peer Alt is the one holding the lock,
                // spinning, which pins both end descriptors in place.
                if self.alt_sync.state() == SyncState::Offered {
                    self.complete_sync();
                    return AltResult::Ok;
                }
                return AltResult::TryLater;
            }
        };

        if self.is_closed() {
            return AltResult::Closed;
        }
        let rx = self.rx_end.load(Ordering::Acquire);
        if rx.is_null() {
            return AltResult::NoEnd;
        }
        // Safety: published ends are valid under the lock.
        let rx = unsafe { &*rx };

        let Some(rx_choice) = &rx.choice else {
            // Plain suspended receiver; the claim gate arbitrates against
            // a concurrent timeout of a timed receive.
            // Safety: see above.
            if unsafe { rx.ctx.as_ref() }.claim.try_wake() {
                self.complete_normal(EndVariant::Rx);
                return AltResult::Ok;
            }
            return AltResult::TryLater;
        };

        let tx = self.tx_end.load(Ordering::Acquire);
        // Safety: our own entered end.
        let tx_choice = unsafe { &*tx }
            .choice
            .as_ref()
            .expect("alting send end without a choice");

        if tx_choice.precedes(rx_choice) {
            self.offer(rx_choice, EndVariant::Rx)
        } else {
            self.accept(rx_choice, EndVariant::Rx)
        }
    }

    /// Mirror of [`Self::alt_send`] for an alting receive.
    pub(crate) fn alt_recv(&self) -> AltResult {
        // See `alt_send` on why the entered end may already be retracted.
        let _guard = match self.splk.try_lock() {
            Some(guard) => guard,
            None => {
                // See `alt_send`: `Offered` means the lock holder is the
                // spinning peer Alt, so the ends cannot move under us.
                if self.alt_sync.state() == SyncState::Offered {
                    self.complete_sync();
                    return AltResult::Ok;
                }
                return AltResult::TryLater;
            }
        };

        if self.is_closed() {
            return AltResult::Closed;
        }
        let tx = self.tx_end.load(Ordering::Acquire);
        if tx.is_null() {
            return AltResult::NoEnd;
        }
        // Safety: published ends are valid under the lock.
        let tx = unsafe { &*tx };

        let Some(tx_choice) = &tx.choice else {
            // Safety: see above.
            if unsafe { tx.ctx.as_ref() }.claim.try_wake() {
                self.complete_normal(EndVariant::Tx);
                return AltResult::Ok;
            }
            return AltResult::TryLater;
        };

        let rx = self.rx_end.load(Ordering::Acquire);
        // Safety: our own entered end.
        let rx_choice = unsafe { &*rx }
            .choice
            .as_ref()
            .expect("alting receive end without a choice");

        if rx_choice.precedes(tx_choice) {
            self.offer(tx_choice, EndVariant::Tx)
        } else {
            self.accept(tx_choice, EndVariant::Tx)
        }
    }

    /// Older-Alt side of a two-Alt rendezvous: offer through the sync cell
    /// (or select the peer directly when it is already parked).
    fn offer(&self, peer: &ChoiceRef, peer_end: EndVariant) -> AltResult {
        match peer.state() {
            AltState::Checking => {
                self.alt_sync.offer();
                // Both exits happen in bounded time: the peer either
                // accepts the offer or finishes its checking phase.
                spin_until(|| {
                    self.alt_sync.state() != SyncState::Offered
                        || peer.state() != AltState::Checking
                });

                if self.alt_sync.take() == SyncState::Accepted {
                    AltResult::Ok
                } else if peer.state() == AltState::Waiting {
                    self.select_parked_peer(peer, peer_end)
                } else {
                    AltResult::SyncFailed
                }
            }
            AltState::Waiting => self.select_parked_peer(peer, peer_end),
            AltState::Done => AltResult::SyncFailed,
        }
    }

    /// Younger-Alt side: take an offer if one is up, otherwise fall back on
    /// the peer's state.
    fn accept(&self, peer: &ChoiceRef, peer_end: EndVariant) -> AltResult {
        match self.alt_sync.state() {
            SyncState::None => match peer.state() {
                AltState::Checking => AltResult::TryLater,
                AltState::Waiting => self.select_parked_peer(peer, peer_end),
                AltState::Done => AltResult::SyncFailed,
            },
            SyncState::Offered => {
                self.complete_sync();
                AltResult::Ok
            }
            SyncState::Accepted => unreachable!("state not recoverable: accepted without offerer"),
        }
    }

    fn select_parked_peer(&self, peer: &ChoiceRef, peer_end: EndVariant) -> AltResult {
        if peer.try_select() {
            self.complete_normal(peer_end);
            AltResult::Ok
        } else {
            AltResult::SelectFailed
        }
    }
}

impl<T> Drop for ChannelCore<T> {
    fn drop(&mut self) {
        debug_assert!(self.tx_end.load(Ordering::Relaxed).is_null());
        debug_assert!(self.rx_end.load(Ordering::Relaxed).is_null());
    }
}

impl<T> core::fmt::Debug for ChannelCore<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("closed", &self.is_closed())
            .field("has_tx", &!self.tx_end.load(Ordering::Relaxed).is_null())
            .field("has_rx", &!self.rx_end.load(Ordering::Relaxed).is_null())
            .finish()
    }
}
