// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization state shared between an [`Alt`](crate::alt::Alt) and
//! the channels its choices are entered on.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::time::Instant;

use crate::runtime::context::Context;
use crate::runtime::scheduler::Scheduler;
use crate::sync::Spinlock;

/// Internal result of one attempt to complete a choice.
///
/// These drive the selection retry loop and never escape the Alt engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AltResult {
    Ok,
    TryLater,
    SyncFailed,
    SelectFailed,
    NoEnd,
    Closed,
}

/// Phase of a selecting Alt, as observed by channel peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum AltState {
    /// The enable/ready/try-complete loop is running (and holds the Alt
    /// lock).
    Checking = 0,
    /// Parked, waiting for any choice to fire.
    Waiting = 1,
    /// A winner was committed (or the Alt is being torn down).
    Done = 2,
}

impl AltState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Checking,
            1 => Self::Waiting,
            2 => Self::Done,
            _ => unreachable!("state not recoverable: invalid alt state"),
        }
    }
}

/// State of a channel's two-Alt rendezvous cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SyncState {
    None = 0,
    /// The older Alt has published a rendezvous offer and is spinning.
    Offered = 1,
    /// The younger Alt completed the transfer on the offerer's behalf.
    Accepted = 2,
}

impl SyncState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Offered,
            2 => Self::Accepted,
            _ => unreachable!("state not recoverable: invalid sync state"),
        }
    }
}

/// The per-channel sync cell.
#[derive(Debug)]
pub(crate) struct AltSync(AtomicU8);

// === impl AltSync ===

impl AltSync {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(SyncState::None as u8))
    }

    pub(crate) fn state(&self) -> SyncState {
        SyncState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn offer(&self) {
        self.0.store(SyncState::Offered as u8, Ordering::Release);
    }

    pub(crate) fn accept(&self) {
        debug_assert_eq!(self.state(), SyncState::Offered);
        self.0.store(SyncState::Accepted as u8, Ordering::Release);
    }

    /// Clears the cell, returning what it held.
    pub(crate) fn take(&self) -> SyncState {
        SyncState::from_u8(self.0.swap(SyncState::None as u8, Ordering::AcqRel))
    }

    /// Withdraws a dangling offer, leaving any other state untouched.
    pub(crate) fn retract_offer(&self) {
        let _ = self.0.compare_exchange(
            SyncState::Offered as u8,
            SyncState::None as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

/// The part of a selecting Alt that channels and the scheduler interact
/// with. Lives on the stack of `select()`, which outlives every published
/// choice end.
pub(crate) struct AltCore {
    state: AtomicU8,
    splk: Spinlock,
    /// The atomic commit point: first test-and-set wins the selection.
    select_flag: AtomicBool,
    /// Token of the winning choice; written once by the flag winner.
    selected: AtomicPtr<()>,
    /// Set by a closing channel that could not take the lock; the select
    /// loop re-checks it before parking.
    disturbed: AtomicBool,
    ctx: NonNull<Context>,
    /// Construction time of the Alt; the priority rule orders two alting
    /// peers by `(birth, address)`.
    birth: Instant,
}

// === impl AltCore ===

impl AltCore {
    pub(crate) fn new(ctx: NonNull<Context>, birth: Instant) -> Self {
        Self {
            state: AtomicU8::new(AltState::Checking as u8),
            splk: Spinlock::new(),
            select_flag: AtomicBool::new(false),
            selected: AtomicPtr::new(core::ptr::null_mut()),
            disturbed: AtomicBool::new(false),
            ctx,
            birth,
        }
    }

    pub(crate) fn splk(&self) -> &Spinlock {
        &self.splk
    }

    pub(crate) fn ctx(&self) -> NonNull<Context> {
        self.ctx
    }

    pub(crate) fn birth(&self) -> Instant {
        self.birth
    }

    pub(crate) fn state(&self) -> AltState {
        AltState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: AltState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Commits `token` from the selecting process itself, which already
    /// holds the Alt lock.
    pub(crate) fn commit_local(&self, token: NonNull<()>) {
        let taken = self.select_flag.swap(true, Ordering::AcqRel);
        debug_assert!(!taken, "local commit raced another selection");
        self.selected.store(token.as_ptr(), Ordering::Release);
    }

    /// Attempts to commit `token` on behalf of a channel peer. The winner
    /// is responsible for waking the alting process (channels do this by
    /// scheduling the context after moving the value).
    ///
    /// Taking the lock forces external completers to wait until the
    /// selecting process has either committed or parked.
    pub(crate) fn try_select(&self, token: NonNull<()>) -> bool {
        let _guard = self.splk.lock();
        if self.select_flag.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.selected.store(token.as_ptr(), Ordering::Release);
        true
    }

    /// Attempts to win the selection for the timeout path; called by the
    /// sleep sweep when the Alt's deadline expires. The caller schedules
    /// the context on success.
    pub(crate) fn try_timeout(&self) -> bool {
        let _guard = self.splk.lock();
        !self.select_flag.swap(true, Ordering::AcqRel)
    }

    /// Wakes a parked Alt whose channel just closed, without selecting
    /// anything; the woken select loop re-evaluates its choices.
    ///
    /// Uses `try_lock`: the caller holds a channel lock, and waiting for
    /// the Alt lock here can deadlock through the offer-spin of a two-Alt
    /// rendezvous. When the lock is contended the selecting process is
    /// still awake, so marking the Alt disturbed is enough: it re-checks
    /// the flag under its lock before parking.
    pub(crate) fn maybe_wakeup(&self) {
        match self.splk.try_lock() {
            Some(_guard) => {
                if self.state() == AltState::Waiting
                    && !self.select_flag.swap(true, Ordering::AcqRel)
                {
                    Scheduler::self_().schedule(self.ctx);
                }
            }
            None => self.disturbed.store(true, Ordering::Release),
        }
    }

    /// Consumes the disturbed flag. Caller holds the Alt lock.
    pub(crate) fn take_disturbed(&self) -> bool {
        self.disturbed.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn selected(&self) -> Option<NonNull<()>> {
        NonNull::new(self.selected.load(Ordering::Acquire))
    }

    /// Re-arms the selection after a wake that selected nothing (a closed
    /// channel woke us before any peer committed). Caller holds the Alt
    /// lock.
    pub(crate) fn rearm(&self) {
        debug_assert!(self.selected().is_none());
        self.set_state(AltState::Checking);
        self.select_flag.store(false, Ordering::Release);
    }
}

impl core::fmt::Debug for AltCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AltCore")
            .field("state", &self.state())
            .field("selected", &self.selected())
            .finish()
    }
}

/// A channel-facing reference to one choice of a selecting Alt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChoiceRef {
    alt: NonNull<AltCore>,
    token: NonNull<()>,
}

// === impl ChoiceRef ===

impl ChoiceRef {
    pub(crate) fn new(alt: NonNull<AltCore>, token: NonNull<()>) -> Self {
        Self { alt, token }
    }

    fn alt(&self) -> &AltCore {
        // Safety: an alting end is published only between enter() and
        // leave(), and the AltCore outlives both.
        unsafe { self.alt.as_ref() }
    }

    pub(crate) fn state(&self) -> AltState {
        self.alt().state()
    }

    pub(crate) fn try_select(&self) -> bool {
        self.alt().try_select(self.token)
    }

    pub(crate) fn maybe_wakeup(&self) {
        self.alt().maybe_wakeup();
    }

    /// The priority rule: the choice of the older Alt (by construction
    /// time, then address) precedes, making its side the offerer in a
    /// two-Alt rendezvous.
    pub(crate) fn precedes(&self, other: &ChoiceRef) -> bool {
        let a = (self.alt().birth(), self.alt.as_ptr() as usize);
        let b = (other.alt().birth(), other.alt.as_ptr() as usize);
        a < b
    }
}
