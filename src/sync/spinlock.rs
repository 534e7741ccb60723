// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An adaptive spinlock.
//!
//! Every channel, every [`Alt`](crate::alt::Alt) and every context's join
//! queue is protected by one of these. Critical sections are short (a few
//! pointer exchanges), so a full mutex is overkill, but plain test-and-set
//! spinning degrades badly once two workers hammer the same channel. The
//! lock therefore adapts: it remembers an exponential moving average of how
//! long recent acquisitions had to spin and bounds the busy-wait phase by
//! it, falling back to `thread::yield_now` past the bound. A failed
//! test-and-set backs off for a randomized, exponentially growing number of
//! pause iterations so colliding workers de-synchronize.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use crate::sync::Backoff;

/// Upper bound for the busy-wait phase of a single acquisition attempt.
const MAX_TESTS: usize = 100;

/// Cap for the collision backoff exponent.
const MAX_COLLISION_EXP: u32 = 16;

pub(crate) struct Spinlock {
    locked: AtomicBool,
    /// EMA of the spin counts of recent successful acquisitions.
    prev_tests: AtomicUsize,
}

#[must_use = "the lock is released when the guard is dropped"]
pub(crate) struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

// === impl Spinlock ===

impl Spinlock {
    pub(crate) const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            prev_tests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock(&self) -> SpinlockGuard<'_> {
        let mut collisions: u32 = 0;

        loop {
            let mut tests: usize = 0;
            let prev = self.prev_tests.load(Ordering::Relaxed);
            let max_tests = MAX_TESTS.min(2 * prev + 10);

            while self.locked.load(Ordering::Relaxed) {
                tests += 1;
                if tests < max_tests {
                    core::hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }

            if self.locked.swap(true, Ordering::Acquire) {
                // Lost the race against another acquirer. Randomized
                // exponential backoff so the losers don't retry in lockstep.
                let ceil = 1_usize << collisions.min(MAX_COLLISION_EXP);
                for _ in 0..fastrand::usize(..ceil) {
                    core::hint::spin_loop();
                }
                collisions += 1;
            } else {
                let delta = (tests as isize - prev as isize) / 8;
                let next = (prev as isize + delta).max(0) as usize;
                self.prev_tests.store(next, Ordering::Relaxed);
                return SpinlockGuard { lock: self };
            }
        }
    }

    pub(crate) fn try_lock(&self) -> Option<SpinlockGuard<'_>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    /// Releases the lock without a guard.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock, either through a forgotten guard (see
    /// [`SpinlockGuard::into_raw`]) or because the lock was handed over by
    /// the safe-park protocol.
    pub(crate) unsafe fn raw_unlock(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
    }
}

impl core::fmt::Debug for Spinlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Spinlock")
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish()
    }
}

// === impl SpinlockGuard ===

impl<'a> SpinlockGuard<'a> {
    /// Disarms the guard and returns the lock it was holding, still locked.
    ///
    /// This is the entry point of the safe-park protocol: a context that
    /// must suspend while holding a channel or join lock forgets its guard
    /// and leaves the raw lock in the switch payload; whoever runs next
    /// releases it with [`Spinlock::raw_unlock`] *after* the switch has
    /// completed.
    pub(crate) fn into_raw(self) -> &'a Spinlock {
        let lock = self.lock;
        core::mem::forget(self);
        lock
    }
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        // Safety: the guard proves we hold the lock.
        unsafe { self.lock.raw_unlock() }
    }
}

impl core::fmt::Debug for SpinlockGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.pad("SpinlockGuard")
    }
}

/// Spins until `cond` holds, backing off adaptively.
///
/// Used by the two-party Alt synchronization where one side must wait for
/// the peer to either accept an offered rendezvous or leave its checking
/// phase; both transitions happen in bounded time.
pub(crate) fn spin_until(mut cond: impl FnMut() -> bool) {
    let mut backoff = Backoff::new();
    while !cond() {
        backoff.spin();
    }
}
