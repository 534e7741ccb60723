// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The sending endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use static_assertions::assert_not_impl_any;

use crate::channel::state::{ChanEnd, ChannelCore};
use crate::channel::{ChanId, OpResult};
use crate::runtime::scheduler::Scheduler;

/// The sending half of a channel.
///
/// Move-only: exactly one process owns a `Tx` at any time. Dropping it
/// closes the channel.
#[derive(Debug)]
pub struct Tx<T: Send> {
    chan: Arc<ChannelCore<T>>,
}

assert_not_impl_any!(Tx<u32>: Clone, Copy);

// === impl Tx ===

impl<T: Send> Tx<T> {
    pub(crate) fn new(chan: Arc<ChannelCore<T>>) -> Self {
        Self { chan }
    }

    pub(crate) fn id(&self) -> ChanId {
        ChanId::of(&self.chan)
    }

    pub(crate) fn core(&self) -> &ChannelCore<T> {
        &self.chan
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    /// Closes the channel, waking a suspended peer with
    /// [`OpResult::Closed`].
    pub fn close(&self) {
        self.chan.close();
    }

    /// Sends `item`, suspending until a receiver takes it.
    ///
    /// Returns [`OpResult::Closed`] (dropping the item) if the channel is
    /// or becomes closed before the rendezvous.
    pub fn send(&self, item: T) -> OpResult {
        let mut slot = Some(item);
        let end = ChanEnd::new(Scheduler::running(), &raw mut slot, None);
        self.chan.send(&end)
    }

    /// Like [`Tx::send`], giving up with [`OpResult::Timeout`] at `tp`.
    pub fn send_until(&self, item: T, tp: Instant) -> OpResult {
        let mut slot = Some(item);
        let end = ChanEnd::new(Scheduler::running(), &raw mut slot, None);
        self.chan.send_until(&end, tp)
    }

    /// Like [`Tx::send`], giving up with [`OpResult::Timeout`] after
    /// `duration`.
    pub fn send_for(&self, item: T, duration: Duration) -> OpResult {
        self.send_until(item, Instant::now() + duration)
    }
}

impl<T: Send> Drop for Tx<T> {
    fn drop(&mut self) {
        self.chan.close();
    }
}
