// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The receiving endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use static_assertions::assert_not_impl_any;

use crate::channel::state::{ChanEnd, ChannelCore};
use crate::channel::{ChanId, OpResult};
use crate::runtime::scheduler::Scheduler;

/// The receiving half of a channel.
///
/// Move-only: exactly one process owns an `Rx` at any time. Dropping it
/// closes the channel.
#[derive(Debug)]
pub struct Rx<T: Send> {
    chan: Arc<ChannelCore<T>>,
}

assert_not_impl_any!(Rx<u32>: Clone, Copy);

// === impl Rx ===

impl<T: Send> Rx<T> {
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

    /// Receives a value, suspending until a sender provides one.
    ///
    /// The `Err` value is never [`OpResult::Ok`].
    pub fn recv(&self) -> Result<T, OpResult> {
        let mut slot: Option<T> = None;
        let end = ChanEnd::new(Scheduler::running(), &raw mut slot, None);
        match self.chan.recv(&end) {
            OpResult::Ok => Ok(slot.take().expect("rendezvous completed without a value")),
            err => Err(err),
        }
    }

    /// Like [`Rx::recv`], giving up with [`OpResult::Timeout`] at `tp`.
    pub fn recv_until(&self, tp: Instant) -> Result<T, OpResult> {
        let mut slot: Option<T> = None;
        let end = ChanEnd::new(Scheduler::running(), &raw mut slot, None);
        match self.chan.recv_until(&end, tp) {
            OpResult::Ok => Ok(slot.take().expect("rendezvous completed without a value")),
            err => Err(err),
        }
    }

    /// Like [`Rx::recv`], giving up with [`OpResult::Timeout`] after
    /// `duration`.
    pub fn recv_for(&self, duration: Duration) -> Result<T, OpResult> {
        self.recv_until(Instant::now() + duration)
    }

    /// A lazy iterator of received values, ending when the channel closes.
    pub fn iter(&self) -> RecvIter<'_, T> {
        RecvIter { rx: self }
    }
}

impl<T: Send> Drop for Rx<T> {
    fn drop(&mut self) {
        self.chan.close();
    }
}

impl<'a, T: Send> IntoIterator for &'a Rx<T> {
    type Item = T;
    type IntoIter = RecvIter<'a, T>;

    fn into_iter(self) -> RecvIter<'a, T> {
        self.iter()
    }
}

/// Iterator returned by [`Rx::iter`].
#[derive(Debug)]
pub struct RecvIter<'a, T: Send> {
    rx: &'a Rx<T>,
}

impl<T: Send> Iterator for RecvIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv().ok()
    }
}
