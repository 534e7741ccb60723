// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Send and receive choices.
//!
//! A choice owns its value slot and its channel-end descriptor, both kept
//! behind `UnsafeCell` because the channel writes through raw pointers to
//! them while the choice is entered. Choices are boxed by the builder, so
//! their addresses are stable from the moment `select()` starts; the box's
//! data pointer doubles as the selection token.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::alt::sync::{AltCore, AltResult, ChoiceRef};
use crate::channel::{ChanEnd, Rx, Tx};

/// One alternative of an [`Alt`](crate::alt::Alt).
pub(crate) trait ChoiceDyn {
    /// Publishes this choice's end in its channel.
    fn enter(&self, alt: NonNull<AltCore>, token: NonNull<()>);

    /// Retracts the end published by [`ChoiceDyn::enter`].
    fn leave(&self);

    /// Whether the peer side is present and the channel open. Racy by
    /// design; a stale answer costs one retry.
    fn is_ready(&self) -> bool;

    /// Attempts to complete the operation.
    fn try_complete(&self) -> AltResult;

    /// Runs the winning callback.
    fn run(&mut self);
}

pub(crate) struct ChoiceSend<'a, T: Send> {
    tx: &'a Tx<T>,
    item: UnsafeCell<Option<T>>,
    end: UnsafeCell<Option<ChanEnd<T>>>,
    func: Option<Box<dyn FnOnce() + 'a>>,
}

// === impl ChoiceSend ===

impl<'a, T: Send> ChoiceSend<'a, T> {
    pub(crate) fn new(tx: &'a Tx<T>, item: T, func: Box<dyn FnOnce() + 'a>) -> Self {
        Self {
            tx,
            item: UnsafeCell::new(Some(item)),
            end: UnsafeCell::new(None),
            func: Some(func),
        }
    }
}

impl<T: Send> ChoiceDyn for ChoiceSend<'_, T> {
    fn enter(&self, alt: NonNull<AltCore>, token: NonNull<()>) {
        // Safety: the AltCore outlives the entered phase.
        let ctx = unsafe { alt.as_ref() }.ctx();
        let end = ChanEnd::new(ctx, self.item.get(), Some(ChoiceRef::new(alt, token)));
        // Safety: `end` is only rebuilt while unpublished.
        let end_ptr = unsafe {
            let slot = &mut *self.end.get();
            *slot = Some(end);
            core::ptr::from_ref(slot.as_ref().expect("just stored"))
        };
        self.tx.core().alt_send_enter(end_ptr);
    }

    fn leave(&self) {
        self.tx.core().alt_send_leave();
    }

    fn is_ready(&self) -> bool {
        self.tx.core().alt_send_ready()
    }

    fn try_complete(&self) -> AltResult {
        self.tx.core().alt_send()
    }

    fn run(&mut self) {
        if let Some(func) = self.func.take() {
            func();
        }
    }
}

pub(crate) struct ChoiceRecv<'a, T: Send> {
    rx: &'a Rx<T>,
    item: UnsafeCell<Option<T>>,
    end: UnsafeCell<Option<ChanEnd<T>>>,
    func: Option<Box<dyn FnOnce(T) + 'a>>,
}

// === impl ChoiceRecv ===

impl<'a, T: Send> ChoiceRecv<'a, T> {
    pub(crate) fn new(rx: &'a Rx<T>, func: Box<dyn FnOnce(T) + 'a>) -> Self {
        Self {
            rx,
            item: UnsafeCell::new(None),
            end: UnsafeCell::new(None),
            func: Some(func),
        }
    }
}

impl<T: Send> ChoiceDyn for ChoiceRecv<'_, T> {
    fn enter(&self, alt: NonNull<AltCore>, token: NonNull<()>) {
        // Safety: the AltCore outlives the entered phase.
        let ctx = unsafe { alt.as_ref() }.ctx();
        let end = ChanEnd::new(ctx, self.item.get(), Some(ChoiceRef::new(alt, token)));
        // Safety: `end` is only rebuilt while unpublished.
        let end_ptr = unsafe {
            let slot = &mut *self.end.get();
            *slot = Some(end);
            core::ptr::from_ref(slot.as_ref().expect("just stored"))
        };
        self.rx.core().alt_recv_enter(end_ptr);
    }

    fn leave(&self) {
        self.rx.core().alt_recv_leave();
    }

    fn is_ready(&self) -> bool {
        self.rx.core().alt_recv_ready()
    }

    fn try_complete(&self) -> AltResult {
        self.rx.core().alt_recv()
    }

    fn run(&mut self) {
        // Safety: `run` is called after `leave`, so the channel no longer
        // writes through the slot.
        let item = unsafe { (*self.item.get()).take() };
        let item = item.expect("selected receive choice without a value");
        if let Some(func) = self.func.take() {
            func(item);
        }
    }
}
