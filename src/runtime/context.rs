// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process contexts.
//!
//! A [`Context`] is the runtime object behind a lightweight process: an
//! owned guarded stack, a saved resume point, an entry closure, and the
//! bookkeeping that lets it sit in scheduler queues, channel end slots and
//! join wait-queues. The main context of each OS thread and the per-worker
//! scheduler context are contexts too; only `Work` contexts own a stack of
//! their own and may migrate between workers.
//!
//! Contexts are reference counted by hand: a [`ContextRef`] is a counted
//! handle, and raw pointers may be parked in queues as long as a count is
//! carried alongside them.

use core::cell::{Cell, UnsafeCell};
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering, fence};
use std::time::Instant;

use cordyceps::{Linked, list, mpsc_queue};

use crate::alt::AltCore;
use crate::runtime::arch;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::stack::{DEFAULT_STACK_SIZE, Stack};
use crate::sync::Spinlock;

/// What role a context plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextKind {
    /// The original stack of an OS thread; pinned to its scheduler.
    Main,
    /// The per-worker scheduler loop; pinned to its scheduler.
    Scheduler,
    /// A user process; owns a stack and may migrate between workers.
    Work,
    /// Queue stub, never run.
    Stub,
}

bitflags::bitflags! {
    /// Which queue a context is currently linked on.
    ///
    /// The three list memberships share one set of intrusive links and are
    /// mutually exclusive; `SLEEP` is the sleep-set membership, which may
    /// overlap with `WORK`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Hooks: u8 {
        const READY = 1 << 0;
        const WORK = 1 << 1;
        const TERMINATED = 1 << 2;
        const SLEEP = 1 << 3;
    }
}

#[derive(Debug)]
pub(crate) struct HookCell(AtomicU8);

impl HookCell {
    const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub(crate) fn insert(&self, hooks: Hooks) {
        debug_assert!(!self.contains(hooks));
        self.0.fetch_or(hooks.bits(), Ordering::Relaxed);
    }

    pub(crate) fn remove(&self, hooks: Hooks) {
        debug_assert!(self.contains(hooks));
        self.0.fetch_and(!hooks.bits(), Ordering::Relaxed);
    }

    pub(crate) fn contains(&self, hooks: Hooks) -> bool {
        Hooks::from_bits_truncate(self.0.load(Ordering::Relaxed)).contains(hooks)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.load(Ordering::Relaxed) == 0
    }
}

/// Resolves the race between the two possible wakers of a timed park.
///
/// A context that parks with a deadline on a channel operation can be woken
/// either by the peer completing the rendezvous or by its scheduler's sleep
/// sweep. Both wakers funnel through one compare-and-set; only the winner
/// may schedule the context.
#[derive(Debug)]
pub(crate) struct ParkClaim(AtomicU8);

impl ParkClaim {
    const DISARMED: u8 = 0;
    const ARMED: u8 = 1;
    const CLAIMED: u8 = 2;

    const fn new() -> Self {
        Self(AtomicU8::new(Self::DISARMED))
    }

    /// Arms the claim before a timed park. Owner only.
    pub(crate) fn arm(&self) {
        debug_assert_eq!(self.0.load(Ordering::Relaxed), Self::DISARMED);
        self.0.store(Self::ARMED, Ordering::Release);
    }

    /// Disarms after the park episode. Owner only, once no waker can still
    /// observe the published channel end.
    pub(crate) fn disarm(&self) {
        self.0.store(Self::DISARMED, Ordering::Release);
    }

    /// Returns whether the caller won the right to wake the context.
    ///
    /// For an untimed park the claim is disarmed and the single possible
    /// waker always wins.
    pub(crate) fn try_wake(&self) -> bool {
        match self.0.load(Ordering::Acquire) {
            Self::DISARMED => true,
            Self::ARMED => self
                .0
                .compare_exchange(Self::ARMED, Self::CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            _ => false,
        }
    }
}

/// Identity of a process, derived from its context address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(NonZeroUsize);

impl core::fmt::Display for Id {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

pub(crate) struct Context {
    /// Intrusive links shared by the ready, work and terminated lists.
    run_links: list::Links<Context>,
    /// Intrusive links for the remote-enqueue inbox.
    inbox_links: mpsc_queue::Links<Context>,

    kind: ContextKind,
    refs: AtomicUsize,

    /// Owned stack; `None` for main, scheduler and stub contexts.
    stack: Option<Stack>,
    /// Saved stack pointer while suspended. Written through a raw pointer
    /// by the context switch.
    sp: UnsafeCell<usize>,
    /// Entry closure, taken exactly once on first resume.
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,

    /// The scheduler this context currently belongs to; null while the
    /// context sits in a steal deque between owners.
    scheduler: AtomicPtr<Scheduler>,

    terminated: AtomicBool,
    pub(crate) hooks: HookCell,
    pub(crate) claim: ParkClaim,

    /// Wake deadline while on the sleep set. Protected by the owning
    /// scheduler's spinlock.
    pub(crate) wake_at: Cell<Option<Instant>>,
    /// The Alt this context is parked in, if any. Owner thread only.
    pub(crate) alt: Cell<Option<NonNull<AltCore>>>,

    /// Protects `waiters` and the terminated transition.
    pub(crate) splk: Spinlock,
    /// Contexts blocked in `join` on this context. Protected by `splk`.
    waiters: UnsafeCell<Vec<ContextRef>>,
}

// Safety: contexts are shared across worker threads by design; every
// mutable field is either atomic, owner-thread-only by protocol, or
// guarded by one of the documented locks.
unsafe impl Send for Context {}
// Safety: see above.
unsafe impl Sync for Context {}

// === impl Context ===

impl Context {
    fn new(kind: ContextKind, stack: Option<Stack>) -> Self {
        // Inbox stub nodes carry specially marked queue links.
        let inbox_links = if matches!(kind, ContextKind::Stub) {
            mpsc_queue::Links::new_stub()
        } else {
            mpsc_queue::Links::new()
        };
        Self {
            run_links: list::Links::new(),
            inbox_links,
            kind,
            refs: AtomicUsize::new(1),
            stack,
            sp: UnsafeCell::new(0),
            entry: UnsafeCell::new(None),
            scheduler: AtomicPtr::new(core::ptr::null_mut()),
            terminated: AtomicBool::new(false),
            hooks: HookCell::new(),
            claim: ParkClaim::new(),
            wake_at: Cell::new(None),
            alt: Cell::new(None),
            splk: Spinlock::new(),
            waiters: UnsafeCell::new(Vec::new()),
        }
    }

    /// The context representing the calling OS thread's original stack.
    pub(crate) fn new_main() -> Box<Self> {
        Box::new(Self::new(ContextKind::Main, None))
    }

    /// The per-worker scheduler context. The entry closure (the scheduler
    /// loop) is installed after the owning scheduler has its final address.
    pub(crate) fn new_scheduler() -> Box<Self> {
        let stack = Stack::new(DEFAULT_STACK_SIZE).expect("failed to allocate scheduler stack");
        Box::new(Self::new(ContextKind::Scheduler, Some(stack)))
    }

    /// A new work context running `entry`, with one reference for the
    /// returned handle.
    pub(crate) fn new_work(entry: Box<dyn FnOnce() + Send>) -> ContextRef {
        let stack = Stack::new(DEFAULT_STACK_SIZE).expect("failed to allocate process stack");
        let top = stack.top();
        let mut ctx = Self::new(ContextKind::Work, Some(stack));
        *ctx.entry.get_mut() = Some(entry);

        let ptr = NonNull::from(Box::leak(Box::new(ctx)));
        // Safety: the stack is fresh and owned by this context.
        let sp = unsafe { arch::init_stack(top, context_entry, ptr.as_ptr() as usize) };
        // Safety: not yet shared.
        unsafe { *ptr.as_ref().sp.get() = sp };
        ContextRef(ptr)
    }

    /// Inbox stub; never run, never linked anywhere else.
    pub(crate) fn new_stub() -> ContextRef {
        ContextRef(NonNull::from(Box::leak(Box::new(Self::new(
            ContextKind::Stub,
            None,
        )))))
    }

    /// Installs the entry closure of a scheduler context.
    pub(crate) fn install_entry(&self, entry: Box<dyn FnOnce() + Send>) {
        debug_assert_eq!(self.kind, ContextKind::Scheduler);
        // Safety: called once during scheduler construction, before the
        // context is ever resumed.
        unsafe { *self.entry.get() = Some(entry) };
        let top = self
            .stack
            .as_ref()
            .expect("scheduler context owns a stack")
            .top();
        // Safety: fresh stack owned by this context.
        let sp =
            unsafe { arch::init_stack(top, context_entry, core::ptr::from_ref(self) as usize) };
        // Safety: see above, not yet shared.
        unsafe { *self.sp.get() = sp };
    }

    pub(crate) fn id(&self) -> Id {
        // Safety: a reference is never null.
        Id(unsafe { NonZeroUsize::new_unchecked(core::ptr::from_ref(self) as usize) })
    }

    pub(crate) fn kind(&self) -> ContextKind {
        self.kind
    }

    pub(crate) fn is_work(&self) -> bool {
        self.kind == ContextKind::Work
    }

    pub(crate) fn sp_slot(&self) -> *mut usize {
        self.sp.get()
    }

    pub(crate) fn saved_sp(&self) -> usize {
        // Safety: only read by the scheduler that is about to resume this
        // context, which has exclusive resume rights.
        unsafe { *self.sp.get() }
    }

    pub(crate) fn scheduler(&self) -> Option<NonNull<Scheduler>> {
        NonNull::new(self.scheduler.load(Ordering::Acquire))
    }

    pub(crate) fn set_scheduler(&self, scheduler: Option<&Scheduler>) {
        let ptr = scheduler.map_or(core::ptr::null_mut(), |s| {
            core::ptr::from_ref(s).cast_mut()
        });
        self.scheduler.store(ptr, Ordering::Release);
    }

    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub(crate) fn has_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Appends a joiner. Caller holds `splk`.
    pub(crate) fn push_waiter(&self, waiter: ContextRef) {
        // Safety: guarded by `splk`.
        unsafe { (*self.waiters.get()).push(waiter) };
    }

    /// Drains the join wait-queue. Caller holds `splk`.
    pub(crate) fn take_waiters(&self) -> Vec<ContextRef> {
        // Safety: guarded by `splk`.
        unsafe { core::mem::take(&mut *self.waiters.get()) }
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish()
    }
}

/// Entry point of every stackful context; `arg` is the context pointer.
unsafe extern "C" fn context_entry(arg: usize) -> ! {
    // The first action on a fresh stack is completing the switch that got
    // us here (scheduling the previous context, releasing a handed-over
    // lock).
    Scheduler::self_().finish_switch();

    let ctx = arg as *mut Context;
    // Safety: installed before the context was first scheduled, taken once.
    let entry = unsafe { (*(*ctx).entry.get()).take() };
    let entry = entry.expect("context resumed without an entry closure");

    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)).is_err() {
        // A process unwinding into the trampoline would fall off its own
        // stack; treat process panics as fatal.
        tracing::error!("process panicked; aborting");
        std::process::abort();
    }

    Scheduler::self_().terminate_running()
}

/// A counted handle on a [`Context`].
pub(crate) struct ContextRef(NonNull<Context>);

// Safety: the refcount is atomic and `Context` is `Send + Sync`.
unsafe impl Send for ContextRef {}
// Safety: see above.
unsafe impl Sync for ContextRef {}

// === impl ContextRef ===

impl ContextRef {
    /// Wraps `ptr`, taking one count on it.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live context.
    pub(crate) unsafe fn clone_raw(ptr: NonNull<Context>) -> Self {
        // Safety: ensured by caller.
        unsafe { ptr.as_ref() }.refs.fetch_add(1, Ordering::Relaxed);
        Self(ptr)
    }

    pub(crate) fn as_ptr(&self) -> NonNull<Context> {
        self.0
    }

    /// Consumes the handle without dropping its count; pair with
    /// [`ContextRef::from_raw`].
    pub(crate) fn into_raw(self) -> NonNull<Context> {
        let ptr = self.0;
        core::mem::forget(self);
        ptr
    }

    /// Adopts a count previously leaked by [`ContextRef::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must carry exactly one leaked count.
    pub(crate) unsafe fn from_raw(ptr: NonNull<Context>) -> Self {
        Self(ptr)
    }
}

impl core::ops::Deref for ContextRef {
    type Target = Context;

    fn deref(&self) -> &Context {
        // Safety: the handle holds a count, so the context is alive.
        unsafe { self.0.as_ref() }
    }
}

impl Clone for ContextRef {
    fn clone(&self) -> Self {
        // Safety: we hold a count already.
        unsafe { Self::clone_raw(self.0) }
    }
}

impl Drop for ContextRef {
    fn drop(&mut self) {
        // Safety: the handle holds a count.
        if unsafe { self.0.as_ref() }.refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            debug_assert!(unsafe { self.0.as_ref() }.hooks.is_empty());
            // Safety: last count gone; the context was allocated by `Box`.
            drop(unsafe { Box::from_raw(self.0.as_ptr()) });
        }
    }
}

impl core::fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        (**self).fmt(f)
    }
}

// Safety: `run_links` is a field of `Context`; handles carry a count.
unsafe impl Linked<list::Links<Context>> for Context {
    type Handle = ContextRef;

    fn into_ptr(handle: ContextRef) -> NonNull<Context> {
        handle.into_raw()
    }

    unsafe fn from_ptr(ptr: NonNull<Context>) -> ContextRef {
        // Safety: the list carried the count `into_ptr` leaked.
        unsafe { ContextRef::from_raw(ptr) }
    }

    unsafe fn links(target: NonNull<Context>) -> NonNull<list::Links<Context>> {
        // Safety: `target` is a live context.
        let links = unsafe { &raw mut (*target.as_ptr()).run_links };
        // Safety: field of a live allocation.
        unsafe { NonNull::new_unchecked(links) }
    }
}

// Safety: `inbox_links` is a field of `Context`; handles carry a count.
unsafe impl Linked<mpsc_queue::Links<Context>> for Context {
    type Handle = ContextRef;

    fn into_ptr(handle: ContextRef) -> NonNull<Context> {
        handle.into_raw()
    }

    unsafe fn from_ptr(ptr: NonNull<Context>) -> ContextRef {
        // Safety: the queue carried the count `into_ptr` leaked.
        unsafe { ContextRef::from_raw(ptr) }
    }

    unsafe fn links(target: NonNull<Context>) -> NonNull<mpsc_queue::Links<Context>> {
        // Safety: `target` is a live context.
        let links = unsafe { &raw mut (*target.as_ptr()).inbox_links };
        // Safety: field of a live allocation.
        unsafe { NonNull::new_unchecked(links) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcounting() {
        let ctx = Context::new_stub();
        let ptr = ctx.as_ptr();
        // Safety: `ctx` keeps the context alive.
        let extra = unsafe { ContextRef::clone_raw(ptr) };
        assert_eq!(extra.refs.load(Ordering::Relaxed), 2);
        drop(extra);
        assert_eq!(ctx.refs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn park_claim_single_winner() {
        let claim = ParkClaim::new();
        claim.arm();
        assert!(claim.try_wake());
        assert!(!claim.try_wake());
        claim.disarm();
        // Untimed parks always let the one waker through.
        assert!(claim.try_wake());
    }
}
