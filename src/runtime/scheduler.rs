// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-worker scheduler.
//!
//! Every OS thread that touches the runtime owns exactly one `Scheduler`,
//! reachable through a thread-local. A scheduler multiplexes any number of
//! work contexts onto its thread: the *main* context (the thread's original
//! stack) and the *scheduler* context (the run loop below) are pinned, work
//! contexts are dynamic and may be stolen by other workers.
//!
//! There is exactly one running context per scheduler at any time, and a
//! running context is never simultaneously linked on any queue.
//!
//! ## The safe-park protocol
//!
//! A context that blocks while holding a spinlock (a channel about to
//! publish a stack-resident end descriptor, a context about to terminate)
//! cannot release the lock before switching away: a peer on another worker
//! could complete the rendezvous and reschedule it while its register state
//! is still being saved. Instead the suspender records the lock (and,
//! for a yield, the context to re-enqueue) in the worker's switch payload;
//! whichever context runs next resolves the payload as its very first
//! action, after the switch has completed.

use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::BTreeMap;
use std::time::Instant;

use cordyceps::{List, MpscQueue};

use crate::alt::AltCore;
use crate::runtime::context::{Context, ContextRef, Hooks, Id};
use crate::runtime::policy::{self, Policy};
use crate::sync::{Spinlock, SpinlockGuard};

std::thread_local! {
    static CURRENT: Cell<Option<&'static Scheduler>> = const { Cell::new(None) };
}

/// Deferred actions resolved on the far side of a context switch.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SwitchPayload {
    /// Re-enqueue this context once the switch is complete.
    wake: Option<NonNull<Context>>,
    /// Release this lock once the switch is complete.
    release: Option<NonNull<Spinlock>>,
}

impl SwitchPayload {
    pub(crate) fn waking(ctx: NonNull<Context>) -> Self {
        Self {
            wake: Some(ctx),
            release: None,
        }
    }

    pub(crate) fn releasing(lock: &Spinlock) -> Self {
        Self {
            wake: None,
            release: Some(NonNull::from(lock)),
        }
    }
}

pub(crate) struct Scheduler {
    pub(crate) policy: Policy,

    main: Box<Context>,
    sched: Box<Context>,
    /// The context currently executing on this worker.
    running: Cell<NonNull<Context>>,
    /// Payload of the in-flight context switch.
    payload: Cell<SwitchPayload>,

    /// Guards `sleepers` and `terminated`.
    splk: Spinlock,
    /// All work contexts attached to this worker.
    work: UnsafeCell<List<Context>>,
    /// Contexts parked with a deadline, ordered by wake time.
    sleepers: UnsafeCell<BTreeMap<(Instant, Id), NonNull<Context>>>,
    /// Terminated contexts awaiting release by the run loop.
    terminated: UnsafeCell<List<Context>>,

    /// Remote-enqueue inbox; foreign workers push, the run loop drains.
    inbox: MpscQueue<Context>,
    exit: AtomicBool,
}

// Safety: the inbox, parker and exit flag are the only fields touched from
// other threads and are thread-safe; everything else is owner-thread-only
// or guarded by `splk` as documented per field.
unsafe impl Sync for Scheduler {}

// === impl Scheduler ===

impl Scheduler {
    /// The calling thread's scheduler, bootstrapping it (and, process-wide
    /// once, the worker pool) on first use.
    ///
    /// Deliberately not inlined: a work context may resume on a different
    /// OS thread than the one it suspended on, so the thread-local lookup
    /// must never be cached across a context switch.
    #[inline(never)]
    pub(crate) fn self_() -> &'static Scheduler {
        CURRENT.with(|current| match current.get() {
            Some(sched) => sched,
            None => {
                let sched = policy::bootstrap();
                current.set(Some(sched));
                sched
            }
        })
    }

    /// The currently running context. Never null while user code runs.
    pub(crate) fn running() -> NonNull<Context> {
        Self::self_().running.get()
    }

    /// Allocates and leaks a scheduler for the calling thread.
    pub(crate) fn leak_new(is_pool_worker: bool) -> &'static Scheduler {
        let sched: &'static mut Scheduler = Box::leak(Box::new(Scheduler {
            policy: Policy::new(is_pool_worker),
            main: Context::new_main(),
            sched: Context::new_scheduler(),
            running: Cell::new(NonNull::dangling()),
            payload: Cell::new(SwitchPayload::default()),
            splk: Spinlock::new(),
            work: UnsafeCell::new(List::new()),
            sleepers: UnsafeCell::new(BTreeMap::new()),
            terminated: UnsafeCell::new(List::new()),
            inbox: MpscQueue::new_with_stub(Context::new_stub()),
            exit: AtomicBool::new(false),
        }));
        let this: &'static Scheduler = sched;

        this.main.set_scheduler(Some(this));
        this.sched.set_scheduler(Some(this));
        this.running.set(NonNull::from(&*this.main));
        this.sched.install_entry(Box::new(move || this.run()));
        // The scheduler context starts out ready, so the first time the
        // main context blocks it resumes straight into the run loop.
        this.schedule_local(NonNull::from(&*this.sched));
        this
    }

    pub(crate) fn is_pool_worker(&self) -> bool {
        self.policy.is_pool_worker()
    }

    // --- switching ---

    /// Switches to `next`, leaving `payload` for it to resolve.
    fn resume_to(&self, next: NonNull<Context>, payload: SwitchPayload) {
        // Safety: `next` is a live context this scheduler has exclusive
        // resume rights to.
        let next_ref = unsafe { next.as_ref() };
        debug_assert!(!next_ref.hooks.contains(Hooks::READY));
        debug_assert!(!next_ref.hooks.contains(Hooks::SLEEP));
        debug_assert!(!next_ref.hooks.contains(Hooks::TERMINATED));

        let prev = self.running.replace(next);
        self.payload.set(payload);

        let to = next_ref.saved_sp();
        debug_assert_ne!(to, 0, "resuming a context that was never suspended");
        // Safety: `prev` is the currently executing context, so its sp slot
        // is ours to write; `to` is a valid suspended stack pointer.
        unsafe {
            let from = prev.as_ref().sp_slot();
            crate::runtime::arch::switch(from, to);
        }

        // We have been resumed, possibly on a different OS thread; the
        // thread-local must be re-fetched, never reused.
        Scheduler::self_().finish_switch();
    }

    /// Resolves the pending switch payload. Called as the first action of
    /// every freshly resumed context.
    pub(crate) fn finish_switch(&self) {
        let payload = self.payload.replace(SwitchPayload::default());
        if let Some(ctx) = payload.wake {
            self.schedule(ctx);
        }
        if let Some(lock) = payload.release {
            // Safety: the suspender forgot its guard and handed the lock to
            // us through the payload.
            unsafe { lock.as_ref().raw_unlock() };
        }
    }

    /// Parks the running context and resumes the next runnable one.
    fn park(&self, payload: SwitchPayload) {
        let next = self
            .policy
            .pick_next(self)
            .expect("a parking context always leaves the scheduler context runnable");
        self.resume_to(next, payload);
    }

    // --- blocking operations ---

    /// Blocks the running context indefinitely.
    pub(crate) fn wait(&self) {
        self.park(SwitchPayload::default());
    }

    /// Blocks the running context, releasing `guard` at the safe-park
    /// point.
    pub(crate) fn wait_with_lock(&self, guard: SpinlockGuard<'_>) {
        self.park(SwitchPayload::releasing(guard.into_raw()));
    }

    /// Blocks the running context until `tp`, releasing `guard` at the
    /// safe-park point. Returns whether the deadline elapsed.
    pub(crate) fn wait_until(&self, tp: Instant, guard: SpinlockGuard<'_>) -> bool {
        self.sleep_until_with(tp, SwitchPayload::releasing(guard.into_raw()))
    }

    /// Parks the running context in the sleep set until `tp`. Returns
    /// whether the deadline was reached.
    pub(crate) fn sleep_until(&self, tp: Instant) -> bool {
        self.sleep_until_with(tp, SwitchPayload::default())
    }

    fn sleep_until_with(&self, tp: Instant, payload: SwitchPayload) -> bool {
        // Even an already-expired deadline goes through a real park: the
        // caller may have published a channel end under the lock in
        // `payload`, and skipping the park would let a completer reschedule
        // a context that never suspended. The sleep sweep wakes us on the
        // next run-loop pass.
        let ctx = self.running.get();
        self.link_sleeper(ctx, tp);
        self.park(payload);
        Instant::now() >= tp
    }

    fn link_sleeper(&self, ctx: NonNull<Context>, tp: Instant) {
        let _g = self.splk.lock();
        // Safety: `ctx` is the running context, owned by this worker.
        let c = unsafe { ctx.as_ref() };
        c.wake_at.set(Some(tp));
        c.hooks.insert(Hooks::SLEEP);
        // Safety: `sleepers` is guarded by `splk`.
        unsafe { &mut *self.sleepers.get() }.insert((tp, c.id()), ctx);
    }

    /// Parks an alting context: records the Alt on the context, links the
    /// sleep set if the Alt carries a timeout, and safe-parks releasing the
    /// Alt's lock.
    pub(crate) fn alt_wait(
        &self,
        alt: &AltCore,
        deadline: Option<Instant>,
        guard: SpinlockGuard<'_>,
    ) {
        let ctx = self.running.get();
        // Safety: the running context is ours.
        let c = unsafe { ctx.as_ref() };
        debug_assert!(c.alt.get().is_none());

        c.alt.set(Some(NonNull::from(alt)));
        if let Some(tp) = deadline {
            self.link_sleeper(ctx, tp);
        }

        self.park(SwitchPayload::releasing(guard.into_raw()));

        // Possibly running on a different worker now; only the context
        // itself may be touched here.
        c.alt.set(None);
        debug_assert!(!c.hooks.contains(Hooks::SLEEP));
    }

    /// Re-enqueues the running context and runs the next ready one; no-op
    /// if nothing else is runnable.
    pub(crate) fn yield_now(&self) {
        let ctx = self.running.get();
        if let Some(next) = self.policy.pick_next(self) {
            self.resume_to(next, SwitchPayload::waking(ctx));
        }
    }

    /// Blocks the running context until `ctx` has terminated.
    pub(crate) fn join(&self, ctx: NonNull<Context>) {
        // Safety: the caller's handle keeps `ctx` alive.
        let target = unsafe { ctx.as_ref() };
        let guard = target.splk.lock();
        if !target.has_terminated() {
            let me = self.running.get();
            // Safety: the running context outlives the join.
            target.push_waiter(unsafe { ContextRef::clone_raw(me) });
            self.wait_with_lock(guard);
            debug_assert!(target.has_terminated());
        }
    }

    // --- context management ---

    /// Attaches a fresh work context to this worker and makes it runnable.
    pub(crate) fn commit(&self, handle: &ContextRef) {
        let ctx = handle.as_ptr();
        debug_assert!(handle.is_work());
        debug_assert!(handle.scheduler().is_none(), "context committed twice");
        debug_assert!(handle.hooks.is_empty());

        self.attach(handle.clone());
        self.schedule_local(ctx);
        tracing::trace!(ctx = %handle.id(), "committed");
    }

    /// Links a work context into this worker's work set.
    pub(crate) fn attach(&self, handle: ContextRef) {
        debug_assert!(handle.is_work());
        handle.set_scheduler(Some(self));
        handle.hooks.insert(Hooks::WORK);
        // Safety: the work list is owner-thread-only.
        unsafe { &mut *self.work.get() }.push_back(handle);
    }

    /// Unlinks a work context from the work set, handing its scheduler
    /// share to the caller (who parks it in a steal deque).
    pub(crate) fn detach(&self, ctx: NonNull<Context>) -> NonNull<Context> {
        // Safety: the work list is owner-thread-only, and the WORK hook
        // proves membership.
        let c = unsafe { ctx.as_ref() };
        debug_assert!(c.hooks.contains(Hooks::WORK));
        // Safety: see above.
        let handle = unsafe { (*self.work.get()).remove(ctx) }.expect("context not on work list");
        c.hooks.remove(Hooks::WORK);
        c.set_scheduler(None);
        handle.into_raw()
    }

    /// Makes `ctx` runnable on whichever worker owns it.
    pub(crate) fn schedule(&self, ctx: NonNull<Context>) {
        // Safety: a schedulable context is parked, so it is kept alive by
        // its work-list share.
        let owner = unsafe { ctx.as_ref() }
            .scheduler()
            .expect("scheduling a detached context");
        // Safety: schedulers are leaked, the pointer is always valid.
        let owner = unsafe { owner.as_ref() };
        if core::ptr::eq(owner, self) {
            self.schedule_local(ctx);
        } else {
            owner.schedule_remote(ctx);
        }
    }

    fn schedule_local(&self, ctx: NonNull<Context>) {
        // Safety: `ctx` is owned by this scheduler.
        let c = unsafe { ctx.as_ref() };
        debug_assert!(!c.hooks.contains(Hooks::READY));
        debug_assert!(!c.hooks.contains(Hooks::TERMINATED));

        // A context being woken out of a timed wait leaves the sleep set
        // first.
        if c.hooks.contains(Hooks::SLEEP) {
            let _g = self.splk.lock();
            if c.hooks.contains(Hooks::SLEEP) {
                let tp = c.wake_at.get().expect("sleeping context without a deadline");
                // Safety: `sleepers` is guarded by `splk`.
                unsafe { &mut *self.sleepers.get() }.remove(&(tp, c.id()));
                c.hooks.remove(Hooks::SLEEP);
                c.wake_at.set(None);
            }
        }

        self.policy.enqueue(self, ctx);
    }

    fn schedule_remote(&self, ctx: NonNull<Context>) {
        // Safety: the context is alive (see `schedule`); the inbox carries
        // one count while the context is in transit.
        self.inbox.enqueue(unsafe { ContextRef::clone_raw(ctx) });
        self.policy.notify();
    }

    /// Terminates the running work context; never returns.
    pub(crate) fn terminate_running(&self) -> ! {
        let ctx = self.running.get();
        // Safety: the running context is ours.
        let c = unsafe { ctx.as_ref() };
        debug_assert!(c.is_work());
        tracing::trace!(ctx = %c.id(), "terminating");

        let guard = c.splk.lock();
        c.terminate();
        {
            let _g = self.splk.lock();
            // Safety: owner-thread lists; WORK hook proves membership.
            let handle = unsafe { (*self.work.get()).remove(ctx) }.expect("not on work list");
            c.hooks.remove(Hooks::WORK);
            c.hooks.insert(Hooks::TERMINATED);
            // Safety: `terminated` is guarded by `splk`.
            unsafe { &mut *self.terminated.get() }.push_back(handle);
        }
        for waiter in c.take_waiters() {
            self.schedule(waiter.as_ptr());
        }

        self.wait_with_lock(guard);
        unreachable!("state not recoverable: terminated context resumed");
    }

    // --- the run loop ---

    /// The scheduler context's loop.
    fn run(&'static self) -> ! {
        let _span = tracing::debug_span!("scheduler", id = %self.sched.id()).entered();

        loop {
            if self.exit.load(Ordering::Acquire) {
                self.policy.notify();
                // Safety: owner-thread-only list.
                if unsafe { &*self.work.get() }.is_empty() {
                    break;
                }
            }

            self.cleanup_terminated();
            self.drain_inbox();
            self.wakeup_sleepers();

            if let Some(next) = self.policy.pick_next(self) {
                // Stay runnable so the next suspension comes back here.
                self.schedule_local(NonNull::from(&*self.sched));
                self.resume_to(next, SwitchPayload::default());
            } else {
                self.policy.suspend_until(self.next_wake());
            }
        }

        self.cleanup_terminated();
        tracing::debug!("scheduler draining complete, exiting");

        self.sched.terminate();
        {
            let _guard = self.sched.splk.lock();
            for waiter in self.sched.take_waiters() {
                self.schedule(waiter.as_ptr());
            }
        }
        if self.main.hooks.contains(Hooks::READY) {
            self.policy.unlink_ready(NonNull::from(&*self.main));
        }
        self.resume_to(NonNull::from(&*self.main), SwitchPayload::default());
        unreachable!("state not recoverable: scheduler context resumed after exit");
    }

    /// Runs the scheduler loop on a pool worker thread; returns once the
    /// exit flag is observed and all work has drained.
    pub(crate) fn run_worker(&self) {
        self.park(SwitchPayload::default());
    }

    pub(crate) fn signal_exit(&self) {
        self.exit.store(true, Ordering::Release);
        self.policy.notify();
    }

    fn cleanup_terminated(&self) {
        loop {
            let handle = {
                let _g = self.splk.lock();
                // Safety: guarded by `splk`.
                unsafe { &mut *self.terminated.get() }.pop_front()
            };
            match handle {
                Some(handle) => {
                    handle.hooks.remove(Hooks::TERMINATED);
                    drop(handle);
                }
                None => break,
            }
        }
    }

    fn drain_inbox(&self) {
        while let Some(handle) = self.inbox.dequeue() {
            let ctx = handle.as_ptr();
            self.schedule_local(ctx);
            // The inbox count is no longer needed: the context is back on a
            // local queue which carries its own share.
            drop(handle);
        }
    }

    /// Moves every expired sleeper to the ready queue. Sleepers attached to
    /// an Alt or to a timed channel park only wake if they win the race
    /// against a completing peer.
    fn wakeup_sleepers(&self) {
        let now = Instant::now();
        let expired = {
            let _g = self.splk.lock();
            // Safety: guarded by `splk`.
            let sleepers = unsafe { &mut *self.sleepers.get() };
            let mut expired = Vec::new();
            while sleepers
                .first_key_value()
                .is_some_and(|(&(tp, _), _)| tp <= now)
            {
                let (_, ctx) = sleepers.pop_first().expect("checked non-empty");
                // Safety: sleeping contexts are kept alive by their
                // work-list share.
                let c = unsafe { ctx.as_ref() };
                c.hooks.remove(Hooks::SLEEP);
                c.wake_at.set(None);
                expired.push(ctx);
            }
            expired
        };

        for ctx in expired {
            // Safety: see above.
            let c = unsafe { ctx.as_ref() };
            if let Some(alt) = c.alt.get() {
                // Safety: an alting context keeps its Alt alive until it is
                // rescheduled, and we have not scheduled it yet.
                if unsafe { alt.as_ref() }.try_timeout() {
                    self.schedule_local(ctx);
                }
            } else if c.claim.try_wake() {
                self.schedule_local(ctx);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let _g = self.splk.lock();
        // Safety: guarded by `splk`.
        unsafe { &*self.sleepers.get() }
            .first_key_value()
            .map(|(&(tp, _), _)| tp)
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("main", &self.main.id())
            .field("exit", &self.exit.load(Ordering::Relaxed))
            .finish()
    }
}

/// Yields the processor to another ready process, if any.
pub(crate) fn yield_now() {
    Scheduler::self_().yield_now();
}

/// Identity of the calling process.
pub(crate) fn current_id() -> Id {
    // Safety: the running context is alive for the duration of the call.
    unsafe { Scheduler::running().as_ref() }.id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_idempotent() {
        let a = Scheduler::self_() as *const Scheduler;
        let b = Scheduler::self_() as *const Scheduler;
        assert_eq!(a, b);
    }

    #[test]
    fn running_is_main_initially() {
        use crate::runtime::context::ContextKind;
        let sched = Scheduler::self_();
        let running = Scheduler::running();
        // Safety: main context outlives the scheduler.
        assert_eq!(unsafe { running.as_ref() }.kind(), ContextKind::Main);
        let _ = sched;
    }

    #[test]
    fn sleep_reaches_deadline() {
        let sched = Scheduler::self_();
        let tp = Instant::now() + std::time::Duration::from_millis(20);
        assert!(sched.sleep_until(tp));
        assert!(Instant::now() >= tp);
    }

    #[test]
    fn yield_without_peers_is_noop() {
        // There may be stray ready work from other tests, so all this
        // asserts is that we come back.
        yield_now();
    }
}
