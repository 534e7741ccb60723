// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work-stealing scheduling policy and the worker pool.
//!
//! Each scheduler owns a [`Policy`]: a Chase–Lev deque for migratable work
//! contexts, an intrusive ready list for the pinned main/scheduler
//! contexts, and a parker the worker sleeps on when idle. Schedulers
//! register in a process-wide registry so thieves can find victims and a
//! worker that pops work while more remains can wake a random idle peer.
//!
//! The first scheduler created in the process spawns N−1 pool worker
//! threads (N = available parallelism) which run their scheduler loops to
//! completion. Only pool workers steal: a scheduler created for a plain
//! user thread may stop being driven whenever that thread stops blocking
//! on the runtime, so it must never take ownership of foreign contexts.

use core::cell::UnsafeCell;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Barrier, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Instant;

use cordyceps::List;
use lazy_static::lazy_static;

use crate::runtime::context::{Context, ContextRef, Hooks};
use crate::runtime::scheduler::Scheduler;
use crate::sync::StealDeque;

lazy_static! {
    /// Every scheduler in the process, pool workers and user threads alike.
    /// Victims for stealing and targets for wake-up signals.
    static ref REGISTRY: RwLock<Vec<&'static Scheduler>> = RwLock::new(Vec::new());

    /// Join handles of the pool worker threads, consumed by [`shutdown`].
    static ref POOL: Mutex<Vec<thread::JoinHandle<()>>> = Mutex::new(Vec::new());
}

static POOL_SPAWNED: AtomicBool = AtomicBool::new(false);

std::thread_local! {
    /// Set by `worker_main` before it first touches the scheduler
    /// thread-local, marking the new scheduler as a pool worker.
    static IS_POOL_WORKER: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// Creates the calling thread's scheduler, registering it and spawning the
/// worker pool on first use anywhere in the process.
pub(crate) fn bootstrap() -> &'static Scheduler {
    let is_pool_worker = IS_POOL_WORKER.get();
    let sched = Scheduler::leak_new(is_pool_worker);

    {
        let mut registry = REGISTRY.write().expect("scheduler registry poisoned");
        sched.policy.slot.store(registry.len(), Ordering::Release);
        registry.push(sched);
    }

    if !POOL_SPAWNED.swap(true, Ordering::SeqCst) {
        spawn_pool();
    }

    tracing::debug!(pool_worker = is_pool_worker, "scheduler online");
    sched
}

fn spawn_pool() {
    let cpus = thread::available_parallelism().map_or(1, NonZeroUsize::get);
    if cpus <= 1 {
        return;
    }

    let barrier = std::sync::Arc::new(Barrier::new(cpus));
    let mut pool = POOL.lock().expect("worker pool poisoned");
    for i in 1..cpus {
        let barrier = std::sync::Arc::clone(&barrier);
        let handle = thread::Builder::new()
            .name(format!("kcsp-worker-{i}"))
            .spawn(move || {
                IS_POOL_WORKER.set(true);
                let sched = Scheduler::self_();
                // All workers exist before any of them picks up work.
                barrier.wait();
                sched.run_worker();
            })
            .expect("failed to spawn pool worker");
        pool.push(handle);
    }
    drop(pool);
    barrier.wait();
}

/// Signals every pool worker to drain and exit, then joins their threads.
///
/// Pending work keeps its worker alive until it terminates, so this blocks
/// until all launched processes have finished. The calling thread's own
/// scheduler stays usable (without a pool to steal from). Must not be
/// called from inside a process.
pub fn shutdown() {
    {
        let registry = REGISTRY.read().expect("scheduler registry poisoned");
        for sched in registry.iter().filter(|s| s.is_pool_worker()) {
            sched.signal_exit();
        }
    }
    let handles: Vec<_> = {
        let mut pool = POOL.lock().expect("worker pool poisoned");
        pool.drain(..).collect()
    };
    for handle in handles {
        let _ = handle.join();
    }
}

pub(crate) struct Policy {
    /// Migratable work contexts; owner pops the bottom, thieves the top.
    deque: StealDeque<Context>,
    /// Pinned contexts made ready through `schedule`.
    ready: UnsafeCell<List<Context>>,
    parker: Parker,
    /// Index in the registry, for excluding ourselves when picking peers.
    slot: AtomicUsize,
    is_pool_worker: bool,
}

// === impl Policy ===

impl Policy {
    pub(crate) fn new(is_pool_worker: bool) -> Self {
        Self {
            deque: StealDeque::new(),
            ready: UnsafeCell::new(List::new()),
            parker: Parker::new(),
            slot: AtomicUsize::new(usize::MAX),
            is_pool_worker,
        }
    }

    pub(crate) fn is_pool_worker(&self) -> bool {
        self.is_pool_worker
    }

    /// Makes `ctx` runnable on this worker. Owner thread only.
    pub(crate) fn enqueue(&self, sched: &Scheduler, ctx: NonNull<Context>) {
        // Safety: owner-thread call; `ctx` is alive and owned by `sched`.
        let c = unsafe { ctx.as_ref() };
        if c.is_work() {
            // Migratable: detach from the work set so a thief can re-own
            // it, then publish on the deque.
            let raw = sched.detach(ctx);
            self.deque.push(raw);
        } else {
            c.hooks.insert(Hooks::READY);
            // Safety: the ready list is owner-thread-only; the handle
            // carries a count while linked.
            unsafe {
                (*self.ready.get()).push_back(ContextRef::clone_raw(ctx));
            }
        }
    }

    /// Picks the next context to run: local deque, then ready list, then a
    /// random victim's deque.
    pub(crate) fn pick_next(&self, sched: &Scheduler) -> Option<NonNull<Context>> {
        if let Some(ptr) = self.deque.pop() {
            if !self.deque.is_empty() {
                // More work remains locally; converge an idle peer on it.
                self.signal_random_peer();
            }
            // Safety: the deque slot carried the context's scheduler share.
            sched.attach(unsafe { ContextRef::from_raw(ptr) });
            return Some(ptr);
        }

        // Safety: the ready list is owner-thread-only.
        if let Some(handle) = unsafe { (*self.ready.get()).pop_front() } {
            handle.hooks.remove(Hooks::READY);
            let ptr = handle.as_ptr();
            // Pinned contexts are owned by their (leaked) scheduler, so the
            // list's count can be dropped before the pointer is used.
            drop(handle);
            return Some(ptr);
        }

        if self.is_pool_worker {
            return self.steal(sched);
        }
        None
    }

    fn steal(&self, sched: &Scheduler) -> Option<NonNull<Context>> {
        let victim = self.random_peer()?;
        let ptr = victim.policy.deque.steal()?;
        tracing::trace!(ctx = ?ptr, "stole context");
        // Safety: the deque slot carried the context's scheduler share.
        sched.attach(unsafe { ContextRef::from_raw(ptr) });
        Some(ptr)
    }

    fn random_peer(&self) -> Option<&'static Scheduler> {
        let registry = REGISTRY.read().expect("scheduler registry poisoned");
        if registry.len() <= 1 {
            return None;
        }
        let me = self.slot.load(Ordering::Acquire);
        loop {
            let pick = fastrand::usize(..registry.len());
            if pick != me {
                return Some(registry[pick]);
            }
        }
    }

    fn signal_random_peer(&self) {
        if let Some(peer) = self.random_peer() {
            peer.policy.notify();
        }
    }

    /// Parks the worker until notified, or until `deadline` at the latest.
    pub(crate) fn suspend_until(&self, deadline: Option<Instant>) {
        match deadline {
            Some(tp) => self.parker.park_until(tp),
            None => self.parker.park(),
        }
    }

    pub(crate) fn notify(&self) {
        self.parker.notify();
    }

    /// Unlinks a pinned context from the ready list without running it.
    /// Used on the exit path when the main context is resumed directly.
    pub(crate) fn unlink_ready(&self, ctx: NonNull<Context>) {
        // Safety: owner-thread-only list; the READY hook proves membership.
        let handle = unsafe { (*self.ready.get()).remove(ctx) };
        if let Some(handle) = handle {
            handle.hooks.remove(Hooks::READY);
        }
    }
}

impl core::fmt::Debug for Policy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Policy")
            .field("deque", &self.deque)
            .field("pool_worker", &self.is_pool_worker)
            .finish()
    }
}

/// A flag-and-condvar parker, one per worker.
///
/// `notify` stores a wake-up; `park` consumes one, returning immediately
/// if a wake-up was stored while the worker was busy.
#[derive(Debug)]
struct Parker {
    flag: Mutex<bool>,
    cv: Condvar,
}

// === impl Parker ===

impl Parker {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn park(&self) {
        let mut flag = self.flag.lock().expect("parker poisoned");
        while !*flag {
            flag = self.cv.wait(flag).expect("parker poisoned");
        }
        *flag = false;
    }

    fn park_until(&self, deadline: Instant) {
        let mut flag = self.flag.lock().expect("parker poisoned");
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(flag, deadline - now)
                .expect("parker poisoned");
            flag = guard;
        }
        *flag = false;
    }

    fn notify(&self) {
        let mut flag = self.flag.lock().expect("parker poisoned");
        *flag = true;
        drop(flag);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parker_stores_one_wakeup() {
        let parker = Parker::new();
        parker.notify();
        // Consumes the stored wake-up without blocking.
        parker.park();
    }

    #[test]
    fn parker_times_out() {
        let parker = Parker::new();
        let start = Instant::now();
        parker.park_until(start + Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
