// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process handles and composition.
//!
//! A [`Process`] wraps a work context that is created suspended; `launch`
//! attaches it to the calling worker and makes it runnable, `join` blocks
//! the calling process until it terminates. [`parallel`] launches a batch
//! and joins every member, giving well-nested fork/join scoping:
//!
//! ```
//! use kcsp::{parallel, proc};
//!
//! parallel((0..4).map(|i| proc(move || println!("worker {i}"))));
//! ```

use crate::runtime::context::{Context, ContextRef};
use crate::runtime::scheduler::Scheduler;

pub use crate::runtime::context::Id;

/// A handle on a lightweight process.
#[derive(Debug)]
pub struct Process {
    ctx: Option<ContextRef>,
    launched: bool,
}

// === impl Process ===

impl Process {
    /// Creates a process that will run `f` once launched.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            ctx: Some(Context::new_work(Box::new(f))),
            launched: false,
        }
    }

    /// Attaches the process to the calling worker and schedules it.
    ///
    /// Launching twice, or launching a joined/detached handle, is a
    /// programmer error.
    pub fn launch(&mut self) {
        debug_assert!(!self.launched, "process launched twice");
        let ctx = self.ctx.as_ref().expect("process handle already consumed");
        Scheduler::self_().commit(ctx);
        self.launched = true;
    }

    /// Blocks the calling process until this one terminates, then clears
    /// the handle. Returns immediately if it already terminated.
    pub fn join(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            debug_assert!(self.launched, "joining a process that was never launched");
            Scheduler::self_().join(ctx.as_ptr());
        }
    }

    /// Gives up the handle without waiting for termination.
    pub fn detach(&mut self) {
        self.ctx = None;
    }

    /// The process identity, or `None` once joined or detached.
    pub fn get_id(&self) -> Option<Id> {
        self.ctx.as_ref().map(|ctx| ctx.id())
    }
}

// A dropped handle behaves like `detach`: the context keeps running and is
// released by its scheduler when it terminates.

/// Shorthand for [`Process::new`].
pub fn proc(f: impl FnOnce() + Send + 'static) -> Process {
    Process::new(f)
}

/// A process that runs `f` once per item of `items`, each in its own
/// subprocess, launching them all and joining them all.
pub fn proc_for<I, F>(items: I, f: F) -> Process
where
    I: IntoIterator + Send + 'static,
    I::Item: Send + 'static,
    F: Fn(I::Item) + Clone + Send + 'static,
{
    Process::new(move || {
        parallel(items.into_iter().map(move |item| {
            let f = f.clone();
            Process::new(move || f(item))
        }));
    })
}

/// Launches every process, then joins every process, in order.
pub fn parallel(procs: impl IntoIterator<Item = Process>) {
    let mut procs: Vec<Process> = procs.into_iter().collect();
    for p in &mut procs {
        p.launch();
    }
    for p in &mut procs {
        p.join();
    }
}
