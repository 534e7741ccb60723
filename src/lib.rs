// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A cooperative M:N CSP runtime.
//!
//! `kcsp` multiplexes lightweight, stackful processes onto a pool of
//! worker threads (one per CPU), connected by synchronous rendezvous
//! [channels](channel) and composed with a guarded-choice construct
//! ([`Alt`](alt::Alt)) plus fork/join combinators ([`parallel`]). There is
//! no preemption: a process runs until it sends, receives, selects,
//! yields, sleeps or joins.
//!
//! ```
//! use kcsp::channel::Chan;
//! use kcsp::{parallel, proc};
//!
//! let (tx, rx) = Chan::<u64>::create();
//! parallel([
//!     proc(move || {
//!         for n in 0..10 {
//!             let _ = tx.send(n);
//!         }
//!     }),
//!     proc(move || {
//!         let sum: u64 = rx.iter().sum();
//!         assert_eq!(sum, 45);
//!     }),
//! ]);
//! ```

pub mod alt;
pub mod channel;
mod process;
pub(crate) mod runtime;
pub(crate) mod sync;
pub mod this_proc;
pub mod timer;

pub use process::{Id, Process, parallel, proc, proc_for};
pub use runtime::shutdown;
