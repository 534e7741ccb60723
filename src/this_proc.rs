// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Operations on the calling process.

use std::time::{Duration, Instant};

use crate::runtime::context::Id;
use crate::runtime::scheduler::{self, Scheduler};

/// Identity of the calling process.
pub fn get_id() -> Id {
    scheduler::current_id()
}

/// Gives up the processor to another ready process; a no-op when none is
/// ready.
pub fn yield_now() {
    scheduler::yield_now();
}

/// Suspends the calling process for at least `duration`.
pub fn delay_for(duration: Duration) {
    delay_until(Instant::now() + duration);
}

/// Suspends the calling process until at least `tp`.
pub fn delay_until(tp: Instant) {
    let _ = Scheduler::self_().sleep_until(tp);
}
