// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Architecture-specific context switching.
//!
//! The runtime performs *symmetric* switches: any context can transfer
//! control to any suspended context, storing its own resume point as it
//! goes. A suspended context is represented by nothing more than a stack
//! pointer; the word it points at is the address execution resumes from,
//! followed by the callee-saved registers the compiler cannot be told to
//! reload itself.
//!
//! Only the LLVM-reserved callee-saved registers (and the program counter)
//! are saved in the switch frame by hand; everything else is declared as a
//! clobber so the compiler spills exactly what is live across the switch.
//!
//! ## Suspended stack layout (word offsets from the saved stack pointer)
//!
//! ```text
//! +--------------+ <- stack top (16-byte aligned)
//! |     ...      |
//! +--------------+
//! | saved regs   |   rbx/rbp, x19/x29 or s0/s1 depending on the arch
//! +--------------+
//! | resume PC    | <- saved stack pointer
//! +--------------+
//! ```
//!
//! A freshly initialized stack carries a synthetic frame whose resume PC is
//! the entry trampoline, with the entry function and its argument parked in
//! the two words at the very top of the stack.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use x86_64::{init_stack, switch};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub(crate) use aarch64::{init_stack, switch};
    } else if #[cfg(target_arch = "riscv64")] {
        mod riscv64;
        pub(crate) use riscv64::{init_stack, switch};
    } else {
        compile_error!("kcsp supports x86_64, aarch64 and riscv64 targets");
    }
}

/// The type of a context entry point.
///
/// Entry points never return; a finished context parks itself forever in
/// `Scheduler::terminate` instead.
pub(crate) type EntryFn = unsafe extern "C" fn(arg: usize) -> !;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::stack::{DEFAULT_STACK_SIZE, Stack};

    struct PingPong {
        main_sp: usize,
        child_sp: usize,
        count: usize,
    }

    unsafe extern "C" fn child(arg: usize) -> ! {
        let st = arg as *mut PingPong;
        loop {
            // Safety: the test keeps `PingPong` alive across all bounces.
            unsafe {
                (*st).count += 1;
                switch(&raw mut (*st).child_sp, (*st).main_sp);
            }
        }
    }

    #[test]
    fn round_trips() {
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        let mut st = PingPong {
            main_sp: 0,
            child_sp: 0,
            count: 0,
        };
        // Safety: fresh stack, valid entry.
        st.child_sp = unsafe { init_stack(stack.top(), child, &raw mut st as usize) };

        for bounce in 1..=3 {
            // Safety: `child_sp` always holds a valid suspended context and
            // `main_sp` is a valid slot for our own continuation.
            unsafe { switch(&raw mut st.main_sp, st.child_sp) };
            assert_eq!(st.count, bounce);
        }
    }
}
