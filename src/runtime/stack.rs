// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guarded process stacks.
//!
//! Every work context owns one of these. The mapping is reserved with
//! `PROT_NONE` and everything except the lowest page is then made
//! read-write, so the lowest page acts as a guard page: running off the end
//! of a process stack faults instead of silently corrupting a neighbouring
//! allocation.

use core::num::NonZeroUsize;
use std::io;
use std::ptr;

pub(crate) type StackPointer = NonZeroUsize;

/// Usable stack size of a work context, excluding the guard page.
pub(crate) const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Minimum size of a stack, excluding the guard page.
pub(crate) const MIN_STACK_SIZE: usize = 4096;

/// Stack pointers must stay 16-byte aligned on every supported arch.
pub(crate) const STACK_ALIGNMENT: usize = 16;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        #[derive(Debug)]
        pub(crate) struct Stack {
            top: StackPointer,
            mmap_len: usize,
        }

        // Safety: the mapping is plain memory; ownership moves with the
        // containing context.
        unsafe impl Send for Stack {}
        // Safety: the stack itself carries no interior mutability; all
        // access to its memory is mediated by the context switch protocol.
        unsafe impl Sync for Stack {}

        impl Stack {
            /// Maps a new stack with at least `size` usable bytes.
            pub(crate) fn new(size: usize) -> io::Result<Self> {
                let size = size.max(MIN_STACK_SIZE);

                // Round up to whole pages and add one guard page.
                let page_size = page_size();
                let mmap_len = size
                    .checked_add(page_size + page_size - 1)
                    .expect("integer overflow while calculating stack size")
                    & !(page_size - 1);

                // Safety: fresh anonymous mapping, length checked above.
                unsafe {
                    let mmap = libc::mmap(
                        ptr::null_mut(),
                        mmap_len,
                        libc::PROT_NONE,
                        libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                        -1,
                        0,
                    );
                    if mmap == libc::MAP_FAILED {
                        return Err(io::Error::last_os_error());
                    }

                    // Constructed before the mprotect call so the mapping is
                    // released should it fail.
                    let out = Self {
                        top: StackPointer::new(mmap as usize + mmap_len).unwrap(),
                        mmap_len,
                    };

                    if libc::mprotect(
                        mmap.cast::<u8>().add(page_size).cast(),
                        mmap_len - page_size,
                        libc::PROT_READ | libc::PROT_WRITE,
                    ) != 0
                    {
                        return Err(io::Error::last_os_error());
                    }

                    Ok(out)
                }
            }

            /// Highest address of the stack, 16-byte aligned.
            pub(crate) fn top(&self) -> StackPointer {
                self.top
            }
        }

        impl Drop for Stack {
            fn drop(&mut self) {
                let mmap = self.top.get() - self.mmap_len;
                // Safety: exact mapping created in `new`.
                let ret = unsafe { libc::munmap(mmap as *mut libc::c_void, self.mmap_len) };
                debug_assert_eq!(ret, 0);
            }
        }

        fn page_size() -> usize {
            // Safety: trivially safe libc call.
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            assert!(page_size.is_power_of_two());
            page_size
        }
    } else {
        compile_error!("kcsp requires a unix-like target for guarded process stacks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_top() {
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        assert_eq!(stack.top().get() % STACK_ALIGNMENT, 0);
    }

    #[test]
    fn stack_is_writable() {
        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        // Safety: the word right below the top is inside the mapped,
        // read-write region.
        unsafe {
            let word = (stack.top().get() as *mut usize).sub(1);
            word.write(0xdead_beef);
            assert_eq!(word.read(), 0xdead_beef);
        }
    }
}
