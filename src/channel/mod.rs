// Copyright 2026 the kcsp authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronous rendezvous channels.
//!
//! A channel holds no buffer: a send and a receive meet, one value moves
//! from the sender's stack to the receiver's, and both proceed. Either
//! side suspends until its counterpart arrives; timed variants give up
//! after a deadline. Closing a channel (explicitly or by dropping an
//! endpoint) wakes any suspended peer with [`OpResult::Closed`].
//!
//! ```
//! use kcsp::channel::{self, OpResult};
//! use kcsp::{parallel, proc};
//!
//! let (tx, rx) = channel::create::<u32>();
//! parallel([
//!     proc(move || assert_eq!(tx.send(42), OpResult::Ok)),
//!     proc(move || assert_eq!(rx.recv(), Ok(42))),
//! ]);
//! ```

mod rx;
mod state;
mod tx;

pub(crate) use state::{ChanEnd, ChannelCore};

pub use rx::{RecvIter, Rx};
pub use tx::Tx;

use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

/// Result of a channel operation.
///
/// `Empty` and `Full` are reserved for buffered channel variants and are
/// never produced by the synchronous channels in this crate; `Error` is
/// likewise reserved.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Ok,
    Empty,
    Full,
    Timeout,
    Closed,
    Error,
}

/// Identity of a channel, derived from its address. Both endpoints of a
/// channel share one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ChanId(usize);

impl ChanId {
    pub(crate) fn of<T>(chan: &Arc<ChannelCore<T>>) -> Self {
        Self(Arc::as_ptr(chan) as usize)
    }
}

/// Creates a linked channel, returning its two endpoints.
pub fn create<T: Send>() -> (Tx<T>, Rx<T>) {
    let chan = Arc::new(ChannelCore::new());
    (Tx::new(Arc::clone(&chan)), Rx::new(chan))
}

/// Creates `n` independent channels, endpoints split into two vectors.
pub fn create_n<T: Send>(n: usize) -> (Vec<Tx<T>>, Vec<Rx<T>>) {
    (0..n).map(|_| create()).unzip()
}

/// Namespace mirror of [`create`]/[`create_n`], so call sites can read
/// `Chan::<T>::create()`.
#[derive(Debug)]
pub enum Chan<T> {
    #[doc(hidden)]
    _Never(PhantomData<T>, Infallible),
}

impl<T: Send> Chan<T> {
    pub fn create() -> (Tx<T>, Rx<T>) {
        create()
    }

    pub fn create_n(n: usize) -> (Vec<Tx<T>>, Vec<Rx<T>>) {
        create_n(n)
    }
}
