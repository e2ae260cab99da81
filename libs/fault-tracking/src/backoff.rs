// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// An exponential backoff for the spin loops of the partial unmap lock.
///
/// The lock is taken from inside fault handlers, so waiting must not involve the OS scheduler or
/// any allocation. Spinning with an exponentially growing number of `pause`-style hints is the
/// only thing left.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Backoff {
    exp: u8,
    max: u8,
}

impl Backoff {
    pub(crate) const MAX_EXPONENT: u8 = 8;

    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::MAX_EXPONENT,
        }
    }

    /// Issues `2^exp` spin loop hints, then bumps the exponent until it reaches the maximum.
    #[inline(always)]
    pub(crate) fn spin(&mut self) {
        let spins = 1_u32 << self.exp;

        for _ in 0..spins {
            // In tests, especially in loom tests, we need to yield the thread back to the runtime
            // so it can make progress. See https://github.com/tokio-rs/loom/issues/162#issuecomment-665128979
            #[cfg(any(test, loom))]
            crate::loom::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < self.max {
            self.exp += 1;
        }
    }
}
