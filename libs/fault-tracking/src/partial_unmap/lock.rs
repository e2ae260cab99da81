// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A reader/writer spin lock usable from fault handlers.
//!
//! Implementation based on the `RwSpinLock` from facebook's folly: https://github.com/facebook/folly/blob/main/folly/synchronization/RWSpinLock.h
//! minus the upgradable state, which the partial unmap protocol has no use for. Acquiring never
//! allocates and never enters the OS, so it is safe to call from inside a signal handler as long
//! as the interrupted thread does not itself hold the lock exclusively.

use core::fmt;
use core::fmt::Formatter;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::backoff::Backoff;

const READER: usize = 1 << 1;
const WRITER: usize = 1;

pub struct RawRwLock {
    lock: AtomicUsize,
}

impl fmt::Debug for RawRwLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let v = self.lock.load(Ordering::Relaxed);
        f.debug_struct("RawRwLock")
            .field("writer", &(v & WRITER != 0))
            .field("readers", &(v / READER))
            .finish()
    }
}

// Safety: `lock_exclusive` only succeeds on a lock with no readers or writer, and readers back
// out again if they observe a writer, so shared and exclusive access never overlap.
unsafe impl lock_api::RawRwLock for RawRwLock {
    const INIT: Self = Self {
        lock: AtomicUsize::new(0),
    };
    type GuardMarker = lock_api::GuardSend;

    fn lock_shared(&self) {
        let mut boff = Backoff::new();
        while !self.try_lock_shared() {
            boff.spin();
        }
    }

    fn try_lock_shared(&self) -> bool {
        // fetch_add is considerably (100%) faster than compare_exchange,
        // so here we are optimizing for the common (lock success) case.
        let prev = self.lock.fetch_add(READER, Ordering::Acquire);

        if prev & WRITER != 0 {
            self.lock.fetch_sub(READER, Ordering::Release);
            false
        } else {
            true
        }
    }

    unsafe fn unlock_shared(&self) {
        self.lock.fetch_sub(READER, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        let mut boff = Backoff::new();
        while self
            .lock
            .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            boff.spin();
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.lock
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        debug_assert_eq!(self.lock.load(Ordering::Relaxed) & WRITER, WRITER);
        self.lock.fetch_and(!WRITER, Ordering::Release);
    }
}
