// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixed-capacity per-thread retry bookkeeping.
//!
//! Slots are looked up from the fault handler, so the table is allocated once up front and
//! lookup and insertion only use atomics. Threads are keyed by their OS thread id.

use core::fmt;

use crate::loom::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

const UNREGISTERED: u8 = 0;
const RESERVED: u8 = 1;
const ACTIVE: u8 = 2;

pub(crate) struct ThreadSlot {
    state: AtomicU8,
    tid: AtomicU64,
    /// The remap generation this thread last retried under.
    observed_generation: AtomicU64,
    /// Retries performed without the generation moving.
    retries: AtomicU32,
}

impl ThreadSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(UNREGISTERED),
            tid: AtomicU64::new(0),
            observed_generation: AtomicU64::new(0),
            retries: AtomicU32::new(0),
        }
    }

    /// Records a fault observed under `generation` and decides whether to retry it.
    ///
    /// A fault under a generation this thread has not seen yet is always retried. Repeated faults
    /// under the same generation are retried at most `max_retries` times.
    pub(crate) fn observe(&self, generation: u64, max_retries: u32) -> bool {
        if self.observed_generation.load(Ordering::Relaxed) != generation {
            self.observed_generation.store(generation, Ordering::Relaxed);
            self.retries.store(0, Ordering::Relaxed);
            return true;
        }

        let retries = self.retries.load(Ordering::Relaxed).saturating_add(1);
        self.retries.store(retries, Ordering::Relaxed);
        retries <= max_retries
    }
}

pub(crate) struct ThreadLocalMap {
    slots: Box<[ThreadSlot]>,
}

impl fmt::Debug for ThreadLocalMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalMap")
            .field("capacity", &self.slots.len())
            .field("registered", &self.registered())
            .finish()
    }
}

impl ThreadLocalMap {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "thread map needs at least one slot");
        Self {
            slots: (0..capacity).map(|_| ThreadSlot::new()).collect(),
        }
    }

    #[expect(clippy::cast_possible_truncation, reason = "only used as a hash")]
    fn probe(&self, tid: u64) -> impl Iterator<Item = &ThreadSlot> {
        let start = tid as usize % self.slots.len();
        self.slots[start..].iter().chain(self.slots[..start].iter())
    }

    /// Returns the slot of thread `tid`, registering it if needed.
    ///
    /// Returns `None` if the thread is not registered yet and every slot is taken.
    pub(crate) fn get_or_insert(&self, tid: u64) -> Option<&ThreadSlot> {
        if let Some(slot) = self.probe(tid).find(|slot| {
            slot.state.load(Ordering::Acquire) == ACTIVE && slot.tid.load(Ordering::Relaxed) == tid
        }) {
            return Some(slot);
        }

        for slot in self.probe(tid) {
            if slot
                .state
                .compare_exchange(UNREGISTERED, RESERVED, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            slot.tid.store(tid, Ordering::Relaxed);
            slot.observed_generation.store(0, Ordering::Relaxed);
            slot.retries.store(0, Ordering::Relaxed);
            slot.state.store(ACTIVE, Ordering::Release);
            return Some(slot);
        }

        None
    }

    /// Releases the slots of every thread for which `is_alive` returns `false`.
    ///
    /// Returns the number of released slots.
    pub(crate) fn trim(&self, mut is_alive: impl FnMut(u64) -> bool) -> usize {
        let mut released = 0;

        for slot in &self.slots {
            if slot.state.load(Ordering::Acquire) != ACTIVE {
                continue;
            }

            let tid = slot.tid.load(Ordering::Relaxed);
            if is_alive(tid) {
                continue;
            }

            if slot
                .state
                .compare_exchange(ACTIVE, RESERVED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                slot.tid.store(0, Ordering::Relaxed);
                slot.state.store(UNREGISTERED, Ordering::Release);
                released += 1;
            }
        }

        released
    }

    /// Number of threads currently holding a slot.
    pub(crate) fn registered(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.load(Ordering::Relaxed) == ACTIVE)
            .count()
    }
}
