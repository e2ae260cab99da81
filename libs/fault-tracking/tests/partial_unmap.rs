// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Accesses racing a storm of remaps never crash and never observe torn state.

#![cfg(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use fault_tracking::partial_unmap::remap::{Piece, Protection, SharedMemory};

const PAGES: usize = 16;
const READERS: usize = 4;
const REMAPS: usize = 2000;
const MAX_PIECES: usize = 8;

/// Value slot inside the view, on a page in the middle.
const VALUE_PAGE: usize = 5;

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, bound: usize) -> usize {
        usize::try_from(self.next() % u64::try_from(bound).unwrap()).unwrap()
    }
}

/// Splits `0..pages` into `count` contiguous read-write pieces.
fn pieces(rng: &mut XorShift, pages: usize, count: usize, page_size: usize) -> Vec<Piece> {
    let mut cuts: Vec<usize> = (0..count - 1).map(|_| 1 + rng.below(pages - 1)).collect();
    cuts.push(0);
    cuts.push(pages);
    cuts.sort_unstable();
    cuts.dedup();

    cuts.windows(2)
        .map(|w| Piece {
            offset: w[0] * page_size,
            len: (w[1] - w[0]) * page_size,
            protection: Protection::ReadWrite,
        })
        .collect()
}

#[test_log::test]
fn remap_storm() {
    fault_tracking::initialize();
    let state = fault_tracking::partial_unmap_state();

    let page_size = rustix::param::page_size();
    let memory = SharedMemory::new(PAGES * page_size).unwrap();
    let view = Arc::new(memory.map_view(0, PAGES * page_size, Protection::ReadWrite).unwrap());

    let value_addr = view.as_ptr() as usize + VALUE_PAGE * page_size;
    // Safety: the slot is aligned, and stays backed by the same file page across remaps
    let value = move || unsafe { &*(value_addr as *const AtomicU64) };

    let last_written = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(READERS + 2));

    let writer = thread::spawn({
        let last_written = last_written.clone();
        let done = done.clone();
        let barrier = barrier.clone();
        let _view = view.clone();
        move || {
            barrier.wait();
            let mut next = 1;
            while !done.load(Ordering::SeqCst) {
                value().store(next, Ordering::SeqCst);
                last_written.store(next, Ordering::SeqCst);
                next += 1;
            }
        }
    });

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let last_written = last_written.clone();
            let done = done.clone();
            let barrier = barrier.clone();
            let _view = view.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut reads = 0_u64;
                while !done.load(Ordering::SeqCst) {
                    let before = last_written.load(Ordering::SeqCst);
                    let observed = value().load(Ordering::SeqCst);
                    let after = last_written.load(Ordering::SeqCst);
                    assert!(
                        before <= observed && observed <= after + 1,
                        "observed {observed} outside {before}..={}",
                        after + 1
                    );
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    barrier.wait();
    let mut rng = XorShift(0x2545_f491_4f6c_dd1d);
    for _ in 0..REMAPS {
        let count = 1 + rng.below(MAX_PIECES);
        let pieces = pieces(&mut rng, PAGES, count, page_size);
        view.split(state, &pieces).unwrap();
    }
    done.store(true, Ordering::SeqCst);

    writer.join().unwrap();
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }

    assert!(state.generation() >= u64::try_from(REMAPS).unwrap());
    assert!(last_written.load(Ordering::SeqCst) > 0);
}
