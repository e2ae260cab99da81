// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Real protection faults routed through the installed handler.
//!
//! Everything lives in a single test since the handler and the tracked ranges are process-wide.

#![cfg(any(
    all(any(target_os = "linux", target_os = "android"), any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_vendor = "apple", any(target_arch = "x86_64", target_arch = "aarch64"))
))]

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};

const PAGES: usize = 4;

static REGION: AtomicUsize = AtomicUsize::new(0);
static CALLS: AtomicUsize = AtomicUsize::new(0);
static LAST_OFFSET: AtomicU64 = AtomicU64::new(u64::MAX);
static LAST_WRITE: AtomicBool = AtomicBool::new(false);

/// Records the access and makes the page accessible so the instruction can be resumed.
unsafe extern "C" fn unprotect(offset: u64, page_size: u64, is_write: bool, _: u32) -> bool {
    CALLS.fetch_add(1, Ordering::SeqCst);
    LAST_OFFSET.store(offset, Ordering::SeqCst);
    LAST_WRITE.store(is_write, Ordering::SeqCst);

    let (Ok(offset), Ok(page_size)) = (usize::try_from(offset), usize::try_from(page_size)) else {
        return false;
    };
    let page = REGION.load(Ordering::SeqCst) + offset;
    // Safety: the page belongs to the tracked region, mprotect is async-signal-safe
    unsafe {
        rustix::mm::mprotect(
            page as *mut _,
            page_size,
            MprotectFlags::READ | MprotectFlags::WRITE,
        )
    }
    .is_ok()
}

#[test_log::test]
fn protected_pages_report_accesses() {
    fault_tracking::initialize();
    assert!(fault_tracking::is_installed());
    // a second call is a no-op
    fault_tracking::initialize();

    // flushing translated code must leave the installed handler alone
    let cache = code_cache::global().unwrap();
    cache.clear();
    for _ in 0..64 {
        // garbage that would run instead of the handler if it had been freed
        cache.map(&[0xCC; 256], None);
    }
    assert_eq!(cache.stats().functions, 65);

    let page_size = rustix::param::page_size();
    let len = PAGES * page_size;
    // Safety: we pass a nullptr so the kernel picks the address for us
    let base = unsafe {
        rustix::mm::mmap_anonymous(ptr::null_mut(), len, ProtFlags::empty(), MapFlags::PRIVATE)
    }
    .unwrap()
    .cast::<u8>();
    REGION.store(base as usize, Ordering::SeqCst);

    let start = base as u64;
    let end = start + u64::try_from(len).unwrap();
    assert!(fault_tracking::add_tracked_region(start, end, unprotect));
    let page_size_u64 = u64::try_from(page_size).unwrap();

    // write into the third page
    // Safety: the callback makes the page writable before the store is retried
    unsafe { ptr::write_volatile(base.add(2 * page_size + 8), 0xAB) };
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(LAST_OFFSET.load(Ordering::SeqCst), 2 * page_size_u64);
    assert!(LAST_WRITE.load(Ordering::SeqCst));

    // read from the second page
    // Safety: the callback makes the page readable before the load is retried
    let value = unsafe { ptr::read_volatile(base.add(page_size + 100)) };
    assert_eq!(value, 0);
    assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    assert_eq!(LAST_OFFSET.load(Ordering::SeqCst), page_size_u64);
    assert!(!LAST_WRITE.load(Ordering::SeqCst));

    // the third page is accessible now, no further faults
    // Safety: made accessible by the first fault
    let value = unsafe { ptr::read_volatile(base.add(2 * page_size + 8)) };
    assert_eq!(value, 0xAB);
    assert_eq!(CALLS.load(Ordering::SeqCst), 2);

    assert!(fault_tracking::remove_tracked_region(start));
    assert!(!fault_tracking::remove_tracked_region(start));

    assert!(fault_tracking::restore().unwrap());
    assert!(!fault_tracking::is_installed());
    assert!(!fault_tracking::restore().unwrap());

    // reinstalling reuses the generated handler
    fault_tracking::initialize();
    assert!(fault_tracking::is_installed());

    // Safety: the region was mapped above and nothing refers to it anymore
    unsafe { rustix::mm::munmap(base.cast(), len).unwrap() };
}
