// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The block of memory shared between Rust and the generated fault trampoline.
//!
//! The trampoline addresses every field by a fixed byte offset, so the layout of [`FaultConfig`]
//! and [`TrackedRange`] is part of the trampoline's ABI and checked at compile time below. Rust
//! code accesses the fields through atomics while the trampoline uses plain loads.

use core::fmt;
use core::mem::offset_of;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use static_assertions::const_assert_eq;

/// Maximum number of ranges that can be tracked at the same time.
pub const MAX_TRACKED_RANGES: usize = 8;

/// Called from the fault handler when an access hits a tracked range.
///
/// Receives the offset of the faulting page from the range start, the page size, whether the
/// access was a write, and a reserved argument that is always `0`. Returning `true` resumes the
/// faulting instruction, returning `false` treats the fault as unhandled.
///
/// The callback runs inside the OS fault delivery path of the faulting thread: it must not
/// allocate, must not take locks the interrupted code could hold, and must tolerate being
/// invoked spuriously.
pub type TrackingCallback =
    unsafe extern "C" fn(page_offset: u64, page_size: u64, is_write: bool, reserved: u32) -> bool;

/// A guest address range under access tracking.
#[repr(C)]
pub struct TrackedRange {
    active: AtomicI32,
    /// Slot ownership for writers, never read by the trampoline.
    claimed: AtomicU32,
    start: AtomicU64,
    end: AtomicU64,
    callback: AtomicUsize,
}

#[repr(C)]
pub struct FaultConfig {
    struct_address_offset: AtomicI32,
    struct_write_offset: AtomicI32,
    previous_handler: AtomicUsize,
    previous_handler_takes_info: AtomicI32,
    ranges: [TrackedRange; MAX_TRACKED_RANGES],
}

#[expect(clippy::cast_possible_truncation, reason = "checked by the assertion")]
#[expect(clippy::cast_possible_wrap, reason = "checked by the assertion")]
const fn offset_i32(offset: usize) -> i32 {
    assert!(offset <= i32::MAX as usize);
    offset as i32
}

pub(crate) const STRUCT_ADDRESS_OFFSET: i32 =
    offset_i32(offset_of!(FaultConfig, struct_address_offset));
pub(crate) const STRUCT_WRITE_OFFSET: i32 =
    offset_i32(offset_of!(FaultConfig, struct_write_offset));
pub(crate) const PREVIOUS_HANDLER: i32 = offset_i32(offset_of!(FaultConfig, previous_handler));
pub(crate) const PREVIOUS_HANDLER_TAKES_INFO: i32 =
    offset_i32(offset_of!(FaultConfig, previous_handler_takes_info));
pub(crate) const RANGES: i32 = offset_i32(offset_of!(FaultConfig, ranges));
pub(crate) const RANGE_SIZE: i32 = offset_i32(size_of::<TrackedRange>());

/// Byte offset of the `index`th tracked range.
pub(crate) const fn range_offset(index: usize) -> i32 {
    assert!(index < MAX_TRACKED_RANGES);
    offset_i32(offset_of!(FaultConfig, ranges) + index * size_of::<TrackedRange>())
}
pub(crate) const RANGE_ACTIVE: i32 = offset_i32(offset_of!(TrackedRange, active));
pub(crate) const RANGE_START: i32 = offset_i32(offset_of!(TrackedRange, start));
pub(crate) const RANGE_END: i32 = offset_i32(offset_of!(TrackedRange, end));
pub(crate) const RANGE_CALLBACK: i32 = offset_i32(offset_of!(TrackedRange, callback));

const_assert_eq!(STRUCT_ADDRESS_OFFSET, 0);
const_assert_eq!(STRUCT_WRITE_OFFSET, 4);
const_assert_eq!(PREVIOUS_HANDLER, 8);
const_assert_eq!(PREVIOUS_HANDLER_TAKES_INFO, 16);
const_assert_eq!(RANGES, 24);
const_assert_eq!(RANGE_ACTIVE, 0);
const_assert_eq!(RANGE_START, 8);
const_assert_eq!(RANGE_END, 16);
const_assert_eq!(RANGE_CALLBACK, 24);
const_assert_eq!(RANGE_SIZE, 32);
const_assert_eq!(size_of::<FaultConfig>(), 24 + 32 * MAX_TRACKED_RANGES);

impl TrackedRange {
    const fn new() -> Self {
        Self {
            active: AtomicI32::new(0),
            claimed: AtomicU32::new(0),
            start: AtomicU64::new(0),
            end: AtomicU64::new(0),
            callback: AtomicUsize::new(0),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }
}

impl fmt::Debug for TrackedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedRange")
            .field("active", &self.is_active())
            .field("claimed", &(self.claimed.load(Ordering::Relaxed) != 0))
            .field(
                "range",
                &(self.start.load(Ordering::Relaxed)..self.end.load(Ordering::Relaxed)),
            )
            .field(
                "callback",
                &format_args!("{:#x}", self.callback.load(Ordering::Relaxed)),
            )
            .finish()
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (previous_handler, takes_info) = self.previous_handler();
        f.debug_struct("FaultConfig")
            .field(
                "struct_address_offset",
                &self.struct_address_offset.load(Ordering::Relaxed),
            )
            .field(
                "struct_write_offset",
                &self.struct_write_offset.load(Ordering::Relaxed),
            )
            .field("previous_handler", &format_args!("{previous_handler:#x}"))
            .field("previous_handler_takes_info", &takes_info)
            .field("ranges", &self.ranges)
            .finish()
    }
}

impl FaultConfig {
    pub const fn new() -> Self {
        Self {
            struct_address_offset: AtomicI32::new(0),
            struct_write_offset: AtomicI32::new(0),
            previous_handler: AtomicUsize::new(0),
            previous_handler_takes_info: AtomicI32::new(0),
            ranges: [const { TrackedRange::new() }; MAX_TRACKED_RANGES],
        }
    }

    /// Starts tracking accesses to `start..end`.
    ///
    /// Returns `false` if all [`MAX_TRACKED_RANGES`] slots are in use.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty.
    pub fn add_tracked_region(&self, start: u64, end: u64, callback: TrackingCallback) -> bool {
        assert!(start < end, "tracked range {start:#x}..{end:#x} is empty");

        for (index, slot) in self.ranges.iter().enumerate() {
            if slot
                .claimed
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            slot.start.store(start, Ordering::Relaxed);
            slot.end.store(end, Ordering::Relaxed);
            slot.callback.store(callback as usize, Ordering::Relaxed);
            // publish the slot last, readers skip inactive slots
            slot.active.store(1, Ordering::Release);

            tracing::debug!(index, start, end, "tracking range");
            return true;
        }

        tracing::warn!(start, end, "all tracked range slots are in use");
        false
    }

    /// Stops tracking the range that starts at `start`.
    ///
    /// Returns `false` if no active range starts there.
    pub fn remove_tracked_region(&self, start: u64) -> bool {
        for (index, slot) in self.ranges.iter().enumerate() {
            if !slot.is_active() || slot.start.load(Ordering::Relaxed) != start {
                continue;
            }

            // retire the slot first so the trampoline stops considering it
            if slot
                .active
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            slot.callback.store(0, Ordering::Relaxed);
            slot.start.store(0, Ordering::Relaxed);
            slot.end.store(0, Ordering::Relaxed);
            slot.claimed.store(0, Ordering::Release);

            tracing::debug!(index, start, "stopped tracking range");
            return true;
        }

        false
    }

    /// Returns the currently tracked ranges.
    pub fn tracked_regions(&self) -> impl Iterator<Item = core::ops::Range<u64>> + '_ {
        self.ranges.iter().filter(|slot| slot.is_active()).map(|slot| {
            slot.start.load(Ordering::Relaxed)..slot.end.load(Ordering::Relaxed)
        })
    }

    /// Returns the chained handler's address and whether it takes the three-argument form.
    pub fn previous_handler(&self) -> (usize, bool) {
        (
            self.previous_handler.load(Ordering::Acquire),
            self.previous_handler_takes_info.load(Ordering::Acquire) != 0,
        )
    }

    pub(crate) fn set_struct_offsets(&self, address: i32, write: i32) {
        self.struct_address_offset.store(address, Ordering::Release);
        self.struct_write_offset.store(write, Ordering::Release);
    }

    pub(crate) fn set_previous_handler(&self, handler: usize, takes_info: bool) {
        self.previous_handler_takes_info
            .store(i32::from(takes_info), Ordering::Release);
        self.previous_handler.store(handler, Ordering::Release);
    }
}
