// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;
use core::ptr;
use core::ptr::NonNull;
use std::io;

use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
    PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, VirtualAlloc, VirtualFree, VirtualProtect,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

use super::{align_down, align_up};
use crate::{Error, WriteStrategy};

pub(crate) fn page_size() -> usize {
    // Safety: `GetSystemInfo` only writes to the provided struct
    let info = unsafe {
        let mut info: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut info);
        info
    };
    usize::try_from(info.dwPageSize).expect("page size overflows usize")
}

/// A reserved range of address space holding executable code.
///
/// Pages start out reserved and get committed as readable + executable by [`Region::commit`].
#[derive(Debug)]
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the region is plain memory, all mutation goes through `&self` methods whose callers
// (the code cache) serialize writes behind a lock.
unsafe impl Send for Region {}
// Safety: see above
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn reserve(len: usize, strategy: WriteStrategy) -> crate::Result<Self> {
        if strategy != WriteStrategy::Reprotect {
            return Err(Error::UnsupportedStrategy(strategy));
        }

        // Safety: we pass a nullptr so the system picks the address for us.
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
        let base = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::Reserve {
            size: len,
            err: io::Error::last_os_error(),
        })?;

        Ok(Self { base, len })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn commit(&self, range: Range<usize>) -> crate::Result<()> {
        assert!(range.end <= self.len);

        // Safety: the range lies within our reservation
        let ptr = unsafe {
            VirtualAlloc(
                self.base.as_ptr().add(range.start).cast(),
                range.len(),
                MEM_COMMIT,
                PAGE_EXECUTE_READ,
            )
        };
        if ptr.is_null() {
            return Err(Error::Protect(io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Copies `code` to `offset` and invalidates the instruction cache for it.
    ///
    /// # Safety
    ///
    /// The destination must be committed and no other thread may be executing, or about to
    /// execute, code in `offset..offset + code.len()`.
    pub(crate) unsafe fn write(&self, offset: usize, code: &[u8]) -> crate::Result<()> {
        assert!(offset + code.len() <= self.len);

        let page_size = page_size();
        let pages = align_down(offset, page_size)..align_up(offset + code.len(), page_size);

        // Other functions may share the first and last page and may be running right now, so
        // the pages have to stay executable while we write.
        self.protect(pages.clone(), PAGE_EXECUTE_READWRITE)?;
        // Safety: bounds checked above, the pages are writable and the caller guarantees
        // exclusive access
        let dst = unsafe {
            let dst = self.base.as_ptr().add(offset);
            ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
            dst
        };
        self.protect(pages, PAGE_EXECUTE_READ)?;

        // Safety: `dst..dst + code.len()` lies within the region
        unsafe {
            flush_icache(dst, code.len());
        }

        Ok(())
    }

    fn protect(&self, range: Range<usize>, protection: PAGE_PROTECTION_FLAGS) -> crate::Result<()> {
        let mut old = 0;
        // Safety: callers ensure the range lies within the region
        let ok = unsafe {
            VirtualProtect(
                self.base.as_ptr().add(range.start).cast(),
                range.len(),
                protection,
                &mut old,
            )
        };
        if ok == 0 {
            return Err(Error::Protect(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Safety: The code cache guarantees no references to code remain after this.
        let ok = unsafe { VirtualFree(self.base.as_ptr().cast(), 0, MEM_RELEASE) };
        assert_ne!(ok, 0, "VirtualFree failed: {}", io::Error::last_os_error());
    }
}

/// Makes freshly written code visible to instruction fetch.
///
/// # Safety
///
/// `ptr..ptr + len` must be mapped.
pub(crate) unsafe fn flush_icache(ptr: *const u8, len: usize) {
    // Safety: ensured by the caller
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), ptr.cast(), len);
    }
}
