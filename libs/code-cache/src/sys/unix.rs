// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;
use core::ptr;
use core::ptr::NonNull;

use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};

use super::{align_down, align_up};
use crate::{Error, WriteStrategy};

pub(crate) fn page_size() -> usize {
    rustix::param::page_size()
}

/// A reserved range of address space holding executable code.
///
/// Pages start out inaccessible and become readable + executable once [`Region::commit`]ted.
/// How bytes get written depends on the [`WriteStrategy`] the region was reserved with.
#[derive(Debug)]
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
    strategy: WriteStrategy,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    alias: Option<Alias>,
}

/// The writable view of a dual-mapped region.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug)]
struct Alias {
    base: NonNull<u8>,
    _memfd: rustix::fd::OwnedFd,
}

// Safety: the region is plain memory, all mutation goes through `&self` methods whose callers
// (the code cache) serialize writes behind a lock.
unsafe impl Send for Region {}
// Safety: see above
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn reserve(len: usize, strategy: WriteStrategy) -> crate::Result<Self> {
        debug_assert_eq!(len % page_size(), 0);

        match strategy {
            WriteStrategy::Reprotect => {
                // Safety: we pass a nullptr so the kernel picks the address for us.
                let ptr = unsafe {
                    rustix::mm::mmap_anonymous(
                        ptr::null_mut(),
                        len,
                        ProtFlags::empty(),
                        MapFlags::PRIVATE,
                    )
                }
                .map_err(|err| Error::Reserve {
                    size: len,
                    err: err.into(),
                })?;

                Ok(Self::from_raw(ptr.cast(), len, strategy))
            }
            #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
            WriteStrategy::JitWriteProtect => {
                // `MAP_JIT` regions have to be created RWX, per-thread write protection decides
                // which of W and X is actually in effect.
                // Safety: we pass a nullptr so the kernel picks the address for us.
                let ptr = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        len,
                        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                        libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
                        -1,
                        0,
                    )
                };
                if ptr == libc::MAP_FAILED {
                    return Err(Error::Reserve {
                        size: len,
                        err: std::io::Error::last_os_error(),
                    });
                }

                Ok(Self::from_raw(ptr.cast(), len, strategy))
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            WriteStrategy::DualMapped => Self::reserve_dual_mapped(len),
            #[allow(unreachable_patterns, reason = "reachable only on some hosts")]
            _ => Err(Error::UnsupportedStrategy(strategy)),
        }
    }

    fn from_raw(base: *mut u8, len: usize, strategy: WriteStrategy) -> Self {
        Self {
            base: NonNull::new(base).expect("mmap returned a null pointer"),
            len,
            strategy,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            alias: None,
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn reserve_dual_mapped(len: usize) -> crate::Result<Self> {
        use rustix::fs::MemfdFlags;

        let to_io = |err: rustix::io::Errno| Error::Alias(err.into());

        let memfd = rustix::fs::memfd_create("code-cache", MemfdFlags::CLOEXEC).map_err(to_io)?;
        let size = u64::try_from(len).expect("region size overflows u64");
        rustix::fs::ftruncate(&memfd, size).map_err(to_io)?;

        // Safety: we pass a nullptr so the kernel picks the address for us and the memfd is
        // at least `len` bytes long.
        let exec = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::empty(),
                MapFlags::SHARED,
                &memfd,
                0,
            )
        }
        .map_err(|err| Error::Reserve {
            size: len,
            err: err.into(),
        })?;

        // Safety: see above
        let write = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::empty(),
                MapFlags::SHARED,
                &memfd,
                0,
            )
        };
        let write = match write {
            Ok(write) => write,
            Err(err) => {
                // Safety: `exec` was mapped above and never handed out
                unsafe {
                    let _ = rustix::mm::munmap(exec, len);
                }
                return Err(to_io(err));
            }
        };

        let mut region = Self::from_raw(exec.cast(), len, WriteStrategy::DualMapped);
        region.alias = Some(Alias {
            base: NonNull::new(write.cast()).expect("mmap returned a null pointer"),
            _memfd: memfd,
        });
        Ok(region)
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Makes the page-aligned `range` of the region usable.
    pub(crate) fn commit(&self, range: Range<usize>) -> crate::Result<()> {
        assert!(range.end <= self.len);
        assert_eq!(
            range.start % page_size(),
            0,
            "changing of protections isn't page-aligned",
        );

        match self.strategy {
            WriteStrategy::Reprotect => {
                self.protect(range, MprotectFlags::READ | MprotectFlags::EXEC)
            }
            // already RWX since reservation
            WriteStrategy::JitWriteProtect => Ok(()),
            WriteStrategy::DualMapped => {
                self.protect(range.clone(), MprotectFlags::READ | MprotectFlags::EXEC)?;
                self.protect_alias(range, MprotectFlags::READ | MprotectFlags::WRITE)
            }
        }
    }

    /// Copies `code` to `offset` and invalidates the instruction cache for it.
    ///
    /// # Safety
    ///
    /// The destination must be committed and no other thread may be executing, or about to
    /// execute, code in `offset..offset + code.len()`.
    pub(crate) unsafe fn write(&self, offset: usize, code: &[u8]) -> crate::Result<()> {
        assert!(offset + code.len() <= self.len);

        // Safety: bounds checked by the assertion above
        let dst = unsafe { self.base.as_ptr().add(offset) };

        match self.strategy {
            WriteStrategy::Reprotect => {
                // Other functions may share the first and last page and may be running right
                // now, so the pages have to stay executable while we write.
                let page_size = page_size();
                let pages = align_down(offset, page_size)..align_up(offset + code.len(), page_size);

                self.protect(
                    pages.clone(),
                    MprotectFlags::READ | MprotectFlags::WRITE | MprotectFlags::EXEC,
                )?;
                // Safety: the pages are writable now and the caller guarantees exclusive access
                unsafe {
                    ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
                }
                self.protect(pages, MprotectFlags::READ | MprotectFlags::EXEC)?;
            }
            #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
            WriteStrategy::JitWriteProtect => {
                // Safety: toggling write protection only affects the current thread and the
                // caller guarantees exclusive access to the destination
                unsafe {
                    pthread_jit_write_protect_np(0);
                    ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
                    pthread_jit_write_protect_np(1);
                }
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            WriteStrategy::DualMapped => {
                let alias = self.alias.as_ref().expect("dual-mapped region without alias");
                // Safety: the alias maps the same pages read-write and the caller guarantees
                // exclusive access to the destination
                unsafe {
                    ptr::copy_nonoverlapping(code.as_ptr(), alias.base.as_ptr().add(offset), code.len());
                }
            }
            #[allow(unreachable_patterns, reason = "reachable only on some hosts")]
            _ => unreachable!("region was reserved with an unsupported strategy"),
        }

        // Safety: `dst..dst + code.len()` lies within the region
        unsafe {
            flush_icache(dst, code.len());
        }

        Ok(())
    }

    fn protect(&self, range: Range<usize>, flags: MprotectFlags) -> crate::Result<()> {
        // Safety: callers ensure the range lies within the region and is page-aligned
        unsafe {
            rustix::mm::mprotect(
                self.base.as_ptr().add(range.start).cast(),
                range.len(),
                flags,
            )
        }
        .map_err(|err| Error::Protect(err.into()))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn protect_alias(&self, range: Range<usize>, flags: MprotectFlags) -> crate::Result<()> {
        let alias = self.alias.as_ref().expect("dual-mapped region without alias");
        // Safety: callers ensure the range lies within the region and is page-aligned
        unsafe {
            rustix::mm::mprotect(alias.base.as_ptr().add(range.start).cast(), range.len(), flags)
        }
        .map_err(|err| Error::Protect(err.into()))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn protect_alias(&self, _range: Range<usize>, _flags: MprotectFlags) -> crate::Result<()> {
        unreachable!("dual mapping is only available on linux")
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Safety: the code cache guarantees no references to code remain after this.
        unsafe {
            rustix::mm::munmap(self.base.as_ptr().cast(), self.len).expect("munmap failed");

            #[cfg(any(target_os = "linux", target_os = "android"))]
            if let Some(alias) = self.alias.take() {
                rustix::mm::munmap(alias.base.as_ptr().cast(), self.len).expect("munmap failed");
            }
        }
    }
}

/// Makes freshly written code visible to instruction fetch.
///
/// # Safety
///
/// `ptr..ptr + len` must be mapped.
pub(crate) unsafe fn flush_icache(ptr: *const u8, len: usize) {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
            // instruction and data caches are coherent
            let _ = (ptr, len);
        } else if #[cfg(target_vendor = "apple")] {
            // Safety: ensured by the caller
            unsafe { sys_icache_invalidate(ptr.cast_mut().cast(), len) }
        } else {
            // Safety: ensured by the caller
            unsafe { __clear_cache(ptr.cast_mut().cast(), ptr.add(len).cast_mut().cast()) }
        }
    }
}

#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
unsafe extern "C" {
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
}

#[cfg(all(
    target_vendor = "apple",
    not(any(target_arch = "x86", target_arch = "x86_64"))
))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(not(any(
    target_vendor = "apple",
    target_arch = "x86",
    target_arch = "x86_64"
)))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}
