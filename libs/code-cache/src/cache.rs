// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::Arc;

use jit_codegen::{CompiledFunction, UnwindInfo};
use parking_lot::Mutex;

use crate::arena::Arena;
use crate::config::COMMIT_GRANULARITY;
use crate::registry::{CacheEntry, Registry};
use crate::sys::{self, Region, align_up};
use crate::{Error, JitCacheConfig};

/// Executable memory holding JIT compiled functions.
///
/// The cache reserves its whole address range up front and commits it in
/// [`COMMIT_GRANULARITY`] sized steps as functions get placed further into it. All operations
/// are serialized behind a single lock, so functions can be mapped from any number of compiler
/// threads.
pub struct JitCache {
    inner: Mutex<Inner>,
    base: usize,
    capacity: usize,
    code_alignment: usize,
}

struct Inner {
    region: Region,
    arena: Arena,
    registry: Registry,
    /// Number of bytes from the start of the region that are committed.
    committed: usize,
}

/// Point-in-time usage numbers of a [`JitCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub functions: usize,
    pub used_bytes: usize,
    pub committed_bytes: usize,
    pub capacity: usize,
}

impl fmt::Debug for JitCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitCache")
            .field("base", &format_args!("{:#x}", self.base))
            .field("capacity", &self.capacity)
            .field("code_alignment", &self.code_alignment)
            .finish_non_exhaustive()
    }
}

impl JitCache {
    /// Reserves address space for a new cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the address space cannot be reserved.
    pub fn new(config: JitCacheConfig) -> crate::Result<Self> {
        if config.capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        if !config.code_alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment(config.code_alignment));
        }
        if !config.write_strategy.is_supported() {
            return Err(Error::UnsupportedStrategy(config.write_strategy));
        }

        let region_len = align_up(config.capacity, sys::page_size());
        let region = Region::reserve(region_len, config.write_strategy)?;
        let base = region.as_ptr() as usize;

        tracing::debug!(
            base = format_args!("{base:#x}"),
            capacity = config.capacity,
            strategy = ?config.write_strategy,
            "reserved code cache"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                region,
                arena: Arena::new(config.capacity),
                registry: Registry::default(),
                committed: 0,
            }),
            base,
            capacity: config.capacity,
            code_alignment: config.code_alignment,
        })
    }

    /// The address of the first byte of the cache.
    pub fn as_ptr(&self) -> *const u8 {
        self.base as *const u8
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `addr` points into the cache's address range.
    pub fn contains(&self, addr: usize) -> bool {
        addr.checked_sub(self.base)
            .is_some_and(|offset| offset < self.capacity)
    }

    /// Copies `code` into the cache and returns a pointer to its executable copy.
    ///
    /// The returned pointer is only handed out after the code has been written, made executable
    /// and the instruction cache has been invalidated, so it is safe to publish to other threads
    /// right away.
    ///
    /// # Panics
    ///
    /// Panics if `code` is empty, if the cache is exhausted or if the host refuses to change the
    /// protection of cache memory. The cache is sized so that none of these happen in a correctly
    /// configured system.
    pub fn map(&self, code: &[u8], unwind_info: Option<UnwindInfo>) -> *const u8 {
        self.place(code, self.code_alignment, unwind_info, false)
    }

    /// Like [`JitCache::map`], but places the code at an address that is a multiple of `align`.
    ///
    /// The cache's own `code_alignment` is still honored if it is the stricter of the two.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two or larger than a page, and for the reasons listed
    /// in [`JitCache::map`].
    pub fn map_aligned(
        &self,
        code: &[u8],
        align: usize,
        unwind_info: Option<UnwindInfo>,
    ) -> *const u8 {
        self.place(code, align, unwind_info, false)
    }

    /// Maps a function produced by `jit-codegen` at the alignment it was compiled for.
    ///
    /// # Panics
    ///
    /// See [`JitCache::map_aligned`].
    pub fn map_function(&self, function: CompiledFunction) -> *const u8 {
        let align = function.alignment() as usize;
        let (code, unwind_info) = function.into_parts();
        self.place(&code, align, unwind_info, false)
    }

    /// Maps a function that stays in the cache for the rest of the process.
    ///
    /// Pinned functions are skipped by [`JitCache::clear`] and cannot be unmapped, so their
    /// address can be handed to the OS (e.g. as a fault handler).
    ///
    /// # Panics
    ///
    /// See [`JitCache::map_aligned`].
    pub fn map_pinned_function(&self, function: CompiledFunction) -> *const u8 {
        let align = function.alignment() as usize;
        let (code, unwind_info) = function.into_parts();
        self.place(&code, align, unwind_info, true)
    }

    fn place(
        &self,
        code: &[u8],
        align: usize,
        unwind_info: Option<UnwindInfo>,
        pinned: bool,
    ) -> *const u8 {
        assert!(!code.is_empty(), "cannot map an empty function");
        assert!(
            align.is_power_of_two() && align <= sys::page_size(),
            "unsupported code alignment {align}"
        );

        // the region is page aligned, so aligning the offset aligns the address
        let align = align.max(self.code_alignment);
        let size = align_up(code.len(), self.code_alignment);
        let mut inner = self.inner.lock();

        let Some(offset) = inner.arena.allocate_aligned(size, align) else {
            panic!(
                "JIT cache exhausted: no room for {size} bytes ({} of {} bytes free)",
                inner.arena.free_bytes(),
                self.capacity,
            );
        };

        if let Err(err) = inner.expand_if_needed(offset + size) {
            panic!("failed to commit code cache memory: {err}");
        }

        // Safety: the arena just handed us this range, nothing else lives there
        if let Err(err) = unsafe { inner.region.write(offset, code) } {
            panic!("failed to write code into the code cache: {err}");
        }

        inner.registry.insert(CacheEntry {
            offset,
            size: code.len(),
            unwind_info: unwind_info.map(Arc::new),
            pinned,
        });

        tracing::trace!(offset, size = code.len(), align, pinned, "mapped function");

        (self.base + offset) as *const u8
    }

    /// Removes the function starting at `ptr` and makes its memory available again.
    ///
    /// # Panics
    ///
    /// Panics if no function starts at `ptr` or the function is pinned.
    pub fn unmap(&self, ptr: *const u8) {
        let offset = (ptr as usize)
            .checked_sub(self.base)
            .filter(|offset| *offset < self.capacity);
        let Some(offset) = offset else {
            panic!("{ptr:p} does not point into the code cache");
        };

        let mut inner = self.inner.lock();
        let Some(entry) = inner.registry.remove(offset) else {
            panic!("no function is mapped at {ptr:p}");
        };
        if entry.pinned {
            inner.registry.insert(entry);
            panic!("the function at {ptr:p} is pinned");
        }
        inner
            .arena
            .free(entry.offset, align_up(entry.size, self.code_alignment));

        tracing::trace!(offset, size = entry.size, "unmapped function");
    }

    /// Looks up the function covering `offset` bytes from the start of the cache.
    pub fn try_find(&self, offset: usize) -> Option<CacheEntry> {
        self.inner.lock().registry.try_find(offset).cloned()
    }

    /// Looks up the function covering the absolute address `addr`.
    pub fn try_find_address(&self, addr: usize) -> Option<CacheEntry> {
        let offset = addr.checked_sub(self.base)?;
        if offset >= self.capacity {
            return None;
        }
        self.try_find(offset)
    }

    /// Unmaps every function in the cache that is not pinned.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let entries = inner.registry.clear();
        let count = entries.len();
        for entry in entries {
            inner
                .arena
                .free(entry.offset, align_up(entry.size, self.code_alignment));
        }
        tracing::debug!(count, "cleared code cache");
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            functions: inner.registry.len(),
            used_bytes: self.capacity - inner.arena.free_bytes(),
            committed_bytes: inner.committed,
            capacity: self.capacity,
        }
    }
}

impl Inner {
    fn expand_if_needed(&mut self, required: usize) -> crate::Result<()> {
        if required <= self.committed {
            return Ok(());
        }

        let new_committed = align_up(required, COMMIT_GRANULARITY).min(self.region.len());
        self.region.commit(self.committed..new_committed)?;

        tracing::debug!(
            from = self.committed,
            to = new_committed,
            "expanded committed code cache"
        );
        self.committed = new_committed;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use jit_codegen::ir::InstBuilder;

    use super::*;
    use crate::{DEFAULT_CODE_ALIGNMENT, WriteStrategy};

    fn cache(capacity: usize) -> JitCache {
        JitCache::new(JitCacheConfig::with_capacity(capacity)).unwrap()
    }

    #[test_log::test]
    fn maps_and_finds() {
        let cache = cache(64 * 1024);
        let ptr = cache.map(&[0xAA; 10], None);

        let offset = ptr as usize - cache.as_ptr() as usize;
        let entry = cache.try_find(offset + 9).unwrap();
        assert_eq!(entry.offset, offset);
        assert_eq!(entry.size, 10);
        assert!(cache.try_find(offset + 10).is_none());

        // Safety: the function was just mapped and is readable
        let bytes = unsafe { core::slice::from_raw_parts(ptr, 10) };
        assert_eq!(bytes, [0xAA; 10]);
    }

    #[test_log::test]
    fn sizes_are_aligned() {
        let cache = cache(4096);
        let a = cache.map(&[0; 3], None);
        let b = cache.map(&[0; 5], None);
        assert_eq!(b as usize - a as usize, 4);
        assert_eq!(cache.stats().used_bytes, 12);
    }

    #[test_log::test]
    fn commit_grows_in_granules() {
        let cache = cache(256 * 1024);
        assert_eq!(cache.stats().committed_bytes, 0);

        cache.map(&[0; 16], None);
        assert_eq!(cache.stats().committed_bytes, COMMIT_GRANULARITY);

        cache.map(&vec![0; COMMIT_GRANULARITY], None);
        assert_eq!(cache.stats().committed_bytes, 2 * COMMIT_GRANULARITY);
    }

    #[test_log::test]
    #[should_panic(expected = "JIT cache exhausted")]
    fn exhaustion_is_fatal() {
        let cache = cache(64);
        cache.map(&[0; 64], None);
        cache.map(&[0; 4], None);
    }

    #[test_log::test]
    #[should_panic(expected = "no function is mapped")]
    fn unmap_requires_function_start() {
        let cache = cache(4096);
        let ptr = cache.map(&[0; 16], None);
        // Safety: still inside the mapped function
        cache.unmap(unsafe { ptr.add(4) });
    }

    #[test_log::test]
    fn clear_releases_everything() {
        let cache = cache(4096);
        for size in [8, 16, 32] {
            cache.map(&vec![0; size], None);
        }
        cache.clear();

        let stats = cache.stats();
        assert_eq!(stats.functions, 0);
        assert_eq!(stats.used_bytes, 0);
    }

    #[test_log::test]
    fn map_aligned_honors_alignment() {
        let cache = cache(4096);
        let a = cache.map(&[0; 4], None);
        let b = cache.map_aligned(&[0; 8], 64, None);
        assert_eq!(b as usize % 64, 0);
        assert_eq!(b as usize - a as usize, 64);

        // the padding in between is still usable
        let c = cache.map(&[0; 4], None);
        assert_eq!(c as usize - a as usize, 4);

        // weaker alignments fall back to the configured one
        let d = cache.map_aligned(&[0; 4], 1, None);
        assert_eq!(d as usize % DEFAULT_CODE_ALIGNMENT, 0);
    }

    #[test_log::test]
    #[should_panic(expected = "unsupported code alignment")]
    fn map_aligned_rejects_odd_alignments() {
        let cache = cache(4096);
        cache.map_aligned(&[0; 4], 24, None);
    }

    #[test_log::test]
    fn try_find_address_bounds() {
        let cache = cache(64 * 1024);
        let base = cache.as_ptr() as usize;
        let _head = cache.map(&[0; 32], None);
        let ptr = cache.map(&[0; 20], None);
        let o = ptr as usize - base;

        assert_eq!(cache.try_find_address(base + o).unwrap().offset, o);
        assert_eq!(cache.try_find_address(base + o + 19).unwrap().offset, o);
        assert!(cache.try_find_address(base + o + 20).is_none());
        assert!(cache.try_find_address(base - 1).is_none());
        assert!(cache.try_find_address(0).is_none());
        assert!(cache.try_find_address(base + cache.capacity()).is_none());
        assert!(cache.try_find_address(usize::MAX).is_none());
    }

    #[test]
    fn contains_covers_the_capacity() {
        let cache = cache(8192);
        let base = cache.as_ptr() as usize;

        assert!(!cache.contains(base - 1));
        assert!(cache.contains(base));
        assert!(cache.contains(base + 8191));
        assert!(!cache.contains(base + cache.capacity()));
    }

    #[test_log::test]
    fn pinned_functions_survive_clear() {
        let compiler = jit_codegen::Compiler::new_for_host().unwrap();
        let function = || {
            compiler
                .build_function("nop", compiler.signature(), |builder, _| {
                    builder.ins().return_(&[]);
                })
                .unwrap()
        };

        let cache = cache(64 * 1024);
        let pinned = cache.map_pinned_function(function());
        let loose = cache.map_function(function());
        let pinned_offset = pinned as usize - cache.as_ptr() as usize;
        let pinned_len = cache.try_find(pinned_offset).unwrap().size;

        cache.clear();
        assert_eq!(cache.stats().functions, 1);
        assert!(cache.try_find(pinned_offset).unwrap().pinned);
        assert!(cache.try_find_address(loose as usize).is_none());

        // new code never lands on top of the pinned function
        for _ in 0..16 {
            let ptr = cache.map(&[0xCC; 64], None) as usize;
            assert!(
                ptr + 64 <= pinned as usize || pinned as usize + pinned_len <= ptr,
                "{ptr:#x} overlaps the pinned function"
            );
        }
    }

    #[test_log::test]
    #[should_panic(expected = "is pinned")]
    fn pinned_functions_cannot_be_unmapped() {
        let compiler = jit_codegen::Compiler::new_for_host().unwrap();
        let function = compiler
            .build_function("nop", compiler.signature(), |builder, _| {
                builder.ins().return_(&[]);
            })
            .unwrap();

        let cache = cache(4096);
        let ptr = cache.map_pinned_function(function);
        cache.unmap(ptr);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(matches!(
            JitCache::new(JitCacheConfig::with_capacity(0)),
            Err(Error::ZeroCapacity)
        ));
        assert!(matches!(
            JitCache::new(JitCacheConfig {
                code_alignment: 3,
                ..JitCacheConfig::with_capacity(4096)
            }),
            Err(Error::InvalidAlignment(3))
        ));
    }

    #[test_log::test]
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn dual_mapped_writes_are_visible() {
        let cache = JitCache::new(JitCacheConfig {
            write_strategy: WriteStrategy::DualMapped,
            ..JitCacheConfig::with_capacity(64 * 1024)
        })
        .unwrap();

        let ptr = cache.map(&[1, 2, 3, 4], None);
        // Safety: the function was just mapped and is readable
        let bytes = unsafe { core::slice::from_raw_parts(ptr, 4) };
        assert_eq!(bytes, [1, 2, 3, 4]);
    }

    #[test]
    #[cfg(windows)]
    fn dual_mapping_is_unsupported_on_windows() {
        assert!(matches!(
            JitCache::new(JitCacheConfig {
                write_strategy: WriteStrategy::DualMapped,
                ..JitCacheConfig::with_capacity(4096)
            }),
            Err(Error::UnsupportedStrategy(WriteStrategy::DualMapped))
        ));
    }
}
