// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared memory views that can be split into differently protected pieces.
//!
//! Splitting a view replaces its mapping piece by piece. Between the old mapping going away and
//! the new pieces being in place, other threads can fault on memory that is perfectly valid
//! before and after. The split therefore runs inside [`PartialUnmapState::begin_remap`] so the
//! fault handler recognizes these faults and retries them.

use core::ptr;
use core::ptr::NonNull;
use std::io;
use std::sync::Arc;

use rustix::fd::OwnedFd;
use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};

use super::PartialUnmapState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

impl Protection {
    fn flags(self) -> ProtFlags {
        match self {
            Protection::None => ProtFlags::empty(),
            Protection::Read => ProtFlags::READ,
            Protection::ReadWrite => ProtFlags::READ | ProtFlags::WRITE,
        }
    }
}

/// Page-aligned part of a [`View`], relative to the start of the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub offset: usize,
    pub len: usize,
    pub protection: Protection,
}

/// Memory backed by an anonymous file that can be mapped any number of times.
#[derive(Debug, Clone)]
pub struct SharedMemory {
    fd: Arc<OwnedFd>,
    size: usize,
}

impl SharedMemory {
    /// Creates `size` bytes of zeroed shared memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be created or resized.
    pub fn new(size: usize) -> io::Result<Self> {
        let fd = rustix::fs::memfd_create("partial-unmap", MemfdFlags::CLOEXEC)?;
        let len = u64::try_from(size).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        rustix::fs::ftruncate(&fd, len)?;

        Ok(Self {
            fd: Arc::new(fd),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Maps `len` bytes starting at `offset` of the shared memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds or not page-aligned, or if mapping fails.
    pub fn map_view(&self, offset: usize, len: usize, protection: Protection) -> io::Result<View> {
        self.check_range(offset, len)?;

        // Safety: we pass a nullptr so the kernel picks the address for us and the range was
        // checked against the file size.
        let ptr = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                protection.flags(),
                MapFlags::SHARED,
                &*self.fd,
                offset as u64,
            )
        }?;

        Ok(View {
            memory: self.clone(),
            base: NonNull::new(ptr.cast()).ok_or_else(|| io::Error::other("mmap returned null"))?,
            offset,
            len,
        })
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let page_size = rustix::param::page_size();
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.size);

        if len == 0 || !in_bounds || offset % page_size != 0 || len % page_size != 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        Ok(())
    }
}

/// A mapping of part of a [`SharedMemory`].
#[derive(Debug)]
pub struct View {
    memory: SharedMemory,
    base: NonNull<u8>,
    /// Offset of the view into the shared memory.
    offset: usize,
    len: usize,
}

// Safety: the view is plain memory, concurrent access is governed by the mapped protections.
unsafe impl Send for View {}
// Safety: see above
unsafe impl Sync for View {}

impl View {
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remaps the view in place as the given `pieces`.
    ///
    /// The view is first covered with an inaccessible placeholder, after which each piece is
    /// mapped over its part of the placeholder. Parts of the view not covered by any piece stay
    /// inaccessible. Concurrent accesses that fault while the split is in progress are retried by
    /// the fault handler.
    ///
    /// # Errors
    ///
    /// Returns an error if a piece is out of bounds or not page-aligned, or if mapping fails. The
    /// view is left inaccessible in part or in whole in that case.
    pub fn split(&self, state: &PartialUnmapState, pieces: &[Piece]) -> io::Result<()> {
        for piece in pieces {
            let in_view = piece
                .offset
                .checked_add(piece.len)
                .is_some_and(|end| end <= self.len);
            if !in_view {
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }
            self.memory.check_range(self.offset + piece.offset, piece.len)?;
        }

        let _guard = state.begin_remap();

        // Safety: the placeholder replaces exactly the range this view owns
        unsafe {
            rustix::mm::mmap_anonymous(
                self.base.as_ptr().cast(),
                self.len,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::FIXED,
            )?;
        }

        for piece in pieces {
            // Safety: the piece was checked to lie within the view above
            unsafe {
                rustix::mm::mmap(
                    self.base.as_ptr().add(piece.offset).cast(),
                    piece.len,
                    piece.protection.flags(),
                    MapFlags::SHARED | MapFlags::FIXED,
                    &*self.memory.fd,
                    (self.offset + piece.offset) as u64,
                )?;
            }
        }

        tracing::trace!(
            base = ?self.base,
            len = self.len,
            pieces = pieces.len(),
            "split view"
        );

        Ok(())
    }
}

impl Drop for View {
    fn drop(&mut self) {
        // Safety: the view owns the mapping
        unsafe {
            if let Err(err) = rustix::mm::munmap(self.base.as_ptr().cast(), self.len) {
                tracing::error!(%err, "failed to unmap view");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partial_unmap::PartialUnmapConfig;

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn views_share_memory() {
        let page = rustix::param::page_size();
        let memory = SharedMemory::new(2 * page).unwrap();
        let a = memory.map_view(0, 2 * page, Protection::ReadWrite).unwrap();
        let b = memory.map_view(page, page, Protection::Read).unwrap();

        // Safety: both views are mapped and the written page is writable through `a`
        unsafe {
            a.as_ptr().add(page).write(42);
            assert_eq!(b.as_ptr().read(), 42);
        }
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn split_keeps_contents() {
        let page = rustix::param::page_size();
        let state = PartialUnmapState::new(PartialUnmapConfig::default());
        let memory = SharedMemory::new(4 * page).unwrap();
        let view = memory.map_view(0, 4 * page, Protection::ReadWrite).unwrap();

        // Safety: the view is mapped read-write
        unsafe {
            for i in 0..4 {
                view.as_ptr().add(i * page).write(u8::try_from(i).unwrap() + 1);
            }
        }

        view.split(
            &state,
            &[
                Piece { offset: 0, len: page, protection: Protection::ReadWrite },
                Piece { offset: page, len: 3 * page, protection: Protection::Read },
            ],
        )
        .unwrap();

        // Safety: every page is still mapped at least readable
        unsafe {
            for i in 0..4 {
                assert_eq!(view.as_ptr().add(i * page).read(), u8::try_from(i).unwrap() + 1);
            }
        }
        assert_eq!(state.generation(), 1);
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn rejects_unaligned_pieces() {
        let page = rustix::param::page_size();
        let state = PartialUnmapState::new(PartialUnmapConfig::default());
        let memory = SharedMemory::new(2 * page).unwrap();
        let view = memory.map_view(0, 2 * page, Protection::ReadWrite).unwrap();

        let err = view
            .split(
                &state,
                &[Piece { offset: 1, len: page, protection: Protection::Read }],
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(state.generation(), 0);
    }
}
