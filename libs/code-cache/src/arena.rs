// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! First-fit free-list allocator for offsets within the code cache.
//!
//! The allocator never touches the memory it manages, it only hands out offsets into a range of
//! `capacity` bytes. The free list is kept sorted by offset and fully coalesced: no two free
//! blocks overlap or touch.

use core::fmt;
use core::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: usize,
    pub size: usize,
}

impl FreeBlock {
    #[inline]
    fn end(&self) -> usize {
        self.offset + self.size
    }
}

pub struct Arena {
    capacity: usize,
    blocks: Vec<FreeBlock>,
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("free_bytes", &self.free_bytes())
            .field("free_blocks", &self.blocks.len())
            .finish()
    }
}

impl Arena {
    /// Creates an allocator managing `[0, capacity)` as a single free block.
    pub fn new(capacity: usize) -> Self {
        let blocks = if capacity > 0 {
            vec![FreeBlock {
                offset: 0,
                size: capacity,
            }]
        } else {
            Vec::new()
        };

        Self { capacity, blocks }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_bytes(&self) -> usize {
        self.blocks.iter().map(|block| block.size).sum()
    }

    pub fn free_blocks(&self) -> impl ExactSizeIterator<Item = &FreeBlock> + '_ {
        self.blocks.iter()
    }

    /// Allocates `size` bytes from the first free block large enough to hold them.
    ///
    /// Returns `None` when no block is large enough. The runtime is O(n) in the number of free
    /// blocks.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        self.allocate_aligned(size, 1)
    }

    /// Allocates `size` bytes at an offset that is a multiple of `align`.
    ///
    /// Bytes skipped to reach the aligned offset stay in the free list.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<usize> {
        debug_assert!(size > 0, "zero-sized allocation");
        assert!(align.is_power_of_two(), "alignment {align} is not a power of two");

        let (index, offset) = self.blocks.iter().enumerate().find_map(|(index, block)| {
            let offset = block.offset.checked_next_multiple_of(align)?;
            let end = offset.checked_add(size)?;
            (end <= block.end()).then_some((index, offset))
        })?;

        let block = self.blocks[index];
        let head = FreeBlock {
            offset: block.offset,
            size: offset - block.offset,
        };
        let tail = FreeBlock {
            offset: offset + size,
            size: block.end() - (offset + size),
        };

        match (head.size > 0, tail.size > 0) {
            (true, true) => {
                self.blocks[index] = head;
                self.blocks.insert(index + 1, tail);
            }
            (true, false) => self.blocks[index] = head,
            (false, true) => self.blocks[index] = tail,
            (false, false) => {
                self.blocks.remove(index);
            }
        }

        Some(offset)
    }

    /// Returns `[offset, offset + size)` to the free list, merging it with its neighbours.
    ///
    /// # Panics
    ///
    /// Panics if the range lies outside the arena or overlaps a block that is already free.
    pub fn free(&mut self, offset: usize, size: usize) {
        let range = offset..offset + size;
        assert!(
            range.end <= self.capacity,
            "freed range {range:?} is outside of the arena"
        );

        let index = self
            .blocks
            .binary_search_by_key(&offset, |block| block.offset)
            .expect_err("double free of code cache range");

        assert!(
            !self.overlaps_neighbours(index, &range),
            "freed range {range:?} overlaps a free block"
        );

        self.blocks.insert(index, FreeBlock { offset, size });

        // merge with the following block
        if let Some(next) = self.blocks.get(index + 1).copied()
            && self.blocks[index].end() == next.offset
        {
            self.blocks[index].size += next.size;
            self.blocks.remove(index + 1);
        }

        // then with the preceding block
        if index > 0 && self.blocks[index - 1].end() == self.blocks[index].offset {
            self.blocks[index - 1].size += self.blocks[index].size;
            self.blocks.remove(index);
        }
    }

    fn overlaps_neighbours(&self, index: usize, range: &Range<usize>) -> bool {
        let prev_overlaps = index
            .checked_sub(1)
            .and_then(|i| self.blocks.get(i))
            .is_some_and(|prev| prev.end() > range.start);
        let next_overlaps = self
            .blocks
            .get(index)
            .is_some_and(|next| next.offset < range.end);

        prev_overlaps || next_overlaps
    }
}
