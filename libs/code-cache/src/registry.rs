// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use jit_codegen::UnwindInfo;

/// A function placed in the code cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Offset of the first byte of the function from the start of the cache.
    pub offset: usize,
    /// Size of the function in bytes, before alignment padding.
    pub size: usize,
    pub unwind_info: Option<Arc<UnwindInfo>>,
    /// Pinned functions survive [`Registry::clear`] and cannot be unmapped.
    pub pinned: bool,
}

impl CacheEntry {
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    #[inline]
    pub fn contains(&self, offset: usize) -> bool {
        self.offset <= offset && offset < self.end()
    }
}

/// Offset-sorted table of cache entries, used to map code addresses back to functions.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<CacheEntry>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &CacheEntry> + '_ {
        self.entries.iter()
    }

    /// Inserts `entry` at its sorted position.
    ///
    /// # Panics
    ///
    /// Debug builds panic if the entry overlaps an existing one.
    pub fn insert(&mut self, entry: CacheEntry) {
        let index = self
            .entries
            .partition_point(|existing| existing.offset < entry.offset);

        debug_assert!(
            index == 0 || self.entries[index - 1].end() <= entry.offset,
            "code cache entries overlap"
        );
        debug_assert!(
            self.entries
                .get(index)
                .is_none_or(|next| entry.end() <= next.offset),
            "code cache entries overlap"
        );

        self.entries.insert(index, entry);
    }

    /// Looks up the entry covering `offset`.
    pub fn try_find(&self, offset: usize) -> Option<&CacheEntry> {
        let index = self.index_of(offset)?;
        Some(&self.entries[index])
    }

    /// Returns the entry that *starts* at `offset`.
    pub fn get(&self, offset: usize) -> Option<&CacheEntry> {
        let index = self
            .entries
            .binary_search_by_key(&offset, |entry| entry.offset)
            .ok()?;
        Some(&self.entries[index])
    }

    /// Removes and returns the entry that *starts* at `offset`.
    pub fn remove(&mut self, offset: usize) -> Option<CacheEntry> {
        let index = self
            .entries
            .binary_search_by_key(&offset, |entry| entry.offset)
            .ok()?;
        Some(self.entries.remove(index))
    }

    /// Removes and returns every entry that is not pinned.
    pub fn clear(&mut self) -> Vec<CacheEntry> {
        let (pinned, cleared) = core::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.pinned);
        self.entries = pinned;
        cleared
    }

    fn index_of(&self, offset: usize) -> Option<usize> {
        // index of the last entry with `start <= offset`
        let index = match self
            .entries
            .binary_search_by_key(&offset, |entry| entry.offset)
        {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };

        self.entries[index].contains(offset).then_some(index)
    }
}
