// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executable memory for JIT compiled code.
//!
//! [`JitCache`] owns a reserved range of address space, places functions in it with a first-fit
//! [`Arena`](arena::Arena) and keeps an offset-sorted [`Registry`](registry::Registry) so that
//! code addresses (e.g. the program counter of a faulting instruction) can be mapped back to the
//! function and its unwind information.
//!
//! Most users go through the process-wide cache set up by [`initialize`].

pub mod arena;
mod cache;
mod config;
mod error;
pub mod registry;
mod sys;

use std::sync::OnceLock;

use jit_codegen::UnwindInfo;
use parking_lot::Mutex;

pub use cache::{CacheStats, JitCache};
pub use config::{
    COMMIT_GRANULARITY, DEFAULT_CAPACITY, DEFAULT_CODE_ALIGNMENT, JitCacheConfig, WriteStrategy,
};
pub use error::Error;
pub use registry::CacheEntry;

pub type Result<T> = core::result::Result<T, Error>;

static CACHE: OnceLock<JitCache> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Sets up the process-wide code cache.
///
/// Calling this again after a successful call is a no-op that returns the existing cache, the
/// new `config` is ignored in that case.
///
/// # Errors
///
/// Returns an error if the cache could not be created, see [`JitCache::new`].
pub fn initialize(config: JitCacheConfig) -> Result<&'static JitCache> {
    if let Some(cache) = CACHE.get() {
        return Ok(cache);
    }

    let _guard = INIT_LOCK.lock();
    if let Some(cache) = CACHE.get() {
        return Ok(cache);
    }

    let cache = JitCache::new(config)?;
    Ok(CACHE.get_or_init(|| cache))
}

/// Returns the process-wide code cache if it has been initialized.
pub fn global() -> Option<&'static JitCache> {
    CACHE.get()
}

fn expect_global() -> &'static JitCache {
    global().expect("code cache is not initialized")
}

/// Maps `code` into the process-wide cache.
///
/// # Panics
///
/// Panics if the cache is not initialized, or for any of the reasons listed in
/// [`JitCache::map`].
pub fn map(code: &[u8], unwind_info: Option<UnwindInfo>) -> *const u8 {
    expect_global().map(code, unwind_info)
}

/// Unmaps the function starting at `ptr` from the process-wide cache.
///
/// # Panics
///
/// Panics if the cache is not initialized or no function starts at `ptr`.
pub fn unmap(ptr: *const u8) {
    expect_global().unmap(ptr);
}

/// Looks up the function covering `offset` in the process-wide cache.
pub fn try_find(offset: usize) -> Option<CacheEntry> {
    global()?.try_find(offset)
}

/// The page size of the host, the granularity code cache memory is protected in.
pub fn host_page_size() -> usize {
    sys::page_size()
}
