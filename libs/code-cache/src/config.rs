// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Default size of the address range reserved for compiled code.
pub const DEFAULT_CAPACITY: usize = 2047 * 1024 * 1024;
/// Functions start at multiples of this many bytes.
pub const DEFAULT_CODE_ALIGNMENT: usize = 4;
/// The committed part of the cache grows in steps of this many bytes.
pub const COMMIT_GRANULARITY: usize = 64 * 1024;

/// How machine code gets written into pages that are also executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Temporarily make the covering pages writable, copy, then make them executable again.
    Reprotect,
    /// The region is mapped with `MAP_JIT` and writes toggle the calling thread's JIT write
    /// protection (Apple silicon).
    JitWriteProtect,
    /// The backing memory is mapped twice, once executable and once writable, and code is copied
    /// through the writable view.
    DualMapped,
}

impl WriteStrategy {
    /// The strategy used when none is configured explicitly.
    pub const fn host_default() -> Self {
        if cfg!(all(target_vendor = "apple", target_arch = "aarch64")) {
            WriteStrategy::JitWriteProtect
        } else {
            WriteStrategy::Reprotect
        }
    }

    pub const fn is_supported(self) -> bool {
        match self {
            WriteStrategy::Reprotect => true,
            WriteStrategy::JitWriteProtect => cfg!(all(target_vendor = "apple", target_arch = "aarch64")),
            WriteStrategy::DualMapped => cfg!(any(target_os = "linux", target_os = "android")),
        }
    }
}

impl Default for WriteStrategy {
    fn default() -> Self {
        Self::host_default()
    }
}

#[derive(Debug, Clone)]
pub struct JitCacheConfig {
    /// Number of bytes available for code. The reserved address range is this rounded up to the
    /// host page size.
    pub capacity: usize,
    /// Alignment of every mapped function, must be a power of two.
    pub code_alignment: usize,
    pub write_strategy: WriteStrategy,
}

impl JitCacheConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }
}

impl Default for JitCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            code_alignment: DEFAULT_CODE_ALIGNMENT,
            write_strategy: WriteStrategy::host_default(),
        }
    }
}
