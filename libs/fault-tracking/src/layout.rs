// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Where the OS puts the faulting address and the read/write flag.
//!
//! On unix the address comes from `siginfo_t` and the write flag from the `ucontext_t` passed to
//! a `SA_SIGINFO` handler. On windows both come from the `EXCEPTION_RECORD` the vectored
//! exception handler receives.

/// Width of the integer the write flag is tested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    U32,
    U64,
}

/// How to derive "was this access a write" from the fault context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFlag {
    /// `*(context + write_offset) & mask != 0`
    Masked { width: Width, mask: i64 },
    /// `*(*(context + pointer_offset) + write_offset) & mask != 0`, for contexts that only hold a
    /// pointer to the machine state (Darwin's `uc_mcontext`).
    Indirect {
        pointer_offset: i32,
        width: Width,
        mask: i64,
    },
    /// Linux on aarch64 stores the exception syndrome in a list of context records starting at
    /// `context + write_offset`. The list is walked until the ESR record is found and its WnR bit
    /// is tested.
    EsrRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultLayout {
    /// Byte offset of the faulting address in the fault info struct.
    pub address_offset: i32,
    /// Byte offset of the write flag, see [`WriteFlag`] for what it is relative to.
    pub write_offset: i32,
    pub write_flag: WriteFlag,
}

/// Magic of the `esr_context` record in the aarch64 Linux signal frame.
pub(crate) const ESR_MAGIC: i64 = 0x4553_5201;
/// Offset of the ESR value inside its record.
pub(crate) const ESR_VALUE_OFFSET: i32 = 8;
/// Size of `__reserved`, the area holding the context records.
pub(crate) const ESR_SEARCH_LIMIT: i64 = 4096;
/// Write-not-Read bit of a data abort syndrome.
pub(crate) const ESR_WNR: i64 = 1 << 6;

/// `si_addr` in `siginfo_t`, and `REG_ERR` in `uc_mcontext.gregs` holding the page fault error
/// code with its write bit.
pub const LINUX_X86_64: FaultLayout = FaultLayout {
    address_offset: 16,
    write_offset: 0xC0,
    write_flag: WriteFlag::Masked {
        width: Width::U64,
        mask: 2,
    },
};

/// `si_addr` in `siginfo_t`, and `uc_mcontext.__reserved` holding the context records.
pub const LINUX_AARCH64: FaultLayout = FaultLayout {
    address_offset: 16,
    write_offset: 0x1D0,
    write_flag: WriteFlag::EsrRecord,
};

/// `si_addr` in `siginfo_t`, and `__es.__err` behind the `uc_mcontext` pointer.
pub const APPLE_X86_64: FaultLayout = FaultLayout {
    address_offset: 24,
    write_offset: 4,
    write_flag: WriteFlag::Indirect {
        pointer_offset: 48,
        width: Width::U32,
        mask: 2,
    },
};

/// `si_addr` in `siginfo_t`, and `__es.__esr` behind the `uc_mcontext` pointer.
pub const APPLE_AARCH64: FaultLayout = FaultLayout {
    address_offset: 24,
    write_offset: 8,
    write_flag: WriteFlag::Indirect {
        pointer_offset: 48,
        width: Width::U32,
        mask: ESR_WNR,
    },
};

/// `ExceptionInformation[1]` and `ExceptionInformation[0]` of the `EXCEPTION_RECORD`, the latter
/// being 1 for writes (and 8 for execute violations).
pub const WINDOWS_X64: FaultLayout = FaultLayout {
    address_offset: 0x28,
    write_offset: 0x20,
    write_flag: WriteFlag::Masked {
        width: Width::U64,
        mask: 1,
    },
};

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86_64"))] {
        pub const HOST: Option<FaultLayout> = Some(LINUX_X86_64);
    } else if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "aarch64"))] {
        pub const HOST: Option<FaultLayout> = Some(LINUX_AARCH64);
    } else if #[cfg(all(target_vendor = "apple", target_arch = "x86_64"))] {
        pub const HOST: Option<FaultLayout> = Some(APPLE_X86_64);
    } else if #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))] {
        pub const HOST: Option<FaultLayout> = Some(APPLE_AARCH64);
    } else if #[cfg(all(windows, target_pointer_width = "64"))] {
        pub const HOST: Option<FaultLayout> = Some(WINDOWS_X64);
    } else {
        /// No fault layout is known for this host.
        pub const HOST: Option<FaultLayout> = None;
    }
}
