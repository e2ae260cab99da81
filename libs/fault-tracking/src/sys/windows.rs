// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ffi::c_void;
use core::mem;
use std::io;

use parking_lot::Mutex;
use windows_sys::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, EXCEPTION_POINTERS, RemoveVectoredExceptionHandler,
};

use crate::config::FaultConfig;

/// Handle returned by `AddVectoredExceptionHandler`.
struct Installed(usize);

static INSTALLED: Mutex<Option<Installed>> = Mutex::new(None);

type VectoredHandler = unsafe extern "system" fn(*mut EXCEPTION_POINTERS) -> i32;

/// Registers `handler` as the first vectored exception handler.
///
/// Vectored handlers form a chain the OS walks by itself, so nothing needs to be recorded in
/// `config`. Returns `false` if a handler was already installed through this function.
///
/// # Safety
///
/// `handler` must point to a function with the vectored exception handler signature that stays
/// valid for as long as it is installed.
pub(crate) unsafe fn install(handler: *const u8, _config: &FaultConfig) -> io::Result<bool> {
    let mut installed = INSTALLED.lock();
    if installed.is_some() {
        return Ok(false);
    }

    // Safety: ensured by the caller
    let handle = unsafe {
        let handler = mem::transmute::<*const u8, VectoredHandler>(handler);
        AddVectoredExceptionHandler(1, Some(handler))
    };
    if handle.is_null() {
        return Err(io::Error::last_os_error());
    }

    tracing::debug!(handler = ?handler, "installed vectored exception handler");

    *installed = Some(Installed(handle as usize));
    Ok(true)
}

/// Unregisters the handler registered by [`install`].
///
/// Returns `false` if no handler was installed.
pub(crate) fn restore() -> io::Result<bool> {
    let mut installed = INSTALLED.lock();
    let Some(Installed(handle)) = installed.take() else {
        return Ok(false);
    };

    // Safety: the handle was returned by AddVectoredExceptionHandler
    if unsafe { RemoveVectoredExceptionHandler(handle as *const c_void) } == 0 {
        let err = io::Error::last_os_error();
        *installed = Some(Installed(handle));
        return Err(err);
    }

    tracing::debug!("removed vectored exception handler");
    Ok(true)
}

pub(crate) fn is_installed() -> bool {
    INSTALLED.lock().is_some()
}
