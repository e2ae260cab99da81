// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::{mem, ptr};
use std::io;

use parking_lot::Mutex;

use crate::config::FaultConfig;

/// The signal memory protection faults are reported through.
///
/// Darwin and FreeBSD raise `SIGBUS` for accesses to mapped but protected pages.
pub(crate) const FAULT_SIGNAL: libc::c_int =
    if cfg!(any(target_vendor = "apple", target_os = "freebsd")) {
        libc::SIGBUS
    } else {
        libc::SIGSEGV
    };

struct Installed {
    previous: libc::sigaction,
}

// Safety: `sigaction` is plain data, the handler addresses in it are process-global
unsafe impl Send for Installed {}

static INSTALLED: Mutex<Option<Installed>> = Mutex::new(None);

/// Installs `handler` for [`FAULT_SIGNAL`], recording the handler it replaces in `config`.
///
/// Returns `false` if a handler was already installed through this function.
///
/// # Safety
///
/// `handler` must point to a function with the `SA_SIGINFO` handler signature that stays valid
/// for as long as it is installed.
pub(crate) unsafe fn install(handler: *const u8, config: &FaultConfig) -> io::Result<bool> {
    let mut installed = INSTALLED.lock();
    if installed.is_some() {
        return Ok(false);
    }

    // Safety: querying the current action has no side effects
    let current = unsafe { query(FAULT_SIGNAL)? };
    // the handler can fire as soon as it is installed, so the chain target has to be known
    // before that
    record_previous(config, &current);

    // Safety: zeroed is a valid (empty) sigaction
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    // SA_SIGINFO gives us the faulting address and machine context, SA_ONSTACK runs the handler
    // on the alternate stack Rust installs, SA_NODEFER allows faults inside callbacks to reach
    // the chained handler.
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
    action.sa_sigaction = handler as usize;

    // Safety: `action` is fully initialized and the caller guarantees the handler is valid
    let previous = unsafe {
        libc::sigemptyset(&raw mut action.sa_mask);
        let mut previous: libc::sigaction = mem::zeroed();
        if libc::sigaction(FAULT_SIGNAL, &raw const action, &raw mut previous) != 0 {
            return Err(io::Error::last_os_error());
        }
        previous
    };

    // someone else swapped the handler between the query and the install
    if previous.sa_sigaction != current.sa_sigaction || previous.sa_flags != current.sa_flags {
        record_previous(config, &previous);
    }

    tracing::debug!(
        signal = FAULT_SIGNAL,
        handler = ?handler,
        previous = format_args!("{:#x}", previous.sa_sigaction),
        "installed fault handler"
    );

    *installed = Some(Installed { previous });
    Ok(true)
}

/// Reinstates the handler that was active before [`install`].
///
/// Returns `false` if no handler was installed.
pub(crate) fn restore() -> io::Result<bool> {
    let mut installed = INSTALLED.lock();
    let Some(Installed { previous }) = installed.take() else {
        return Ok(false);
    };

    // Safety: `previous` was handed to us by the OS
    if unsafe { libc::sigaction(FAULT_SIGNAL, &raw const previous, ptr::null_mut()) } != 0 {
        let err = io::Error::last_os_error();
        *installed = Some(Installed { previous });
        return Err(err);
    }

    tracing::debug!(signal = FAULT_SIGNAL, "restored previous fault handler");
    Ok(true)
}

pub(crate) fn is_installed() -> bool {
    INSTALLED.lock().is_some()
}

unsafe fn query(signal: libc::c_int) -> io::Result<libc::sigaction> {
    // Safety: a null action only reads the current one
    unsafe {
        let mut current: libc::sigaction = mem::zeroed();
        if libc::sigaction(signal, ptr::null(), &raw mut current) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(current)
    }
}

fn record_previous(config: &FaultConfig, previous: &libc::sigaction) {
    if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
        config.set_previous_handler(restore_default_action as usize, false);
    } else {
        let takes_info = previous.sa_flags & libc::SA_SIGINFO != 0;
        config.set_previous_handler(previous.sa_sigaction, takes_info);
    }
}

/// Stands in for a previous default or ignore disposition.
///
/// Resets the signal to its default action, so that the faulting instruction faults again once
/// the handler returns and the process terminates the way it would have without us.
extern "C" fn restore_default_action(signal: libc::c_int) {
    // Safety: resetting to SIG_DFL is async-signal-safe
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&raw mut action.sa_mask);
        libc::sigaction(signal, &raw const action, ptr::null_mut());
    }
}
