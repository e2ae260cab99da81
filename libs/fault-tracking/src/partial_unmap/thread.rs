// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! OS thread identity and liveness.

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// The kernel thread id of the calling thread.
        pub fn current_id() -> u64 {
            u64::from(rustix::thread::gettid().as_raw_nonzero().get().unsigned_abs())
        }

        /// Whether thread `tid` of this process still exists.
        pub fn is_alive(tid: u64) -> bool {
            let Ok(tid) = libc::pid_t::try_from(tid) else {
                return false;
            };
            // Safety: signal 0 only performs the existence and permission checks
            let res = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, 0) };
            res == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
        }
    } else if #[cfg(target_vendor = "apple")] {
        pub fn current_id() -> u64 {
            let mut tid = 0;
            // Safety: a null thread means the calling thread
            unsafe {
                libc::pthread_threadid_np(0, &raw mut tid);
            }
            tid
        }

        /// Darwin has no way to probe a thread id, threads are assumed to stay alive.
        pub fn is_alive(_tid: u64) -> bool {
            true
        }
    } else if #[cfg(windows)] {
        use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
        use windows_sys::Win32::System::Threading::{
            GetCurrentThreadId, GetExitCodeThread, OpenThread, THREAD_QUERY_LIMITED_INFORMATION,
        };

        pub fn current_id() -> u64 {
            // Safety: ffi call without preconditions
            u64::from(unsafe { GetCurrentThreadId() })
        }

        pub fn is_alive(tid: u64) -> bool {
            let Ok(tid) = u32::try_from(tid) else {
                return false;
            };

            // Safety: ffi calls, the handle is closed before returning
            unsafe {
                let handle = OpenThread(THREAD_QUERY_LIMITED_INFORMATION, 0, tid);
                if handle.is_null() {
                    return false;
                }

                let mut code = 0;
                let ok = GetExitCodeThread(handle, &raw mut code) != 0;
                CloseHandle(handle);

                #[expect(clippy::cast_sign_loss, reason = "STILL_ACTIVE is a positive NTSTATUS")]
                let still_active = STILL_ACTIVE as u32;
                !ok || code == still_active
            }
        }
    } else {
        pub fn current_id() -> u64 {
            // Safety: ffi call without preconditions
            unsafe { libc::pthread_self() as u64 }
        }

        pub fn is_alive(_tid: u64) -> bool {
            true
        }
    }
}
