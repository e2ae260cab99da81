// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Recognizing faults caused by a concurrent remap.
//!
//! Replacing part of a mapping is not atomic: there is a window in which the affected pages are
//! not mapped at all. A thread touching them during that window takes a fault even though the
//! memory is valid before and after. Remapping code brackets the replacement with
//! [`PartialUnmapState::begin_remap`], and the fault handler asks
//! [`PartialUnmapState::retry_from_access_violation`] whether a fault it could not attribute to a
//! tracked range should simply be retried.
//!
//! A fault is retried if a remap happened since the faulting thread last retried, which is
//! detected through a generation counter bumped by every remap. Waiting for an in-progress remap
//! to finish is done by briefly taking the remap lock shared.

mod lock;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod remap;
pub mod thread;
mod thread_map;

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;

use lock_api::RawRwLock as _;

use self::lock::RawRwLock;
use self::thread_map::ThreadLocalMap;

/// Default number of threads whose retries can be tracked at the same time.
pub const DEFAULT_MAX_THREADS: usize = 64;
/// Default number of retries of a fault without a remap happening in between.
///
/// With `0` a fault is only retried if a remap started since the thread's last retry.
pub const DEFAULT_MAX_RETRIES: u32 = 0;
/// Default interval between two sweeps over the thread table.
pub const DEFAULT_TRIM_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialUnmapConfig {
    /// Capacity of the per-thread table, threads beyond it never have their faults retried.
    pub max_threads: usize,
    /// How often a thread may retry a fault while no remap happens.
    pub max_retries: u32,
    /// Interval of the background thread releasing table slots of exited threads.
    pub trim_interval: Duration,
}

impl Default for PartialUnmapConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            max_retries: DEFAULT_MAX_RETRIES,
            trim_interval: DEFAULT_TRIM_INTERVAL,
        }
    }
}

pub struct PartialUnmapState {
    lock: RawRwLock,
    /// Bumped by every remap.
    generation: AtomicU64,
    /// Thread id of the thread currently remapping, `0` if none.
    writer: AtomicU64,
    threads: ThreadLocalMap,
    max_retries: u32,
    trim_interval: Duration,
}

impl fmt::Debug for PartialUnmapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialUnmapState")
            .field("lock", &self.lock)
            .field("generation", &self.generation())
            .field("writer", &self.writer.load(Ordering::Relaxed))
            .field("threads", &self.threads)
            .field("max_retries", &self.max_retries)
            .field("trim_interval", &self.trim_interval)
            .finish()
    }
}

impl PartialUnmapState {
    pub fn new(config: PartialUnmapConfig) -> Self {
        Self {
            lock: RawRwLock::INIT,
            generation: AtomicU64::new(0),
            writer: AtomicU64::new(0),
            threads: ThreadLocalMap::new(config.max_threads),
            max_retries: config.max_retries,
            trim_interval: config.trim_interval,
        }
    }

    /// Number of remaps started so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of threads currently holding a slot in the retry table.
    pub fn registered_threads(&self) -> usize {
        self.threads.registered()
    }

    /// Marks the start of a remap, which lasts until the returned guard is dropped.
    ///
    /// Remaps are serialized, and faults in other threads that happen while the guard is alive
    /// are retried once it is gone.
    pub fn begin_remap(&self) -> RemapGuard<'_> {
        self.lock.lock_exclusive();
        self.writer.store(thread::current_id(), Ordering::Relaxed);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(generation, "begin remap");

        RemapGuard { state: self }
    }

    /// Decides whether an access violation of the calling thread should be retried.
    ///
    /// Called from the fault handler. Returns `false` for faults of the thread currently
    /// remapping, for threads that do not fit into the retry table and for repeated faults
    /// without a remap happening in between.
    pub fn retry_from_access_violation(&self) -> bool {
        let tid = thread::current_id();

        // the remapping thread faulting on its own placeholder is a genuine fault, waiting for
        // the lock would deadlock
        if self.writer.load(Ordering::Relaxed) == tid {
            return false;
        }

        let Some(slot) = self.threads.get_or_insert(tid) else {
            return false;
        };

        self.lock.lock_shared();
        let generation = self.generation.load(Ordering::Acquire);
        // Safety: acquired above
        unsafe {
            self.lock.unlock_shared();
        }

        slot.observe(generation, self.max_retries)
    }

    /// Releases the retry table slots of threads that exited.
    ///
    /// Returns the number of released slots.
    pub fn trim(&self) -> usize {
        let released = self.threads.trim(thread::is_alive);
        if released > 0 {
            tracing::debug!(released, "released slots of exited threads");
        }
        released
    }

    /// Starts a background thread calling [`PartialUnmapState::trim`] at the configured interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn_trimmer(self: &Arc<Self>) -> std::io::Result<TrimmerHandle> {
        let stop = Arc::new(AtomicBool::new(false));

        let thread = std::thread::Builder::new()
            .name("partial-unmap-trim".into())
            .spawn({
                let state = Arc::clone(self);
                let stop = Arc::clone(&stop);
                move || {
                    while !stop.load(Ordering::Acquire) {
                        std::thread::park_timeout(state.trim_interval);
                        state.trim();
                    }
                }
            })?;

        Ok(TrimmerHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// An in-progress remap, see [`PartialUnmapState::begin_remap`].
#[must_use = "the remap ends when the guard is dropped"]
pub struct RemapGuard<'a> {
    state: &'a PartialUnmapState,
}

impl fmt::Debug for RemapGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemapGuard")
            .field("generation", &self.state.generation())
            .finish()
    }
}

impl Drop for RemapGuard<'_> {
    fn drop(&mut self) {
        self.state.writer.store(0, Ordering::Relaxed);
        // Safety: the guard holds the exclusive lock taken in `begin_remap`
        unsafe {
            self.state.lock.unlock_exclusive();
        }
    }
}

/// Stops the background trim thread when dropped.
#[derive(Debug)]
pub struct TrimmerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TrimmerHandle {
    /// Signals the trim thread to exit and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                tracing::error!("partial unmap trim thread panicked");
            }
        }
    }
}

impl Drop for TrimmerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
