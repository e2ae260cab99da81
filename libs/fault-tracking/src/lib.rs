// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Page-fault driven memory access tracking.
//!
//! Memory whose accesses should be observed is protected, and the resulting faults are routed
//! to per-range callbacks by a fault handler that is generated with Cranelift and placed in the
//! process-wide code cache. The callback typically records the page as accessed (or dirty, for
//! writes), lifts the protection and asks for the faulting instruction to be resumed.
//!
//! ```no_run
//! unsafe extern "C" fn on_access(offset: u64, page_size: u64, is_write: bool, _: u32) -> bool {
//!     // unprotect `offset..offset + page_size` and note the access
//!     true
//! }
//!
//! fault_tracking::initialize();
//! assert!(fault_tracking::add_tracked_region(0x1000_0000, 0x2000_0000, on_access));
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("fault tracking requires a 64-bit host");

mod backoff;
mod config;
mod error;
pub mod layout;
mod loom;
pub mod partial_unmap;
mod sys;
mod trampoline;

use std::sync::{Arc, OnceLock};

use code_cache::JitCacheConfig;
use jit_codegen::Compiler;
use parking_lot::Mutex;

pub use config::{FaultConfig, MAX_TRACKED_RANGES, TrackingCallback};
pub use error::Error;
use partial_unmap::{PartialUnmapConfig, PartialUnmapState, TrimmerHandle};
use trampoline::{Flavor, TrampolineParams};

pub type Result<T> = core::result::Result<T, Error>;

static CONFIG: FaultConfig = FaultConfig::new();
static PARTIAL_UNMAP: OnceLock<Arc<PartialUnmapState>> = OnceLock::new();
/// Address of the generated handler, built once and reused across reinstalls.
static TRAMPOLINE: OnceLock<usize> = OnceLock::new();
static TRIMMER: Mutex<Option<TrimmerHandle>> = Mutex::new(None);
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// The configuration block shared with the fault handler.
pub fn config() -> &'static FaultConfig {
    &CONFIG
}

/// The process-wide partial unmap state consulted by the fault handler.
pub fn partial_unmap_state() -> &'static PartialUnmapState {
    shared_partial_unmap_state()
}

fn shared_partial_unmap_state() -> &'static Arc<PartialUnmapState> {
    PARTIAL_UNMAP.get_or_init(|| Arc::new(PartialUnmapState::new(PartialUnmapConfig::default())))
}

/// Configures the process-wide partial unmap state.
///
/// Returns `false` if the state was already created, either by an earlier call or implicitly by
/// [`initialize`] or [`partial_unmap_state`].
pub fn configure_partial_unmap(config: PartialUnmapConfig) -> bool {
    PARTIAL_UNMAP
        .set(Arc::new(PartialUnmapState::new(config)))
        .is_ok()
}

/// Generates the fault handler and installs it as the process-wide handler for memory access
/// violations.
///
/// Calling this while the handler is installed is a no-op.
///
/// # Errors
///
/// Returns an error if the host is not supported, if the handler cannot be generated or placed
/// into the code cache, or if the OS refuses to install it.
pub fn try_initialize() -> Result<()> {
    let _guard = INIT_LOCK.lock();
    if sys::is_installed() {
        return Ok(());
    }

    let layout = layout::HOST.ok_or(Error::UnsupportedHost)?;
    CONFIG.set_struct_offsets(layout.address_offset, layout.write_offset);

    let handler = match TRAMPOLINE.get() {
        Some(handler) => *handler,
        None => {
            let cache = code_cache::initialize(JitCacheConfig::default())?;
            let compiler = Compiler::new_for_host()?;
            let function = trampoline::build(
                &compiler,
                &TrampolineParams {
                    flavor: Flavor::HOST,
                    layout,
                    config: &CONFIG,
                    partial_unmap: partial_unmap_state(),
                    page_size: code_cache::host_page_size() as u64,
                },
            )?;

            let handler = cache.map_pinned_function(function) as usize;
            *TRAMPOLINE.get_or_init(|| handler)
        }
    };

    // Safety: the handler was generated for this host's fault delivery convention and is pinned
    // in the process-wide code cache, which is never torn down
    unsafe { sys::install(handler as *const u8, &CONFIG) }.map_err(Error::Install)?;

    start_trimmer();

    tracing::info!(
        handler = format_args!("{handler:#x}"),
        ?layout,
        "fault tracking initialized"
    );
    Ok(())
}

/// Like [`try_initialize`], but treats failure as fatal.
///
/// # Panics
///
/// Panics if the fault handler cannot be installed, see [`try_initialize`].
pub fn initialize() {
    if let Err(err) = try_initialize() {
        panic!("failed to initialize fault tracking: {err}");
    }
}

/// Uninstalls the fault handler and reinstates the one that was active before [`initialize`].
///
/// Returns `false` if the handler was not installed.
///
/// # Errors
///
/// Returns an error if the OS refuses to reinstate the previous handler. The fault handler
/// stays installed in that case.
pub fn restore() -> Result<bool> {
    let _guard = INIT_LOCK.lock();
    sys::restore().map_err(Error::Restore)
}

/// Whether the fault handler is currently installed.
pub fn is_installed() -> bool {
    sys::is_installed()
}

/// Starts routing faults in `start..end` to `callback`.
///
/// Returns `false` if all [`MAX_TRACKED_RANGES`] slots are in use.
///
/// # Panics
///
/// Panics if the range is empty.
pub fn add_tracked_region(start: u64, end: u64, callback: TrackingCallback) -> bool {
    CONFIG.add_tracked_region(start, end, callback)
}

/// Stops routing faults of the range starting at `start`.
///
/// Returns `false` if no tracked range starts there.
pub fn remove_tracked_region(start: u64) -> bool {
    CONFIG.remove_tracked_region(start)
}

fn start_trimmer() {
    let mut trimmer = TRIMMER.lock();
    if trimmer.is_some() {
        return;
    }

    match shared_partial_unmap_state().spawn_trimmer() {
        Ok(handle) => *trimmer = Some(handle),
        // stale slots only reduce the number of threads that get retries
        Err(err) => tracing::warn!(%err, "failed to spawn the partial unmap trim thread"),
    }
}
