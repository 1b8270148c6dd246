// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Windows-specific hook dispatcher (C4) and injection control plane (C6)
//! built on top of `usvfs-core`'s platform-agnostic engine. The decision
//! logic in `dispatcher`, `create_process`, and `directory_enum` is plain
//! Rust and builds on any host; only `detour`, `hooks_win`, and
//! `injection` - the modules that actually touch a live Win32 loader - are
//! `cfg(windows)`.

pub mod create_process;
pub mod dispatcher;
pub mod directory_enum;
pub mod resolver;

#[cfg(windows)]
pub mod detour;
#[cfg(windows)]
pub mod hooks_win;
#[cfg(windows)]
pub mod injection;

#[cfg(windows)]
mod dll_entry {
    use usvfs_core::context::Parameters;
    use windows_sys::Win32::Foundation::{BOOL, HINSTANCE, TRUE};
    use windows_sys::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

    /// The injected DLL's entry point. On attach, an instance name left by
    /// the parent's `CreateProcessInternalW` detour (see
    /// `hooks_win::create_process_internal_w_detour`) in this process's
    /// environment tells us which shared tables to `ConnectVFS` against; a
    /// DLL loaded by any other means (no such variable set) is inert.
    #[no_mangle]
    pub extern "system" fn DllMain(_module: HINSTANCE, reason: u32, _reserved: *mut core::ffi::c_void) -> BOOL {
        if reason == DLL_PROCESS_ATTACH {
            if let Ok(instance_name) = std::env::var(crate::injection::INSTANCE_ENV_VAR) {
                let parameters = Parameters {
                    instance_name,
                    ..Default::default()
                };
                // SAFETY: `DLL_PROCESS_ATTACH` runs with the loader lock
                // held before any other thread in this process exists.
                let _ = unsafe { crate::injection::connect(parameters) };
            }
        }
        TRUE
    }
}
