// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The "black box" function-trampoline mechanism the design treats as an
//! external collaborator: `install(name, our_fn) -> token`, `uninstall(token)`,
//! `call_original(token, ...)`, and a thread-local `set_block(bool)`. This
//! module is the concrete realization of that contract on top of the
//! `retour` crate, resolving each target by module + export name (rather
//! than a statically-linked symbol) so the one abstraction covers both
//! ordinary kernel32 exports and the undocumented internal entry points
//! the original also hooks (`CreateProcessInternalW`).

#![cfg(windows)]

use std::cell::Cell;
use std::ffi::CString;

use retour::{Function, GenericDetour};
use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

use usvfs_core::error::{Error, Result};

thread_local! {
    /// Backing store for `set_block`/`is_blocked`: disables rerouting for
    /// every hook on this thread, regardless of mutex group, used around
    /// the teardown sequence in `injection::disconnect` so no hook fires
    /// mid-uninstall.
    static BLOCKED: Cell<bool> = const { Cell::new(false) };
}

pub fn set_block(blocked: bool) {
    BLOCKED.with(|cell| cell.set(blocked));
}

pub fn is_blocked() -> bool {
    BLOCKED.with(Cell::get)
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn module_handle(module: &str) -> Result<HMODULE> {
    let wide_name = wide(module);
    // SAFETY: `wide_name` is a valid NUL-terminated UTF-16 string for the
    // duration of this call.
    let handle = unsafe { GetModuleHandleW(wide_name.as_ptr()) };
    if handle == 0 {
        return Err(Error::Injection(format!("module not loaded: {module}")));
    }
    Ok(handle)
}

fn proc_address(module: &str, proc: &str) -> Result<usize> {
    let handle = module_handle(module)?;
    let c_proc = CString::new(proc).map_err(|_| Error::Injection(format!("bad export name: {proc}")))?;
    // SAFETY: `handle` is a live module handle and `c_proc` is NUL-terminated.
    let addr = unsafe { GetProcAddress(handle, c_proc.as_ptr() as *const u8) };
    addr.map(|f| f as usize)
        .ok_or_else(|| Error::Injection(format!("export not found: {module}!{proc}")))
}

/// One installed detour. `F` is the hooked function's exact signature -
/// `retour::GenericDetour<F>` both re-targets calls made against the
/// original address and lets us invoke the original implementation back
/// out through `.call(...)`.
pub struct Hook<F: Function> {
    name: &'static str,
    detour: GenericDetour<F>,
}

impl<F: Function> Hook<F> {
    /// `install(name, our_fn) -> token`.
    ///
    /// # Safety
    /// `our_fn` must have the exact ABI of `module!proc`, and the caller
    /// must ensure no other thread is calling through the target while the
    /// detour is being enabled.
    pub unsafe fn install(module: &str, proc: &'static str, our_fn: F) -> Result<Self> {
        let target_addr = proc_address(module, proc)?;
        // SAFETY: `target_addr` was just resolved from a live export of the
        // matching name; the caller is responsible for signature accuracy.
        let target: F = unsafe { std::mem::transmute_copy(&target_addr) };
        let detour =
            GenericDetour::new(target, our_fn).map_err(|e| Error::Injection(format!("{proc}: {e}")))?;
        // SAFETY: enabling a freshly-created detour before any other thread
        // has observed `target`'s original bytes.
        unsafe { detour.enable() }.map_err(|e| Error::Injection(format!("{proc}: {e}")))?;
        Ok(Hook { name: proc, detour })
    }

    /// `call_original(token, ...)`.
    ///
    /// # Safety
    /// Must be called with arguments matching the hooked function's real
    /// ABI; this just forwards to the trampoline `retour` built when the
    /// detour was installed.
    pub unsafe fn call_original(&self, args: F::Arguments) -> F::Output {
        unsafe { self.detour.call(args) }
    }
}

/// Object-safe handle used only for bulk teardown in reverse installation
/// order; `uninstall(token)` for the one-token-at-a-time case is just
/// dropping the `Hook`, since `GenericDetour::disable` runs on drop.
pub trait AnyHook {
    fn name(&self) -> &'static str;
    /// # Safety
    /// No thread may be mid-call through the hooked function.
    unsafe fn uninstall(&self);
}

impl<F: Function> AnyHook for Hook<F> {
    fn name(&self) -> &'static str {
        self.name
    }

    unsafe fn uninstall(&self) {
        // SAFETY: delegated to the caller's safety contract on this method.
        let _ = unsafe { self.detour.disable() };
    }
}
