// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Process-Injection Control Plane (component C6): propagates the engine
//! into a suspended child via the classic `CreateRemoteThread` +
//! `LoadLibraryW` technique, then has the child's freshly-loaded copy of
//! this same DLL call back into its own exported `ConnectVFS` so it
//! attaches to the parent's shared-memory tables rather than starting
//! empty.
//!
//! Everything here is `cfg(windows)`; `usvfs-core` has no notion of
//! processes at all.

#![cfg(windows)]

use std::sync::OnceLock;

use usvfs_core::context::Parameters;
use usvfs_core::error::{Error, Result};
use usvfs_core::Context;

use crate::detour::{self, AnyHook};
use crate::hooks_win;

static INSTALLED_HOOKS: OnceLock<std::sync::Mutex<Vec<Box<dyn AnyHook>>>> = OnceLock::new();

/// `CreateVFS`: build a fresh context and install every hook. Called once
/// from the controller process.
///
/// # Safety
/// Must run before any other thread can call a hooked API, i.e. as early
/// as possible in `DllMain`'s `DLL_PROCESS_ATTACH`.
pub unsafe fn create(parameters: Parameters) -> Result<()> {
    Context::create(parameters)?;
    let hooks = unsafe { hooks_win::install_all() }?;
    INSTALLED_HOOKS
        .get_or_init(|| std::sync::Mutex::new(Vec::new()))
        .lock()
        .unwrap()
        .extend(hooks);
    Ok(())
}

/// `ConnectVFS`: attach to a controller's shared-memory tables (by
/// `instance_name`) and install every hook, the path an injected child
/// takes.
///
/// # Safety
/// Same requirement as [`create`].
pub unsafe fn connect(parameters: Parameters) -> Result<()> {
    Context::connect(parameters)?;
    let hooks = unsafe { hooks_win::install_all() }?;
    INSTALLED_HOOKS
        .get_or_init(|| std::sync::Mutex::new(Vec::new()))
        .lock()
        .unwrap()
        .extend(hooks);
    Ok(())
}

/// `DisconnectVFS`: block every hook, uninstall in reverse installation
/// order, then release the block. Safe to call from `ExitProcess`'s own
/// detour, which is exactly why hooks are blocked first rather than
/// uninstalled while potentially still executing on another thread.
pub fn disconnect() {
    detour::set_block(true);
    if let Some(hooks) = INSTALLED_HOOKS.get() {
        let mut hooks = hooks.lock().unwrap();
        // SAFETY: `set_block(true)` above stops every detour body from
        // doing anything but calling straight through, so none of them
        // touch a hook mid-disable.
        unsafe { hooks_win::uninstall_all(&hooks) };
        hooks.clear();
    }
    detour::set_block(false);
}

/// Inject this same DLL into `process` (already created suspended) so it
/// loads and its `DllMain` calls `ConnectVFS` on its own, reading the
/// `instance_name` the caller-side detour stashed in the environment block
/// before process creation (see `hooks_win::create_process_internal_w_detour`).
/// `process` is a handle with at least `PROCESS_CREATE_THREAD |
/// PROCESS_VM_OPERATION | PROCESS_VM_WRITE` access, which
/// `CreateProcessInternalW`'s detour always has since it just created the
/// process itself.
pub fn inject(process: windows_sys::Win32::Foundation::HANDLE) -> Result<()> {
    let dll_path = current_dll_path()?;
    remote_load_library(process, &dll_path)
}

/// The environment variable an injected child's `DllMain` reads to learn
/// which shared-memory instance to `ConnectVFS` against.
pub const INSTANCE_ENV_VAR: &str = "USVFS_INSTANCE";

fn current_dll_path() -> Result<String> {
    use windows_sys::Win32::System::LibraryLoader::{GetModuleFileNameW, GetModuleHandleExW};

    let mut module = 0isize;
    // SAFETY: `GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS` resolves the module
    // containing this very function's code, which is always this DLL.
    let ok = unsafe {
        GetModuleHandleExW(
            windows_sys::Win32::System::LibraryLoader::GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
            current_dll_path as *const () as *const u16,
            &mut module,
        )
    };
    if ok == 0 || module == 0 {
        return Err(Error::Injection("could not resolve own module handle".to_string()));
    }
    let mut buf = vec![0u16; 4096];
    // SAFETY: `module` is a live handle just obtained above.
    let len = unsafe { GetModuleFileNameW(module, buf.as_mut_ptr(), buf.len() as u32) };
    if len == 0 {
        return Err(Error::Injection("could not resolve own module path".to_string()));
    }
    Ok(String::from_utf16_lossy(&buf[..len as usize]))
}

fn remote_load_library(process: windows_sys::Win32::Foundation::HANDLE, dll_path: &str) -> Result<()> {
    use windows_sys::Win32::System::Diagnostics::Debug::WriteProcessMemory;
    use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
    use windows_sys::Win32::System::Memory::{VirtualAllocEx, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    use windows_sys::Win32::System::Threading::CreateRemoteThread;

    let wide_path: Vec<u16> = dll_path.encode_utf16().chain(std::iter::once(0)).collect();
    let size = wide_path.len() * std::mem::size_of::<u16>();

    // SAFETY: `process` is a valid, live handle with VM-operation rights.
    let remote_buf = unsafe { VirtualAllocEx(process, std::ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
    if remote_buf.is_null() {
        return Err(Error::Injection("VirtualAllocEx failed in target process".to_string()));
    }

    let mut written = 0usize;
    // SAFETY: `remote_buf` was just reserved with room for exactly `size`
    // bytes, and `wide_path` lives for the duration of this call.
    let wrote = unsafe {
        WriteProcessMemory(
            process,
            remote_buf,
            wide_path.as_ptr() as *const core::ffi::c_void,
            size,
            &mut written,
        )
    };
    if wrote == 0 {
        return Err(Error::Injection("WriteProcessMemory failed in target process".to_string()));
    }

    let kernel32_name: Vec<u16> = "kernel32.dll".encode_utf16().chain(std::iter::once(0)).collect();
    let kernel32 = unsafe { GetModuleHandleW(kernel32_name.as_ptr()) };
    if kernel32 == 0 {
        return Err(Error::Injection("could not resolve kernel32 in this process".to_string()));
    }
    let load_library_w = unsafe { GetProcAddress(kernel32, b"LoadLibraryW\0".as_ptr()) };
    let Some(load_library_w) = load_library_w else {
        return Err(Error::Injection("LoadLibraryW export not found".to_string()));
    };

    // SAFETY: `load_library_w`'s address is valid in the target process
    // too, since kernel32 is always mapped at the same address across
    // processes on a given boot (ASLR notwithstanding on modern Windows,
    // the same caveat the original technique has always carried).
    let thread = unsafe {
        CreateRemoteThread(
            process,
            std::ptr::null(),
            0,
            Some(std::mem::transmute(load_library_w as usize)),
            remote_buf,
            0,
            std::ptr::null_mut(),
        )
    };
    if thread == 0 {
        return Err(Error::Injection("CreateRemoteThread failed".to_string()));
    }
    unsafe { windows_sys::Win32::Foundation::CloseHandle(thread) };
    Ok(())
}
