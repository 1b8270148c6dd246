// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The `extern "C"` ABI surface (spec §6): `InitParameters`, `CreateVFS`,
//! `ConnectVFS`, `DisconnectVFS`, `ClearVirtualMappings`, `VirtualLinkFile`,
//! `VirtualLinkDirectoryStatic`, `CreateProcessHooked`, `GetLogMessages`.
//! This crate owns the C-compatible type layout and the UTF-16 marshaling;
//! it has no logic of its own beyond translating these calls into
//! `usvfs_core`/`usvfs_hooks` calls and reporting success as a `bool`, the
//! way a host process embedding this engine through a C header expects.

use std::ffi::c_void;

use usvfs_core::context::{CrashDumpsType, LogLevel, Parameters};
use usvfs_core::Context;

const INSTANCE_NAME_CAPACITY: usize = 60;
const DUMPS_PATH_CAPACITY: usize = 260;

/// Mirrors the original's `USVFSParameters`: a fixed-layout, UTF-16 struct
/// a C caller can embed by value. `InitParameters` fills one of these;
/// `CreateVFS`/`ConnectVFS` read it back.
#[repr(C)]
pub struct UsvfsParameters {
    pub instance_name: [u16; INSTANCE_NAME_CAPACITY],
    pub debug_mode: i32,
    pub log_level: i32,
    pub crash_dumps_type: i32,
    pub crash_dumps_path: [u16; DUMPS_PATH_CAPACITY],
}

fn copy_wide(dest: &mut [u16], text: &str) {
    let mut encoded = text.encode_utf16();
    let mut i = 0;
    while i + 1 < dest.len() {
        match encoded.next() {
            Some(unit) => {
                dest[i] = unit;
                i += 1;
            }
            None => break,
        }
    }
    dest[i] = 0;
}

fn wide_to_string(src: &[u16]) -> String {
    let len = src.iter().position(|&c| c == 0).unwrap_or(src.len());
    String::from_utf16_lossy(&src[..len])
}

fn log_level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Trace,
        1 => LogLevel::Debug,
        3 => LogLevel::Warning,
        4 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

fn crash_dumps_type_from_i32(kind: i32) -> CrashDumpsType {
    match kind {
        1 => CrashDumpsType::Mini,
        2 => CrashDumpsType::Data,
        3 => CrashDumpsType::Full,
        _ => CrashDumpsType::None,
    }
}

fn params_to_parameters(params: &UsvfsParameters) -> Parameters {
    Parameters {
        instance_name: wide_to_string(&params.instance_name),
        log_level: log_level_from_i32(params.log_level),
        crash_dumps_type: crash_dumps_type_from_i32(params.crash_dumps_type),
        crash_dumps_path: wide_to_string(&params.crash_dumps_path),
        process_blacklist: Vec::new(),
    }
}

/// `InitParameters(params_out, instance_name, debug, log_level, dumps_type, dumps_path)`.
///
/// # Safety
/// `params_out`, `instance_name`, and `dumps_path` must be valid,
/// NUL-terminated UTF-16 pointers (the latter two may be null to mean
/// "empty") for the duration of this call, and `params_out` must point at
/// writable memory for one [`UsvfsParameters`].
#[no_mangle]
pub unsafe extern "C" fn InitParameters(
    params_out: *mut UsvfsParameters,
    instance_name: *const u16,
    debug: i32,
    log_level: i32,
    dumps_type: i32,
    dumps_path: *const u16,
) {
    // SAFETY: `params_out` is a valid, writable, aligned pointer per this
    // function's safety contract.
    let params = unsafe { &mut *params_out };
    params.instance_name = [0u16; INSTANCE_NAME_CAPACITY];
    params.crash_dumps_path = [0u16; DUMPS_PATH_CAPACITY];

    if !instance_name.is_null() {
        // SAFETY: caller guarantees a NUL-terminated string here.
        let name = unsafe { read_wide_cstr(instance_name) };
        copy_wide(&mut params.instance_name, &name);
    }
    if !dumps_path.is_null() {
        // SAFETY: same contract as `instance_name` above.
        let path = unsafe { read_wide_cstr(dumps_path) };
        copy_wide(&mut params.crash_dumps_path, &path);
    }
    params.debug_mode = debug;
    params.log_level = if debug != 0 { log_level.min(1) } else { log_level };
    params.crash_dumps_type = dumps_type;
}

/// # Safety
/// `ptr` must point at a NUL-terminated UTF-16 string.
unsafe fn read_wide_cstr(ptr: *const u16) -> String {
    let mut len = 0usize;
    // SAFETY: caller guarantees `ptr` is NUL-terminated; we stop at the
    // first zero unit, which bounds the scan.
    while unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    // SAFETY: `len` was just measured against this same pointer.
    let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
    String::from_utf16_lossy(slice)
}

/// `CreateVFS(params)`: build a fresh shared tree. Returns `false` if the
/// engine was already initialized in this process.
///
/// # Safety
/// `params` must point at a valid [`UsvfsParameters`] for the duration of
/// this call.
#[no_mangle]
pub unsafe extern "C" fn CreateVFS(params: *const UsvfsParameters) -> i32 {
    // SAFETY: per this function's safety contract.
    let parameters = params_to_parameters(unsafe { &*params });
    #[cfg(windows)]
    {
        (unsafe { usvfs_hooks::injection::create(parameters) }).is_ok() as i32
    }
    #[cfg(not(windows))]
    {
        Context::create(parameters).is_ok() as i32
    }
}

/// `ConnectVFS(params)`: attach to a controller's tables by instance name.
///
/// # Safety
/// Same as [`CreateVFS`].
#[no_mangle]
pub unsafe extern "C" fn ConnectVFS(params: *const UsvfsParameters) -> i32 {
    // SAFETY: per this function's safety contract.
    let parameters = params_to_parameters(unsafe { &*params });
    #[cfg(windows)]
    {
        (unsafe { usvfs_hooks::injection::connect(parameters) }).is_ok() as i32
    }
    #[cfg(not(windows))]
    {
        Context::connect(parameters).is_ok() as i32
    }
}

/// `DisconnectVFS()`: block every hook, uninstall in reverse order.
#[no_mangle]
pub extern "C" fn DisconnectVFS() {
    #[cfg(windows)]
    usvfs_hooks::injection::disconnect();
}

/// `ClearVirtualMappings()`: empty both redirection tables.
#[no_mangle]
pub extern "C" fn ClearVirtualMappings() {
    if let Some(ctx) = Context::try_get() {
        ctx.clear_mappings();
    }
}

/// `VirtualLinkFile(source_real, dest_virtual, flags)`. `LINKFLAG_RECURSIVE`
/// is ignored for single-file links per spec §6.
///
/// # Safety
/// Both pointers must be NUL-terminated UTF-16 strings.
#[no_mangle]
pub unsafe extern "C" fn VirtualLinkFile(source_real: *const u16, dest_virtual: *const u16, _flags: u32) -> i32 {
    let Some(ctx) = Context::try_get() else { return 0 };
    // SAFETY: per this function's safety contract.
    let source = unsafe { read_wide_cstr(source_real) };
    // SAFETY: same contract.
    let dest = unsafe { read_wide_cstr(dest_virtual) };
    ctx.link_file(&source, &dest).is_ok() as i32
}

/// `VirtualLinkDirectoryStatic(source_real, dest_virtual, flags)`.
///
/// # Safety
/// Both pointers must be NUL-terminated UTF-16 strings.
#[no_mangle]
pub unsafe extern "C" fn VirtualLinkDirectoryStatic(
    source_real: *const u16,
    dest_virtual: *const u16,
    flags: u32,
) -> i32 {
    let Some(ctx) = Context::try_get() else { return 0 };
    // SAFETY: per this function's safety contract.
    let source = unsafe { read_wide_cstr(source_real) };
    // SAFETY: same contract.
    let dest = unsafe { read_wide_cstr(dest_virtual) };
    ctx.link_directory_static(&source, &dest, flags).is_ok() as i32
}

/// `CreateProcessHooked(...)`: like `CreateProcessW` but guarantees
/// injection even if the caller's own detour installation raced the
/// process's startup. On non-Windows this is a stub returning failure,
/// since process creation itself is out of scope off-platform.
///
/// # Safety
/// `application_name` and `command_line` must each be either null or a
/// NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn CreateProcessHooked(
    application_name: *const u16,
    command_line: *const u16,
    process_info_out: *mut c_void,
) -> i32 {
    #[cfg(windows)]
    {
        let app = if application_name.is_null() {
            None
        } else {
            // SAFETY: per this function's safety contract.
            Some(unsafe { read_wide_cstr(application_name) })
        };
        let cmd = if command_line.is_null() {
            String::new()
        } else {
            // SAFETY: same contract.
            unsafe { read_wide_cstr(command_line) }
        };
        usvfs_hooks::hooks_win::create_process_hooked(app, cmd, process_info_out) as i32
    }
    #[cfg(not(windows))]
    {
        let _ = (application_name, command_line, process_info_out);
        0
    }
}

/// `GetLogMessages(buf, size, block) -> bool`: drain one line from the
/// shared log ring into `buf`, truncating to `size - 1` UTF-16 units and
/// NUL-terminating. Returns whether a message was written.
///
/// # Safety
/// `buf` must point at writable memory for at least `size` `u16` units.
#[no_mangle]
pub unsafe extern "C" fn GetLogMessages(buf: *mut u16, size: u32, block: i32) -> i32 {
    let Some(ctx) = Context::try_get() else { return 0 };
    let Some(line) = ctx.log.pop(block != 0) else { return 0 };
    if size == 0 {
        return 0;
    }
    let capacity = (size as usize) - 1;
    let encoded: Vec<u16> = line.encode_utf16().take(capacity).collect();
    // SAFETY: caller guarantees room for `size` units; `encoded.len() <
    // size`, and we write one more unit (the terminator) within bounds.
    unsafe {
        std::ptr::copy_nonoverlapping(encoded.as_ptr(), buf, encoded.len());
        *buf.add(encoded.len()) = 0;
    }
    1
}
