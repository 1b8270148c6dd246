// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The Win32 detour bodies themselves: one function per intercepted
//! primitive, each following spec §4.4's template - check `set_block`,
//! enter the primitive's mutex group, reroute, call through, mutate the
//! tree on a mutating success, log.
//!
//! Every body here is a thin translation layer: wide-string marshaling in,
//! a call into `dispatcher`/`create_process`/`directory_enum`, wide-string
//! marshaling out. The actual decision logic they all delegate to is
//! exercised by the plain-Rust unit tests in those modules, since none of
//! it depends on having a live Win32 loader underneath it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, OnceLock};

use windows_sys::Win32::Foundation::{
    BOOL, ERROR_INSUFFICIENT_BUFFER, FALSE, HANDLE, HMODULE, INVALID_HANDLE_VALUE, MAX_PATH, TRUE,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_NORMAL, FINDEX_INFO_LEVELS, FINDEX_SEARCH_OPS, WIN32_FIND_DATAW,
};
use windows_sys::Win32::System::Threading::{
    PROCESS_CREATION_FLAGS, PROCESS_INFORMATION, STARTUPINFOW,
};

use usvfs_core::context::LogLevel;
use usvfs_core::mutex_group::MutexGroup;
use usvfs_core::Context;

use crate::detour::{AnyHook, Hook};
use crate::resolver::PlatformResolver;
use crate::{create_process, dispatcher};

unsafe fn wide_to_string(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0usize;
    // SAFETY: caller guarantees `ptr` is either null or NUL-terminated.
    while unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
    String::from_utf16_lossy(slice)
}

fn string_to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn ctx() -> &'static Context {
    Context::get()
}

fn resolver() -> PlatformResolver {
    PlatformResolver::default()
}

fn log_reroute(label: &str, original: &str, result: &str) {
    if original != result {
        ctx().log(LogLevel::Debug, format!("{label}: {original} -> {result}"));
    }
}

type CreateFileWFn = unsafe extern "system" fn(
    *const u16,
    u32,
    u32,
    *const SECURITY_ATTRIBUTES,
    u32,
    u32,
    HANDLE,
) -> HANDLE;

static CREATE_FILE_W: OnceLock<Hook<CreateFileWFn>> = OnceLock::new();

unsafe extern "system" fn create_file_w_detour(
    filename: *const u16,
    access: u32,
    share: u32,
    security: *const SECURITY_ATTRIBUTES,
    disposition: u32,
    flags: u32,
    template: HANDLE,
) -> HANDLE {
    let Some(hook) = CREATE_FILE_W.get() else {
        return INVALID_HANDLE_VALUE;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((filename, access, share, security, disposition, flags, template));
    }
    let original = unsafe { wide_to_string(filename) };
    let reroute = dispatcher::open_file(ctx(), &original, &resolver());
    log_reroute("CreateFileW", &reroute.original, &reroute.result);
    let rerouted = string_to_wide(&reroute.result);
    let handle = hook.call_original((
        rerouted.as_ptr(),
        access,
        share,
        security,
        disposition,
        flags,
        template,
    ));

    // Creation-capable dispositions (`CREATE_NEW` = 1, `CREATE_ALWAYS` = 2)
    // that actually produced a new file under a `CREATE_TARGET` subtree get
    // recorded, per spec §4.4 step 5.
    if handle != INVALID_HANDLE_VALUE && (disposition == 1 || disposition == 2) && reroute.was_rerouted {
        let _ = ctx().tables.main.add_file(&reroute.real_path, &reroute.result);
    }
    handle
}

type GetFileAttributesWFn = unsafe extern "system" fn(*const u16) -> u32;
static GET_FILE_ATTRIBUTES_W: OnceLock<Hook<GetFileAttributesWFn>> = OnceLock::new();

unsafe extern "system" fn get_file_attributes_w_detour(filename: *const u16) -> u32 {
    let Some(hook) = GET_FILE_ATTRIBUTES_W.get() else {
        return u32::MAX;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((filename,));
    }
    let original = unsafe { wide_to_string(filename) };
    let reroute = dispatcher::file_attributes(ctx(), &original, &resolver());
    log_reroute("GetFileAttributesW", &reroute.original, &reroute.result);
    let rerouted = string_to_wide(&reroute.result);
    hook.call_original((rerouted.as_ptr(),))
}

type SetFileAttributesWFn = unsafe extern "system" fn(*const u16, u32) -> BOOL;
static SET_FILE_ATTRIBUTES_W: OnceLock<Hook<SetFileAttributesWFn>> = OnceLock::new();

unsafe extern "system" fn set_file_attributes_w_detour(filename: *const u16, attrs: u32) -> BOOL {
    let Some(hook) = SET_FILE_ATTRIBUTES_W.get() else {
        return FALSE;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((filename, attrs));
    }
    let original = unsafe { wide_to_string(filename) };
    let reroute = dispatcher::file_attributes(ctx(), &original, &resolver());
    log_reroute("SetFileAttributesW", &reroute.original, &reroute.result);
    let rerouted = string_to_wide(&reroute.result);
    hook.call_original((rerouted.as_ptr(), attrs))
}

type DeleteFileWFn = unsafe extern "system" fn(*const u16) -> BOOL;
static DELETE_FILE_W: OnceLock<Hook<DeleteFileWFn>> = OnceLock::new();

unsafe extern "system" fn delete_file_w_detour(filename: *const u16) -> BOOL {
    let Some(hook) = DELETE_FILE_W.get() else {
        return FALSE;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((filename,));
    }
    let original = unsafe { wide_to_string(filename) };
    let reroute = dispatcher::delete_file(ctx(), &original, &resolver());
    log_reroute("DeleteFileW", &reroute.original, &reroute.result);
    let rerouted = string_to_wide(&reroute.result);
    let ok = hook.call_original((rerouted.as_ptr(),));
    if ok == TRUE {
        if let Some(node) = ctx().tables.main.find_node(&reroute.real_path) {
            let _ = ctx().tables.main.remove_from_tree(node);
        }
    }
    ok
}

type RemoveDirectoryWFn = unsafe extern "system" fn(*const u16) -> BOOL;
static REMOVE_DIRECTORY_W: OnceLock<Hook<RemoveDirectoryWFn>> = OnceLock::new();

unsafe extern "system" fn remove_directory_w_detour(path: *const u16) -> BOOL {
    let Some(hook) = REMOVE_DIRECTORY_W.get() else {
        return FALSE;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((path,));
    }
    let original = unsafe { wide_to_string(path) };
    let reroute = dispatcher::delete_file(ctx(), &original, &resolver());
    log_reroute("RemoveDirectoryW", &reroute.original, &reroute.result);
    let rerouted = string_to_wide(&reroute.result);
    let ok = hook.call_original((rerouted.as_ptr(),));
    if ok == TRUE {
        if let Some(node) = ctx().tables.main.find_node(&reroute.real_path) {
            let _ = ctx().tables.main.remove_from_tree(node);
        }
    }
    ok
}

type CreateDirectoryWFn = unsafe extern "system" fn(*const u16, *const SECURITY_ATTRIBUTES) -> BOOL;
static CREATE_DIRECTORY_W: OnceLock<Hook<CreateDirectoryWFn>> = OnceLock::new();

unsafe extern "system" fn create_directory_w_detour(
    path: *const u16,
    security: *const SECURITY_ATTRIBUTES,
) -> BOOL {
    let Some(hook) = CREATE_DIRECTORY_W.get() else {
        return FALSE;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((path, security));
    }
    let original = unsafe { wide_to_string(path) };
    let reroute = match dispatcher::create_directory(ctx(), &original, &resolver()) {
        Ok(r) => r,
        Err(_) => return FALSE,
    };
    log_reroute("CreateDirectoryW", &reroute.original, &reroute.result);
    let rerouted = string_to_wide(&reroute.result);
    let ok = hook.call_original((rerouted.as_ptr(), security));
    if ok == TRUE && reroute.was_rerouted {
        let _ = ctx().tables.main.add_file(&reroute.real_path, &reroute.result);
    }
    ok
}

type MoveFileExWFn = unsafe extern "system" fn(*const u16, *const u16, u32) -> BOOL;
static MOVE_FILE_EX_W: OnceLock<Hook<MoveFileExWFn>> = OnceLock::new();

const MOVEFILE_COPY_ALLOWED: u32 = 0x2;

unsafe extern "system" fn move_file_ex_w_detour(
    existing: *const u16,
    new: *const u16,
    flags: u32,
) -> BOOL {
    let Some(hook) = MOVE_FILE_EX_W.get() else {
        return FALSE;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((existing, new, flags));
    }
    let original_source = unsafe { wide_to_string(existing) };
    let original_dest = unsafe { wide_to_string(new) };
    let decision = dispatcher::move_file(ctx(), &original_source, &original_dest, &resolver());
    log_reroute("MoveFileExW(src)", &decision.source.original, &decision.source.result);
    log_reroute("MoveFileExW(dst)", &decision.dest.original, &decision.dest.result);

    let mut effective_flags = flags;
    if decision.force_copy_allowed {
        effective_flags |= MOVEFILE_COPY_ALLOWED;
    }

    let wide_source = string_to_wide(&decision.source.result);
    let wide_dest = string_to_wide(&decision.dest.result);
    let ok = hook.call_original((wide_source.as_ptr(), wide_dest.as_ptr(), effective_flags));
    if ok == TRUE {
        if let Some(node) = ctx().tables.main.find_node(&decision.source.real_path) {
            let _ = ctx().tables.main.remove_from_tree(node);
        }
        if decision.dest.was_rerouted {
            let _ = ctx()
                .tables
                .main
                .add_file(&decision.dest.real_path, &decision.dest.result);
        }
    }
    ok
}

type CopyFileExWFn = unsafe extern "system" fn(
    *const u16,
    *const u16,
    *const core::ffi::c_void,
    *const core::ffi::c_void,
    *mut BOOL,
    u32,
) -> BOOL;
static COPY_FILE_EX_W: OnceLock<Hook<CopyFileExWFn>> = OnceLock::new();

unsafe extern "system" fn copy_file_ex_w_detour(
    existing: *const u16,
    new: *const u16,
    progress_routine: *const core::ffi::c_void,
    progress_data: *const core::ffi::c_void,
    cancel: *mut BOOL,
    flags: u32,
) -> BOOL {
    let Some(hook) = COPY_FILE_EX_W.get() else {
        return FALSE;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((existing, new, progress_routine, progress_data, cancel, flags));
    }
    let original_source = unsafe { wide_to_string(existing) };
    let original_dest = unsafe { wide_to_string(new) };
    let decision = dispatcher::move_file(ctx(), &original_source, &original_dest, &resolver());
    log_reroute("CopyFileExW(src)", &decision.source.original, &decision.source.result);
    log_reroute("CopyFileExW(dst)", &decision.dest.original, &decision.dest.result);

    let wide_source = string_to_wide(&decision.source.result);
    let wide_dest = string_to_wide(&decision.dest.result);
    let ok = hook.call_original((
        wide_source.as_ptr(),
        wide_dest.as_ptr(),
        progress_routine,
        progress_data,
        cancel,
        flags,
    ));
    if ok == TRUE && decision.dest.was_rerouted {
        let _ = ctx()
            .tables
            .main
            .add_file(&decision.dest.real_path, &decision.dest.result);
    }
    ok
}

type FindFirstFileExWFn = unsafe extern "system" fn(
    *const u16,
    FINDEX_INFO_LEVELS,
    *mut core::ffi::c_void,
    FINDEX_SEARCH_OPS,
    *const core::ffi::c_void,
    u32,
) -> HANDLE;
static FIND_FIRST_FILE_EX_W: OnceLock<Hook<FindFirstFileExWFn>> = OnceLock::new();

unsafe extern "system" fn find_first_file_ex_w_detour(
    filename: *const u16,
    info_level: FINDEX_INFO_LEVELS,
    find_data: *mut core::ffi::c_void,
    search_op: FINDEX_SEARCH_OPS,
    search_filter: *const core::ffi::c_void,
    flags: u32,
) -> HANDLE {
    let Some(hook) = FIND_FIRST_FILE_EX_W.get() else {
        return INVALID_HANDLE_VALUE;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((filename, info_level, find_data, search_op, search_filter, flags));
    }
    let original = unsafe { wide_to_string(filename) };
    let reroute = dispatcher::search_files(ctx(), &original, &resolver());
    log_reroute("FindFirstFileExW", &reroute.original, &reroute.result);
    let rerouted = string_to_wide(&reroute.result);
    let handle = hook.call_original((
        rerouted.as_ptr(),
        info_level,
        find_data,
        search_op,
        search_filter,
        flags,
    ));
    // The original query path (the virtual directory being searched) is
    // remembered so a `FindNextFileW` batch can merge in virtual-only
    // children; the query itself strips a trailing `\*` wildcard.
    if handle != INVALID_HANDLE_VALUE {
        let directory = reroute.real_path.trim_end_matches("\\*").trim_end_matches('*');
        ctx().search_handles.insert(handle as usize, directory.to_string());
        // SAFETY: a successful call just populated `find_data` as a
        // `WIN32_FIND_DATAW`, regardless of `info_level`.
        let first = unsafe { wide_to_string((*(find_data as *const WIN32_FIND_DATAW)).cFileName.as_ptr()) };
        search_cursors()
            .lock()
            .unwrap()
            .insert(handle as usize, SearchCursor::Streaming(vec![first]));
    }
    handle
}

/// Per-handle state for merging virtual-only directory children into a
/// `FindFirstFileExW`/`FindNextFileW` enumeration. While the real API is
/// still producing entries we just record their names, so that once it's
/// exhausted we know which of the tree's virtual children weren't already
/// seen; from then on we're draining the leftover virtual names instead of
/// calling through.
enum SearchCursor {
    Streaming(Vec<String>),
    Virtual(String, VecDeque<String>),
}

static SEARCH_CURSORS: OnceLock<Mutex<HashMap<usize, SearchCursor>>> = OnceLock::new();

fn search_cursors() -> &'static Mutex<HashMap<usize, SearchCursor>> {
    SEARCH_CURSORS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fills `find_data` for a synthesized virtual-only entry: the name and
/// whether the tree considers it a directory, nothing else (no caller of
/// `FindNextFileW` relies on size or timestamps for a purely virtual node).
fn write_virtual_find_data(ctx: &Context, virtual_dir: &str, name: &str, find_data: *mut WIN32_FIND_DATAW) {
    let full = format!("{}\\{}", virtual_dir.trim_end_matches('\\'), name);
    let is_directory = ctx
        .tables
        .main
        .find_node(&full)
        .map(|handle| ctx.tables.main.data(handle).is_directory)
        .unwrap_or(false);
    let wide = string_to_wide(name);
    // SAFETY: caller guarantees `find_data` points at writable memory for
    // one `WIN32_FIND_DATAW`.
    unsafe {
        let data = &mut *find_data;
        *data = std::mem::zeroed();
        data.dwFileAttributes = if is_directory {
            FILE_ATTRIBUTE_DIRECTORY
        } else {
            FILE_ATTRIBUTE_NORMAL
        };
        let len = wide.len().min(data.cFileName.len());
        data.cFileName[..len].copy_from_slice(&wide[..len]);
    }
}

type FindNextFileWFn = unsafe extern "system" fn(HANDLE, *mut WIN32_FIND_DATAW) -> BOOL;
static FIND_NEXT_FILE_W: OnceLock<Hook<FindNextFileWFn>> = OnceLock::new();

unsafe extern "system" fn find_next_file_w_detour(handle: HANDLE, find_data: *mut WIN32_FIND_DATAW) -> BOOL {
    let Some(hook) = FIND_NEXT_FILE_W.get() else {
        return FALSE;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((handle, find_data));
    }

    let key = handle as usize;
    {
        let mut cursors = search_cursors().lock().unwrap();
        if let Some(SearchCursor::Virtual(virtual_dir, pending)) = cursors.get_mut(&key) {
            return match pending.pop_front() {
                Some(name) => {
                    write_virtual_find_data(ctx(), virtual_dir, &name, find_data);
                    TRUE
                }
                None => {
                    cursors.remove(&key);
                    ctx().search_handles.remove(key);
                    FALSE
                }
            };
        }
    }

    let ok = hook.call_original((handle, find_data));
    if ok == TRUE {
        // SAFETY: a successful call just populated `find_data`.
        let name = unsafe { wide_to_string((*find_data).cFileName.as_ptr()) };
        if let Some(SearchCursor::Streaming(seen)) = search_cursors().lock().unwrap().get_mut(&key) {
            seen.push(name);
        }
        return TRUE;
    }

    // Real enumeration exhausted - merge in anything virtual-only left
    // under the directory this handle was searching.
    let Some(virtual_dir) = ctx().search_handles.get(key) else {
        return FALSE;
    };
    let seen = match search_cursors().lock().unwrap().remove(&key) {
        Some(SearchCursor::Streaming(seen)) => seen,
        _ => Vec::new(),
    };
    let merged = directory_enum::merge_entries(ctx(), &virtual_dir, &seen);
    let mut pending: VecDeque<String> = merged
        .into_iter()
        .filter(|name| !seen.iter().any(|s| usvfs_core::path::segment_eq(s, name)))
        .collect();

    match pending.pop_front() {
        Some(name) => {
            write_virtual_find_data(ctx(), &virtual_dir, &name, find_data);
            search_cursors()
                .lock()
                .unwrap()
                .insert(key, SearchCursor::Virtual(virtual_dir, pending));
            TRUE
        }
        None => {
            ctx().search_handles.remove(key);
            FALSE
        }
    }
}

type GetModuleFileNameWFn = unsafe extern "system" fn(HMODULE, *mut u16, u32) -> u32;
static GET_MODULE_FILE_NAME_W: OnceLock<Hook<GetModuleFileNameWFn>> = OnceLock::new();

unsafe extern "system" fn get_module_file_name_w_detour(
    module: HMODULE,
    buffer: *mut u16,
    size: u32,
) -> u32 {
    let Some(hook) = GET_MODULE_FILE_NAME_W.get() else {
        return 0;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((module, buffer, size));
    }
    let mut physical_buf = vec![0u16; MAX_PATH as usize * 4];
    let physical_len = hook.call_original((module, physical_buf.as_mut_ptr(), physical_buf.len() as u32));
    if physical_len == 0 {
        return 0;
    }
    let physical_path = String::from_utf16_lossy(&physical_buf[..physical_len as usize]);
    let reroute = dispatcher::module_file_name(ctx(), &physical_path, &resolver());
    log_reroute("GetModuleFileNameW", &reroute.original, &reroute.result);

    let wide_result = string_to_wide(&reroute.result);
    // spec §4.4: truncate to fit, return the truncated length, and signal
    // `ERROR_INSUFFICIENT_BUFFER` rather than the length actually needed.
    let copy_len = (wide_result.len() - 1).min(size as usize);
    unsafe {
        std::ptr::copy_nonoverlapping(wide_result.as_ptr(), buffer, copy_len);
        if copy_len < size as usize {
            *buffer.add(copy_len) = 0;
        }
    }
    if (wide_result.len() - 1) > size as usize {
        unsafe { windows_sys::Win32::Foundation::SetLastError(ERROR_INSUFFICIENT_BUFFER) };
    }
    copy_len as u32
}

type LoadLibraryExWFn = unsafe extern "system" fn(*const u16, HANDLE, u32) -> HMODULE;
static LOAD_LIBRARY_EX_W: OnceLock<Hook<LoadLibraryExWFn>> = OnceLock::new();

unsafe extern "system" fn load_library_ex_w_detour(filename: *const u16, file: HANDLE, flags: u32) -> HMODULE {
    let Some(hook) = LOAD_LIBRARY_EX_W.get() else {
        return 0;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((filename, file, flags));
    }
    let original = unsafe { wide_to_string(filename) };
    let reroute = dispatcher::load_library(ctx(), &original, &resolver());
    log_reroute("LoadLibraryExW", &reroute.original, &reroute.result);
    let rerouted = string_to_wide(&reroute.result);
    hook.call_original((rerouted.as_ptr(), file, flags))
}

/// `CreateProcessInternalW` is undocumented - no public declaration exists
/// in `windows-sys` - so its signature is spelled out here directly, the
/// same way the original resolves it purely via `GetProcAddress` rather
/// than a statically linked import. The extra trailing `*mut HANDLE`
/// parameter (a new process token handle) beyond the public
/// `CreateProcessW` is kernel32's own addition; we pass it through
/// untouched.
type CreateProcessInternalWFn = unsafe extern "system" fn(
    HANDLE,
    *const u16,
    *mut u16,
    *const SECURITY_ATTRIBUTES,
    *const SECURITY_ATTRIBUTES,
    BOOL,
    PROCESS_CREATION_FLAGS,
    *const core::ffi::c_void,
    *const u16,
    *const STARTUPINFOW,
    *mut PROCESS_INFORMATION,
    *mut HANDLE,
) -> BOOL;
static CREATE_PROCESS_INTERNAL_W: OnceLock<Hook<CreateProcessInternalWFn>> = OnceLock::new();

const CREATE_SUSPENDED: PROCESS_CREATION_FLAGS = 0x0000_0004;

unsafe extern "system" fn create_process_internal_w_detour(
    token: HANDLE,
    application_name: *const u16,
    command_line: *mut u16,
    process_attrs: *const SECURITY_ATTRIBUTES,
    thread_attrs: *const SECURITY_ATTRIBUTES,
    inherit_handles: BOOL,
    creation_flags: PROCESS_CREATION_FLAGS,
    environment: *const core::ffi::c_void,
    current_directory: *const u16,
    startup_info: *const STARTUPINFOW,
    process_info: *mut PROCESS_INFORMATION,
    new_token: *mut HANDLE,
) -> BOOL {
    let Some(hook) = CREATE_PROCESS_INTERNAL_W.get() else {
        return FALSE;
    };
    if crate::detour::is_blocked() {
        return hook.call_original((
            token,
            application_name,
            command_line,
            process_attrs,
            thread_attrs,
            inherit_handles,
            creation_flags,
            environment,
            current_directory,
            startup_info,
            process_info,
            new_token,
        ));
    }

    let app_name_str = if application_name.is_null() {
        None
    } else {
        Some(unsafe { wide_to_string(application_name) })
    };
    let command_line_str = unsafe { wide_to_string(command_line) };

    let plan = create_process::route_create_process(
        ctx(),
        app_name_str.as_deref(),
        &command_line_str,
        &resolver(),
    );

    let wide_app_name = plan.application_name.as_deref().map(string_to_wide);
    let mut wide_command_line = string_to_wide(&plan.command_line);

    // force CREATE_SUSPENDED unconditionally so injection can run before
    // any of the child's own code executes; resumed below unless the
    // caller itself asked for suspension.
    let caller_wanted_suspended = creation_flags & CREATE_SUSPENDED != 0;
    let effective_flags = creation_flags | CREATE_SUSPENDED;

    // A null `lpEnvironment` means the child inherits the environment
    // block we are about to call through with right now, which is this
    // process's own - so stashing the instance name here is enough for
    // the injected child to find it without any out-of-band channel.
    if environment.is_null() {
        let name = string_to_wide(crate::injection::INSTANCE_ENV_VAR);
        let value = string_to_wide(&ctx().parameters.instance_name);
        unsafe { windows_sys::Win32::System::Environment::SetEnvironmentVariableW(name.as_ptr(), value.as_ptr()) };
    }

    let ok = hook.call_original((
        token,
        wide_app_name.as_ref().map(|w| w.as_ptr()).unwrap_or(std::ptr::null()),
        wide_command_line.as_mut_ptr(),
        process_attrs,
        thread_attrs,
        inherit_handles,
        effective_flags,
        environment,
        current_directory,
        startup_info,
        process_info,
        new_token,
    ));

    if ok == TRUE && plan.inject {
        let info = unsafe { &*process_info };
        if crate::injection::inject(info.hProcess).is_err() {
            ctx().log(LogLevel::Error, "failed to inject into child process");
        }
        if !caller_wanted_suspended {
            unsafe { windows_sys::Win32::System::Threading::ResumeThread(info.hThread) };
        }
    }
    ok
}

type ExitProcessFn = unsafe extern "system" fn(u32) -> !;
static EXIT_PROCESS: OnceLock<Hook<ExitProcessFn>> = OnceLock::new();

unsafe extern "system" fn exit_process_detour(code: u32) -> ! {
    ctx().join_deferred();
    crate::injection::disconnect();
    match EXIT_PROCESS.get() {
        Some(hook) => hook.call_original((code,)),
        None => std::process::exit(code as i32),
    }
}

/// `CreateProcessHooked`: the `usvfs-ffi` entry point for spawning a child
/// with injection guaranteed, for callers that would rather go through us
/// directly than rely on `CreateProcessInternalW` already being hooked.
/// Builds a default `STARTUPINFOW`/security-attributes set and drives the
/// same detour body the hook itself uses, so the two paths can never
/// diverge in behavior.
///
/// # Safety
/// `process_info_out` must be null or point at writable memory for one
/// `PROCESS_INFORMATION`.
pub unsafe fn create_process_hooked(
    application_name: Option<String>,
    command_line: String,
    process_info_out: *mut core::ffi::c_void,
) -> bool {
    let wide_app_name = application_name.as_deref().map(string_to_wide);
    let mut wide_command_line = string_to_wide(&command_line);
    let mut startup_info: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup_info.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    let mut local_process_info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let process_info_ptr = if process_info_out.is_null() {
        &mut local_process_info as *mut PROCESS_INFORMATION
    } else {
        process_info_out as *mut PROCESS_INFORMATION
    };

    let ok = unsafe {
        create_process_internal_w_detour(
            0,
            wide_app_name.as_ref().map(|w| w.as_ptr()).unwrap_or(std::ptr::null()),
            wide_command_line.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            FALSE,
            0,
            std::ptr::null(),
            std::ptr::null(),
            &startup_info,
            process_info_ptr,
            std::ptr::null_mut(),
        )
    };
    ok == TRUE
}

/// Install every hook named by the design, returning the list in
/// installation order so teardown can reverse it. Called once from
/// `usvfs-ffi`'s `ConnectVFS`/`CreateVFS` export after `Context::create`.
///
/// # Safety
/// Must run before any other thread in the process can call a hooked API.
pub unsafe fn install_all() -> usvfs_core::Result<Vec<Box<dyn AnyHook>>> {
    let mut hooks: Vec<Box<dyn AnyHook>> = Vec::new();

    install_one(&CREATE_FILE_W, "CreateFileW", create_file_w_detour, &mut hooks)?;
    install_one(
        &GET_FILE_ATTRIBUTES_W,
        "GetFileAttributesW",
        get_file_attributes_w_detour,
        &mut hooks,
    )?;
    install_one(
        &SET_FILE_ATTRIBUTES_W,
        "SetFileAttributesW",
        set_file_attributes_w_detour,
        &mut hooks,
    )?;
    install_one(&DELETE_FILE_W, "DeleteFileW", delete_file_w_detour, &mut hooks)?;
    install_one(
        &REMOVE_DIRECTORY_W,
        "RemoveDirectoryW",
        remove_directory_w_detour,
        &mut hooks,
    )?;
    install_one(
        &CREATE_DIRECTORY_W,
        "CreateDirectoryW",
        create_directory_w_detour,
        &mut hooks,
    )?;
    install_one(&MOVE_FILE_EX_W, "MoveFileExW", move_file_ex_w_detour, &mut hooks)?;
    install_one(&COPY_FILE_EX_W, "CopyFileExW", copy_file_ex_w_detour, &mut hooks)?;
    install_one(
        &FIND_FIRST_FILE_EX_W,
        "FindFirstFileExW",
        find_first_file_ex_w_detour,
        &mut hooks,
    )?;
    install_one(&FIND_NEXT_FILE_W, "FindNextFileW", find_next_file_w_detour, &mut hooks)?;
    install_one(
        &GET_MODULE_FILE_NAME_W,
        "GetModuleFileNameW",
        get_module_file_name_w_detour,
        &mut hooks,
    )?;
    install_one(
        &LOAD_LIBRARY_EX_W,
        "LoadLibraryExW",
        load_library_ex_w_detour,
        &mut hooks,
    )?;
    install_one(
        &CREATE_PROCESS_INTERNAL_W,
        "CreateProcessInternalW",
        create_process_internal_w_detour,
        &mut hooks,
    )?;
    install_one(&EXIT_PROCESS, "ExitProcess", exit_process_detour, &mut hooks)?;

    Ok(hooks)
}

unsafe fn install_one<F: retour::Function + Copy>(
    slot: &'static OnceLock<Hook<F>>,
    proc: &'static str,
    detour_fn: F,
    hooks: &mut Vec<Box<dyn AnyHook>>,
) -> usvfs_core::Result<()>
where
    Hook<F>: AnyHook,
{
    let hook = unsafe { Hook::install("kernel32.dll", proc, detour_fn) }?;
    let _ = slot.set(hook);
    hooks.push(Box::new(HookRef(slot)));
    Ok(())
}

/// Refers back into one of the `'static OnceLock<Hook<F>>` slots above, so
/// `uninstall_all` can disable each detour through the same `Hook` that
/// installed it without the slots themselves needing to be droppable.
struct HookRef<F: retour::Function>(&'static OnceLock<Hook<F>>);

impl<F: retour::Function> AnyHook for HookRef<F> {
    fn name(&self) -> &'static str {
        self.0.get().map(Hook::name).unwrap_or("<uninstalled>")
    }

    unsafe fn uninstall(&self) {
        if let Some(hook) = self.0.get() {
            // SAFETY: delegated to the caller's safety contract on this method.
            unsafe { hook.uninstall() };
        }
    }
}

/// `disconnect`'s hook half: uninstall every detour in the reverse of the
/// order `install_all` returned, per spec §4.6.
///
/// # Safety
/// No thread may be mid-call through any hooked function.
pub unsafe fn uninstall_all(hooks: &[Box<dyn AnyHook>]) {
    for hook in hooks.iter().rev() {
        // SAFETY: delegated to the caller's safety contract on this method.
        unsafe { hook.uninstall() };
    }
}
