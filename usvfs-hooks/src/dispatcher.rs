// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The hook dispatcher (component C4): per-primitive decision logic,
//! deliberately separated from the actual Win32 detour bodies in
//! `hooks_win.rs` so it can be exercised on any host OS. Each function
//! here implements spec §4.4's three-step shape - "is my mutex group
//! already active on this thread? if not, reroute; call through with
//! whatever path resulted" - for one family of primitives.

use usvfs_core::mutex_group::{self, MutexGroup};
use usvfs_core::path::FullPathResolver;
use usvfs_core::{reroute, reroute_new, should_force_copy_allowed, Context, Reroute};

fn passthrough(path: &str) -> Reroute {
    Reroute {
        original: path.to_string(),
        result: path.to_string(),
        was_rerouted: false,
        real_path: path.to_string(),
    }
}

/// Shared shape for the read-only primitives (open, get-attributes,
/// delete, search, find): gate on `group`, then do a plain lookup.
fn route(ctx: &Context, group: MutexGroup, path: &str, inverse: bool, resolver: &dyn FullPathResolver) -> Reroute {
    let (_guard, active) = mutex_group::enter(group);
    if !active {
        return passthrough(path);
    }
    reroute(ctx.tables.select(inverse), path, resolver)
}

/// `CreateFile`/`OpenFile` family.
pub fn open_file(ctx: &Context, path: &str, resolver: &dyn FullPathResolver) -> Reroute {
    route(ctx, MutexGroup::OpenFile, path, false, resolver)
}

/// `GetFileAttributes(Ex)`/`SetFileAttributes`.
pub fn file_attributes(ctx: &Context, path: &str, resolver: &dyn FullPathResolver) -> Reroute {
    route(ctx, MutexGroup::FileAttributes, path, false, resolver)
}

/// `DeleteFile`/`RemoveDirectory`.
pub fn delete_file(ctx: &Context, path: &str, resolver: &dyn FullPathResolver) -> Reroute {
    route(ctx, MutexGroup::DeleteFile, path, false, resolver)
}

/// `CreateDirectory`: unlike the read-only primitives, a miss under a
/// `CREATE_TARGET` ancestor must physically create the directory chain, so
/// this goes through `reroute_new` instead of `reroute`.
pub fn create_directory(
    ctx: &Context,
    path: &str,
    resolver: &dyn FullPathResolver,
) -> usvfs_core::Result<Reroute> {
    let (_guard, active) = mutex_group::enter(MutexGroup::ShellFileOp);
    if !active {
        return Ok(passthrough(path));
    }
    reroute_new(&ctx.tables.main, path, resolver)
}

/// `GetFullPathName`: a plain lookup under the dedicated group so the
/// resolver's own un-hooked call to the same underlying API (see
/// `resolver::PlatformResolver`) never loops back through us.
pub fn full_path_name(ctx: &Context, path: &str, resolver: &dyn FullPathResolver) -> Reroute {
    route(ctx, MutexGroup::FullPathname, path, false, resolver)
}

/// `GetModuleFileName`: consults the *inverse* table, so a module loaded
/// from a physical backing path reports the virtual name a caller expects.
pub fn module_file_name(ctx: &Context, physical_path: &str, resolver: &dyn FullPathResolver) -> Reroute {
    route(ctx, MutexGroup::FullPathname, physical_path, true, resolver)
}

/// Outcome of a move/rename decision: the rerouted source and destination,
/// plus whether `MOVEFILE_COPY_ALLOWED` must be forced because the virtual
/// view hid a physical drive split (spec §4.4).
pub struct MoveDecision {
    pub source: Reroute,
    pub dest: Reroute,
    pub force_copy_allowed: bool,
}

/// `MoveFile(Ex)`/`CopyFile(Ex)` share this shape; both are grouped under
/// `SHELL_FILEOP`.
pub fn move_file(
    ctx: &Context,
    original_source: &str,
    original_dest: &str,
    resolver: &dyn FullPathResolver,
) -> MoveDecision {
    let (_guard, active) = mutex_group::enter(MutexGroup::ShellFileOp);
    if !active {
        return MoveDecision {
            source: passthrough(original_source),
            dest: passthrough(original_dest),
            force_copy_allowed: false,
        };
    }
    let source = reroute(&ctx.tables.main, original_source, resolver);
    let dest = reroute(&ctx.tables.main, original_dest, resolver);
    let force_copy_allowed = should_force_copy_allowed(original_source, original_dest, &source, &dest);
    MoveDecision {
        source,
        dest,
        force_copy_allowed,
    }
}

/// `FindFirstFileEx`/`FindNextFile`: just the query-path reroute; merging
/// the resulting directory listing with virtual overlay entries is
/// `directory_enum`'s job, driven by the search handle the caller opens
/// with this reroute's result.
pub fn search_files(ctx: &Context, path: &str, resolver: &dyn FullPathResolver) -> Reroute {
    route(ctx, MutexGroup::SearchFiles, path, false, resolver)
}

/// The NT-level directory-enumeration primitive (`NtQueryDirectoryFile`),
/// grouped separately from `SearchFiles` because the original hooks it at
/// a lower level with its own reentrancy domain.
pub fn find_files(ctx: &Context, path: &str, resolver: &dyn FullPathResolver) -> Reroute {
    route(ctx, MutexGroup::FindFiles, path, false, resolver)
}

/// `LoadLibraryEx`.
pub fn load_library(ctx: &Context, path: &str, resolver: &dyn FullPathResolver) -> Reroute {
    route(ctx, MutexGroup::LoadLibrary, path, false, resolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use usvfs_core::context::Parameters;
    use usvfs_core::path::CwdResolver;

    fn fresh_ctx(name: &str) -> Context {
        Context::isolated(Parameters {
            instance_name: name.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn open_file_reroutes_a_linked_path() {
        let ctx = fresh_ctx("dispatcher-open");
        ctx.link_file(r"C:\real\np.exe", r"C:\np.exe").unwrap();
        let result = open_file(&ctx, r"C:\np.exe", &CwdResolver);
        assert!(result.was_rerouted);
        assert_eq!(result.result, r"C:\real\np.exe");
    }

    #[test]
    fn reentrant_call_into_same_group_passes_through() {
        let ctx = fresh_ctx("dispatcher-reentrant");
        ctx.link_file(r"C:\real\np.exe", r"C:\np.exe").unwrap();
        let (_outer, _active) = mutex_group::enter(MutexGroup::OpenFile);
        let result = open_file(&ctx, r"C:\np.exe", &CwdResolver);
        assert!(!result.was_rerouted);
        assert_eq!(result.result, r"C:\np.exe");
    }

    #[test]
    fn move_file_forces_copy_allowed_on_hidden_drive_split() {
        let ctx = fresh_ctx("dispatcher-move");
        ctx.link_file(r"D:\real\a.txt", r"C:\vdrive\a.txt").unwrap();
        let decision = move_file(&ctx, r"C:\vdrive\a.txt", r"C:\vdrive\b.txt", &CwdResolver);
        assert!(decision.force_copy_allowed);
    }

    #[test]
    fn module_file_name_consults_inverse_table() {
        let ctx = fresh_ctx("dispatcher-module");
        ctx.link_file(r"C:\real\mod.dll", r"C:\game\mod.dll").unwrap();
        let result = module_file_name(&ctx, r"C:\real\mod.dll", &CwdResolver);
        assert!(result.was_rerouted);
        assert_eq!(result.result, r"C:\game\mod.dll");
    }
}
