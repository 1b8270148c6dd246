// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The rerouter (component C3): combines the path canonicalizer with a
//! tree lookup to decide whether, and to what, a caller-supplied path
//! should be rewritten.
//!
//! Reentrancy gating (spec §4.4 step 1 - "if the mutex group is already
//! active on this thread, pass through without rerouting") is a Hook
//! Dispatcher concern, not this module's: `reroute`/`reroute_new` are pure
//! functions of their inputs and always do a full lookup. `usvfs-hooks`
//! decides whether to call them at all.

use crate::error::Result;
use crate::path::{self, FullPathResolver, MAX_PATH};
use crate::tree::Tree;

/// The result of a rerouting decision. `real_path` is the canonicalized
/// virtual-side path used to position a subsequent [`Tree::add_file`] call
/// (see `SPEC_FULL.md`'s note on the original `RerouteW` struct); it is not
/// generally what a caller should use as a filesystem path - `result` is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reroute {
    pub original: String,
    pub result: String,
    pub was_rerouted: bool,
    pub real_path: String,
}

impl Reroute {
    fn passthrough(path: &str) -> Self {
        Reroute {
            original: path.to_string(),
            result: path.to_string(),
            was_rerouted: false,
            real_path: path.to_string(),
        }
    }
}

/// Spec §4.3, `reroute(path, inverse)`. Pass `inverse_tree` when translating
/// a physical path back to the virtual name a caller expects, as
/// `GetModuleFileName` does.
pub fn reroute(tree: &Tree, path: &str, resolver: &dyn FullPathResolver) -> Reroute {
    if path.is_empty() || path::is_device_id(path) {
        return Reroute::passthrough(path);
    }

    let canonical = path::canonicalize(path, resolver);
    let mut result = canonical.clone();
    let mut was_rerouted = false;

    if let Some(handle) = tree.find_node(&canonical) {
        let data = tree.data(handle);
        if let Some(target) = &data.link_target {
            result = target.clone();
            was_rerouted = true;
        } else if data.is_directory {
            result = tree.path_of(handle);
            was_rerouted = true;
        }
    } else if let Some((_, target, tail)) = tree.deepest_link(&canonical) {
        // No tree node for the full path - it's a file reachable only
        // through a linked ancestor directory's physical backing, not
        // something `mapdir`/`VirtualLinkDirectoryStatic` enumerated into
        // the tree itself.
        result = if tail.is_empty() {
            target
        } else {
            format!("{}\\{}", target.trim_end_matches('\\'), tail)
        };
        was_rerouted = true;
    }

    finish(path, canonical, result, was_rerouted)
}

fn finish(original: &str, canonical: String, mut result: String, was_rerouted: bool) -> Reroute {
    if result.len() >= MAX_PATH && !result.starts_with(r"\\?\") {
        result = format!(r"\\?\{result}");
    }
    // A link target is always either a Windows-shaped path (drive letter or
    // UNC prefix) or, on the non-Windows hosts this core crate is tested on,
    // a native POSIX absolute path straight from `tempfile`. Normalizing a
    // stray `/` to `\` only makes sense for the former - doing it
    // unconditionally would mangle the latter into something no longer
    // resolvable on disk.
    if !result.starts_with('/') {
        result = result.replace('/', "\\");
    }
    Reroute {
        original: original.to_string(),
        result,
        was_rerouted,
        real_path: canonical,
    }
}

/// Spec §4.3, `reroute_new(path)`. On a hit, physically creates the parent
/// directory chain of the computed destination, matching
/// `winapi::ex::wide::createPath` in the original.
pub fn reroute_new(tree: &Tree, path: &str, resolver: &dyn FullPathResolver) -> Result<Reroute> {
    if path.is_empty() || path::is_device_id(path) {
        return Ok(Reroute::passthrough(path));
    }

    let canonical = path::canonicalize(path, resolver);

    let Some((ancestor, link_target)) = tree.deepest_create_target(&canonical) else {
        return Ok(finish(path, canonical.clone(), canonical, false));
    };

    let ancestor_path = tree.path_of(ancestor);
    let tail = canonical
        .strip_prefix(&ancestor_path)
        .unwrap_or(&canonical)
        .trim_start_matches('\\');

    let result = if tail.is_empty() {
        link_target.clone()
    } else {
        format!("{}\\{}", link_target.trim_end_matches('\\'), tail)
    };

    if let Some(parent) = parent_of(&result) {
        std::fs::create_dir_all(path::to_native_path(parent))?;
    }

    Ok(finish(path, canonical, result, true))
}

fn parent_of(path: &str) -> Option<&str> {
    path.rfind('\\').map(|i| &path[..i])
}

/// "Move across virtual drives" special case (spec §4.4): true when the
/// caller-visible paths looked like they were on the same drive but their
/// rerouted physical destinations landed on different ones, meaning a plain
/// rename would fail and `MOVEFILE_COPY_ALLOWED` must be forced.
pub fn should_force_copy_allowed(
    original_source: &str,
    original_dest: &str,
    rerouted_source: &Reroute,
    rerouted_dest: &Reroute,
) -> bool {
    !path::on_different_drives(original_source, original_dest)
        && path::on_different_drives(&rerouted_source.result, &rerouted_dest.result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::CwdResolver;
    use crate::tree::LINKFLAG_CREATETARGET;

    #[test]
    fn miss_returns_canonicalized_unrerouted_path() {
        let tree = Tree::new().unwrap();
        let resolver = CwdResolver;
        let result = reroute(&tree, r"C:\not\linked\.\path", &resolver);
        assert!(!result.was_rerouted);
        assert_eq!(result.result, r"C:\not\linked\path");
    }

    #[test]
    fn hit_returns_link_target() {
        let tree = Tree::new().unwrap();
        tree.add_file(r"C:\np.exe", r"C:\windows\notepad.exe").unwrap();
        let resolver = CwdResolver;
        let result = reroute(&tree, r"C:\np.exe", &resolver);
        assert!(result.was_rerouted);
        assert_eq!(result.result, r"C:\windows\notepad.exe");
    }

    #[test]
    fn long_path_gets_extended_length_prefix() {
        let tree = Tree::new().unwrap();
        let long_target = format!(r"C:\{}", "x".repeat(300));
        tree.add_file(r"C:\np.exe", &long_target).unwrap();
        let resolver = CwdResolver;
        let result = reroute(&tree, r"C:\np.exe", &resolver);
        assert!(result.result.starts_with(r"\\?\"));
    }

    #[test]
    fn empty_and_device_ids_pass_through() {
        let tree = Tree::new().unwrap();
        let resolver = CwdResolver;
        assert!(!reroute(&tree, "", &resolver).was_rerouted);
        assert!(!reroute(&tree, "hid#vid_1", &resolver).was_rerouted);
        assert_eq!(reroute(&tree, "hid#vid_1", &resolver).result, "hid#vid_1");
    }

    #[test]
    fn directory_link_reroutes_files_never_individually_enumerated() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::new().unwrap();
        let source = dir.path().to_string_lossy().into_owned();
        tree.link_directory_static(&source, r"C:\mount", 0).unwrap();

        let resolver = CwdResolver;
        let result = reroute(&tree, r"C:\mount\sub\file.txt", &resolver);
        assert!(result.was_rerouted);
        assert_eq!(result.result, format!("{source}\\sub\\file.txt"));
    }

    #[test]
    fn reroute_new_under_create_target_computes_physical_path() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::new().unwrap();
        let source = dir.path().to_string_lossy().into_owned();
        tree.link_directory_static(&source, r"C:\mount", LINKFLAG_CREATETARGET)
            .unwrap();

        let resolver = CwdResolver;
        let result = reroute_new(&tree, r"C:\mount\new\file.txt", &resolver).unwrap();
        assert!(result.was_rerouted);
        assert_eq!(result.result, format!("{source}\\new\\file.txt"));
        assert!(std::path::Path::new(&source).join("new").is_dir());
    }

    #[test]
    fn reroute_new_without_create_target_is_a_miss() {
        let tree = Tree::new().unwrap();
        let resolver = CwdResolver;
        let result = reroute_new(&tree, r"C:\somewhere\file.txt", &resolver).unwrap();
        assert!(!result.was_rerouted);
        assert_eq!(result.result, r"C:\somewhere\file.txt");
    }

    #[test]
    fn force_copy_allowed_only_when_virtual_drive_hides_a_physical_split() {
        let same = Reroute {
            original: String::new(),
            result: r"C:\a".into(),
            was_rerouted: true,
            real_path: String::new(),
        };
        let other_drive = Reroute {
            original: String::new(),
            result: r"D:\b".into(),
            was_rerouted: true,
            real_path: String::new(),
        };
        assert!(should_force_copy_allowed(r"C:\src", r"C:\dst", &same, &other_drive));
        assert!(!should_force_copy_allowed(r"C:\src", r"D:\dst", &same, &other_drive));
    }
}
