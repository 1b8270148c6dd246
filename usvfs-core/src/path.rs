// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Path canonicalization (component C1 of the design).
//!
//! Everything here operates on plain `str`/`String` using Windows path
//! syntax explicitly, rather than `std::path`, because the engine must
//! canonicalize Windows-shaped paths the same way on every host the core
//! library is unit-tested on, not just on Windows. `std::path::Path`
//! treats `/` and `\` separator rules differently depending on the target
//! OS, which is exactly the ambiguity this module exists to remove.

/// The Windows `MAX_PATH` threshold; results at or beyond this length get a
/// `\\?\` extended-length prefix (step 5 of `canonicalize`).
pub const MAX_PATH: usize = 260;

/// Something that can answer "what is this relative path, made absolute
/// against the caller's real current directory" the way `GetFullPathName`
/// would. Kept as a trait so `usvfs-core` has no hard dependency on a live
/// Windows API: tests supply a fake, `usvfs-hooks` supplies one backed by
/// the real (un-hooked) OS call under the `FULL_PATHNAME` mutex group.
pub trait FullPathResolver {
    fn full_path(&self, relative: &str) -> String;
}

/// A resolver good enough for unit tests and for the diagnostic CLI: joins
/// against `std::env::current_dir()` lexically, without touching any
/// hooked API.
#[derive(Default)]
pub struct CwdResolver;

impl FullPathResolver for CwdResolver {
    fn full_path(&self, relative: &str) -> String {
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "C:\\".to_string());
        join_raw(&cwd, relative)
    }
}

fn join_raw(base: &str, rel: &str) -> String {
    if rel.is_empty() {
        return base.to_string();
    }
    let mut out = base.trim_end_matches(['\\', '/']).to_string();
    out.push('\\');
    out.push_str(rel);
    out
}

/// Strip a `\\?\` or `\??\` prefix, if present (step 1).
fn strip_nt_prefix(p: &str) -> Option<&str> {
    for prefix in [r"\\?\", r"\??\"] {
        if let Some(rest) = p.strip_prefix(prefix) {
            return Some(rest);
        }
    }
    None
}

/// Rewrite `\\localhost\C$\...` / `\\127.0.0.1\C$\...` to `C:\...` (step 2).
fn rewrite_localhost_share(p: &str) -> Option<String> {
    for prefix in [r"\\localhost\", r"\\127.0.0.1\"] {
        if let Some(rest) = p.strip_prefix(prefix) {
            let mut chars = rest.chars();
            let letter = chars.next()?;
            if !letter.is_ascii_alphabetic() {
                return None;
            }
            if chars.next() != Some('$') {
                return None;
            }
            let tail = &rest[letter.len_utf8() + 1..];
            let tail = tail.strip_prefix('\\').unwrap_or(tail);
            let mut out = String::with_capacity(tail.len() + 3);
            out.push(letter.to_ascii_uppercase());
            out.push(':');
            out.push('\\');
            out.push_str(tail);
            return Some(out);
        }
    }
    None
}

/// True when `p` is empty or already drive-rooted (`X:...`), i.e. step 3's
/// "keep as is" condition.
fn is_already_rooted(p: &str) -> bool {
    p.is_empty() || p.as_bytes().get(1) == Some(&b':')
}

/// Lexically fold `.` / `..`, drop a trailing bare `.` component, force
/// backslash separators, and collapse duplicate separators (step 5).
fn lexically_normalize(p: &str) -> String {
    let slashed: String = p.chars().map(|c| if c == '/' { '\\' } else { c }).collect();

    // Preserve a leading UNC "\\server\share" or drive-root "C:\" prefix
    // verbatim; only the component list after it gets `.`/`..` folding.
    let (prefix, rest) = split_root(&slashed);

    let mut stack: Vec<&str> = Vec::new();
    for component in rest.split('\\').filter(|c| !c.is_empty()) {
        match component {
            "." => {}
            ".." => {
                if matches!(stack.last(), Some(top) if *top != "..") {
                    stack.pop();
                } else if prefix.is_empty() {
                    // relative path that walks above its own root: keep the `..`
                    stack.push("..");
                }
                // rooted paths silently clamp at the root, like Windows does.
            }
            other => stack.push(other),
        }
    }

    let mut out = prefix.to_string();
    for (i, component) in stack.iter().enumerate() {
        if i > 0 || !prefix.is_empty() {
            if !out.ends_with('\\') {
                out.push('\\');
            }
        }
        out.push_str(component);
    }
    if out.is_empty() {
        out.push('\\');
    }
    out
}

/// Split a slash-normalized path into `(root_prefix, rest)` where
/// `root_prefix` is `"C:\"`-shaped or empty for a relative path.
fn split_root(p: &str) -> (&str, &str) {
    if p.len() >= 3 && p.as_bytes()[1] == b':' && (p.as_bytes()[2] == b'\\') {
        p.split_at(3)
    } else if p.len() >= 2 && p.as_bytes()[1] == b':' {
        p.split_at(2)
    } else {
        ("", p)
    }
}

/// Drop a trailing bare `.` filename component (spec step 5, "remove a
/// trailing `.` filename").
fn drop_trailing_dot(p: &str) -> String {
    if let Some(stripped) = p.strip_suffix(r"\.") {
        stripped.to_string()
    } else if p == "." {
        String::new()
    } else {
        p.to_string()
    }
}

fn uppercase_drive(p: &str) -> String {
    let bytes = p.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let mut out = p.to_string();
        out.replace_range(0..1, &p[0..1].to_ascii_uppercase());
        out
    } else {
        p.to_string()
    }
}

/// Canonicalize `p` per spec §4.1. Never calls a hooked API itself; the
/// caller supplies a [`FullPathResolver`] for step 4, which `usvfs-hooks`
/// implements on top of the un-hooked `GetFullPathNameW` guarded by the
/// `FULL_PATHNAME` mutex group.
pub fn canonicalize(p: &str, resolver: &dyn FullPathResolver) -> String {
    if p.is_empty() {
        return p.to_string();
    }

    let after_nt = strip_nt_prefix(p).map(str::to_string);
    let after_localhost = if after_nt.is_none() {
        rewrite_localhost_share(p)
    } else {
        None
    };

    let working = if let Some(s) = after_nt {
        s
    } else if let Some(s) = after_localhost {
        s
    } else if is_already_rooted(p) {
        p.to_string()
    } else {
        resolver.full_path(p)
    };

    let normalized = lexically_normalize(&working);
    let deduped = drop_trailing_dot(&normalized);
    uppercase_drive(&deduped)
}

/// The uppercase drive letter of a canonical path, if it has one. Ported
/// from the original `pathNameDriveLetter` helper: a path without an
/// explicit drive letter (a UNC path, for instance) has no drive letter at
/// all rather than an error.
pub fn drive_letter(p: &str) -> Option<char> {
    let bytes = p.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        Some(p.chars().next().unwrap().to_ascii_uppercase())
    } else {
        None
    }
}

/// True only when both paths carry a (different) drive letter; a path with
/// no resolvable drive letter never counts as "on a different drive" -
/// matching the original's "give up" behavior rather than treating it as a
/// mismatch.
pub fn on_different_drives(a: &str, b: &str) -> bool {
    match (drive_letter(a), drive_letter(b)) {
        (Some(x), Some(y)) => x != y,
        _ => false,
    }
}

/// Segment list for tree traversal: `"C:\foo\bar"` -> `["C:", "foo", "bar"]`.
/// The drive (or UNC host\share) forms the first segment so that multiple
/// drives live as siblings under one tree root.
pub fn segments(canonical: &str) -> Vec<&str> {
    let (prefix, rest) = split_root(canonical);
    let mut out = Vec::new();
    if !prefix.is_empty() {
        out.push(prefix.trim_end_matches('\\'));
    }
    out.extend(rest.split('\\').filter(|s| !s.is_empty()));
    out
}

/// Case-fold equality for a single path segment (spec: "Unicode case-fold
/// equality").
pub fn segment_eq(a: &str, b: &str) -> bool {
    a.to_uppercase() == b.to_uppercase()
}

/// Ordering used for directory-enumeration output: Unicode code-point order
/// after case-fold.
pub fn segment_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    a.to_uppercase().cmp(&b.to_uppercase())
}

/// `hid#...` device identifiers pass through the rerouter untouched (spec
/// §4.3 step 1).
pub fn is_device_id(p: &str) -> bool {
    p.len() >= 4 && p[..4].eq_ignore_ascii_case("hid#")
}

/// Reinterpret a `\`-separated engine path as a native [`std::path::PathBuf`]
/// for an actual filesystem call. On Windows this is a no-op since `\` is
/// already the native separator; on any other host (where the rest of this
/// module is tested), joining components one at a time through `PathBuf`
/// instead of handing the OS a literal backslash keeps real disk operations
/// landing where the string says they should, even when the path mixes a
/// native-separated physical root (as `tempfile` produces in tests) with
/// `\`-joined virtual segments appended by the rerouter.
pub fn to_native_path(p: &str) -> std::path::PathBuf {
    p.split('\\').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct FixedCwd(&'static str);
    impl FullPathResolver for FixedCwd {
        fn full_path(&self, relative: &str) -> String {
            join_raw(self.0, relative)
        }
    }

    #[rstest]
    #[case(r"\\?\C:\foo\bar", r"C:\foo\bar")]
    #[case(r"\??\C:\foo", r"C:\foo")]
    #[case(r"\\localhost\C$\windows", r"C:\windows")]
    #[case(r"\\127.0.0.1\D$\games\save", r"D:\games\save")]
    #[case(r"c:\foo\.\bar", r"C:\foo\bar")]
    #[case(r"C:\foo\..\bar", r"C:\bar")]
    #[case(r"C:\.\not/../logs\.\a\.\b\.\c\..\.\..\.\..\", r"C:\logs")]
    #[case(r"C:\foo\bar\.", r"C:\foo\bar")]
    #[case(r"C:/foo/bar", r"C:\foo\bar")]
    fn canonicalizes_rooted_paths(#[case] input: &str, #[case] expected: &str) {
        let resolver = FixedCwd(r"C:\cwd");
        assert_eq!(canonicalize(input, &resolver), expected);
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let resolver = FixedCwd(r"C:\base\dir");
        assert_eq!(canonicalize("sub\\file.txt", &resolver), r"C:\base\dir\sub\file.txt");
    }

    #[test]
    fn empty_path_is_unchanged() {
        let resolver = FixedCwd(r"C:\x");
        assert_eq!(canonicalize("", &resolver), "");
    }

    #[test]
    fn result_never_contains_dot_segments_or_forward_slashes() {
        let resolver = FixedCwd(r"C:\x");
        for input in [r"C:\a\.\b", r"C:\a/b/../c", r"a/b"] {
            let out = canonicalize(input, &resolver);
            assert!(!out.contains('/'));
            assert!(!out.split('\\').any(|s| s == "." || s == ".."));
        }
    }

    #[test]
    fn drive_letter_is_uppercased() {
        let resolver = FixedCwd(r"C:\x");
        assert_eq!(canonicalize(r"d:\foo", &resolver), r"D:\foo");
    }

    #[test]
    fn different_drives_detected() {
        assert!(on_different_drives(r"C:\a", r"D:\b"));
        assert!(!on_different_drives(r"C:\a", r"C:\b"));
        assert!(!on_different_drives(r"\\server\share\a", r"C:\b"));
    }

    #[test]
    fn device_ids_recognized() {
        assert!(is_device_id("hid#vid_1234"));
        assert!(!is_device_id(r"C:\hid#notreally"));
    }

    #[test]
    fn segments_split_drive_as_first_element() {
        assert_eq!(segments(r"C:\foo\bar"), vec!["C:", "foo", "bar"]);
        assert_eq!(segments(r"C:\"), vec!["C:"]);
    }
}
