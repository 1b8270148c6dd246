// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Directory-enumeration merging: `FindFirstFileEx`/`FindNextFile` and the
//! NT-level `NtQueryDirectoryFile` primitive must show a caller entries
//! from both the (rerouted) physical directory and any purely-virtual
//! children mounted under that path in the tree - a virtual-only
//! subdirectory has no physical presence to enumerate on its own (spec
//! §4.4, "virtual-only directory" edge case).

use usvfs_core::path::{segment_cmp, segment_eq};
use usvfs_core::Context;

/// Combine a real directory listing with the tree's virtual children of
/// `virtual_dir`, de-duplicating case-foldedly (a virtual entry with the
/// same name as a real one wins, since it was already reachable through
/// `open_file`'s reroute) and sorting into the order `Tree` itself
/// maintains.
pub fn merge_entries(ctx: &Context, virtual_dir: &str, real_entries: &[String]) -> Vec<String> {
    let mut combined: Vec<String> = real_entries.to_vec();
    if let Some(handle) = ctx.tables.main.find_node(virtual_dir) {
        for child in ctx.tables.main.children(handle) {
            if !combined.iter().any(|existing| segment_eq(existing, &child.name)) {
                combined.push(child.name);
            }
        }
    }
    combined.sort_by(|a, b| segment_cmp(a, b));
    combined.dedup_by(|a, b| segment_eq(a, b));
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use usvfs_core::context::Parameters;

    fn fresh_ctx(name: &str) -> Context {
        Context::isolated(Parameters {
            instance_name: name.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn merges_real_and_virtual_entries_sorted() {
        let ctx = fresh_ctx("direnum-merge");
        ctx.link_file(r"C:\real\b.txt", r"C:\mount\b.txt").unwrap();
        ctx.link_file(r"C:\real\a.txt", r"C:\mount\a.txt").unwrap();

        let real = vec!["c.txt".to_string()];
        let merged = merge_entries(&ctx, r"C:\mount", &real);
        assert_eq!(merged, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn virtual_entry_shadows_real_entry_of_same_name() {
        let ctx = fresh_ctx("direnum-shadow");
        ctx.link_file(r"C:\real\np.exe", r"C:\mount\np.exe").unwrap();
        let real = vec!["np.exe".to_string()];
        let merged = merge_entries(&ctx, r"C:\mount", &real);
        assert_eq!(merged, vec!["np.exe"]);
    }

    #[test]
    fn directory_with_no_virtual_overlay_still_sorts_real_entries() {
        let ctx = fresh_ctx("direnum-none");
        let real = vec!["z.txt".to_string(), "a.txt".to_string()];
        let merged = merge_entries(&ctx, r"C:\plain", &real);
        assert_eq!(merged, vec!["a.txt", "z.txt"]);
    }
}
