// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The redirection tree (component C2): a shared, ordered map from virtual
//! paths to physical backing paths.
//!
//! Every public method here takes already-canonicalized paths (data-model
//! invariant 6: "lookup never canonicalizes during traversal"). Callers
//! (the rerouter, the hook dispatcher, the mapping-file loader) are
//! responsible for running [`crate::path::canonicalize`] first.

mod arena;

use std::path::Path;
use std::sync::Arc;

use arena::{NodeRaw, Region, DEFAULT_CAPACITY, FLAG_CREATE_TARGET, NONE};

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::path::{self, segment_cmp, segment_eq};

pub use arena::DEFAULT_CAPACITY as DEFAULT_TREE_CAPACITY;

/// Bitset carried by a tree node. Only one flag exists today; the type is
/// `u32` (matching the region's on-disk field width) so future flags don't
/// require a layout change.
pub mod flags {
    pub const CREATE_TARGET: u32 = super::FLAG_CREATE_TARGET;
}

/// Flags accepted by [`Tree::link_file`] / [`Tree::link_directory_static`].
pub const LINKFLAG_RECURSIVE: u32 = 1 << 0;
pub const LINKFLAG_CREATETARGET: u32 = 1 << 1;

/// An opaque, `Copy`able reference to a tree node. Cheap to hold onto: the
/// arena never recycles a node's storage, so a handle obtained before a
/// concurrent `remove_from_tree` stays readable afterwards - it just won't
/// be reachable from `find_node` anymore. This is what satisfies the
/// "readers keep using a node after a concurrent writer has removed it"
/// design goal without a separate reference-counting scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle(u32);

/// A read-only snapshot of one node's data, materialized out of the arena.
#[derive(Clone, Debug)]
pub struct NodeData {
    pub name: String,
    pub link_target: Option<String>,
    pub is_directory: bool,
    pub flags: u32,
}

impl NodeData {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// The shared, concurrently-readable, single-writer redirection tree.
pub struct Tree {
    region: Arc<Region>,
}

impl Clone for Tree {
    fn clone(&self) -> Self {
        Tree {
            region: self.region.clone(),
        }
    }
}

impl Tree {
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Ok(Tree {
            region: Arc::new(Region::new_anonymous(capacity)?),
        })
    }

    /// Attach to (or create) a tree backed by a named file under the OS
    /// temp directory, so a second process that opens the same
    /// `instance_name` observes the identical nodes - this is the
    /// in-practice realization of the "named shared memory" design note,
    /// using `memmap2` over a shared file instead of a raw OS shared-memory
    /// API, since the latter has no portable std equivalent.
    pub fn open_named(instance_name: &str, capacity: usize, create: bool) -> Result<Self> {
        let path = shared_region_path(instance_name);
        Ok(Tree {
            region: Arc::new(Region::open_named(&path, capacity, create)?),
        })
    }

    pub fn root(&self) -> NodeHandle {
        NodeHandle(self.region.root())
    }

    pub fn path_of(&self, handle: NodeHandle) -> String {
        let mut segments = Vec::new();
        let mut current = handle.0;
        while current != self.region.root() {
            let raw = self.region.read_node(current);
            segments.push(self.region.read_string(raw.name_off, raw.name_len));
            current = raw.parent;
        }
        segments.reverse();
        match segments.split_first() {
            None => String::new(),
            Some((drive, rest)) => {
                let mut out = drive.clone();
                out.push('\\');
                out.push_str(&rest.join("\\"));
                out.trim_end_matches('\\').to_string()
            }
        }
    }

    pub fn data(&self, handle: NodeHandle) -> NodeData {
        let raw = self.region.read_node(handle.0);
        NodeData {
            name: self.region.read_string(raw.name_off, raw.name_len),
            link_target: if raw.link_len > 0 {
                Some(self.region.read_string(raw.link_off, raw.link_len))
            } else {
                None
            },
            is_directory: raw.is_directory,
            flags: raw.flags,
        }
    }

    /// Deepest exact match for `canonical_path`, or `None` if it is absent,
    /// or present only as a bare intermediate (no link target and not a
    /// directory - spec's "mere intermediate" tie-break).
    pub fn find_node(&self, canonical_path: &str) -> Option<NodeHandle> {
        self.region.read_lock();
        let result = self.find_locked(canonical_path);
        self.region.read_unlock();
        result
    }

    fn find_locked(&self, canonical_path: &str) -> Option<NodeHandle> {
        let segments = path::segments(canonical_path);
        let mut current = self.region.root();
        for segment in &segments {
            current = self.find_child(current, segment)?;
        }
        let raw = self.region.read_node(current);
        if current != self.region.root() && !raw.is_directory && raw.link_len == 0 {
            return None;
        }
        Some(NodeHandle(current))
    }

    fn find_child(&self, parent: u32, name: &str) -> Option<u32> {
        let mut child = self.region.read_node(parent).first_child;
        while child != NONE {
            let raw = self.region.read_node(child);
            let child_name = self.region.read_string(raw.name_off, raw.name_len);
            if segment_eq(&child_name, name) {
                return Some(child);
            }
            child = raw.next_sibling;
        }
        None
    }

    /// Invoke `visitor` for every prefix node of `canonical_path` that
    /// exists, root to leaf, stopping at the first missing segment.
    pub fn visit_path(&self, canonical_path: &str, mut visitor: impl FnMut(NodeHandle, &NodeData)) {
        self.region.read_lock();
        let segments = path::segments(canonical_path);
        let mut current = self.region.root();
        visitor(NodeHandle(current), &self.data(NodeHandle(current)));
        for segment in &segments {
            match self.find_child(current, segment) {
                Some(next) => {
                    current = next;
                    visitor(NodeHandle(current), &self.data(NodeHandle(current)));
                }
                None => break,
            }
        }
        self.region.read_unlock();
    }

    /// List the immediate children of a directory node, in the same
    /// case-folded order `append_child` maintains - used by the directory-
    /// enumeration merge (spec §4.4's "virtual-only directory" case).
    pub fn children(&self, handle: NodeHandle) -> Vec<NodeData> {
        self.region.read_lock();
        let mut out = Vec::new();
        let mut current = self.region.read_node(handle.0).first_child;
        while current != NONE {
            out.push(self.data(NodeHandle(current)));
            current = self.region.read_node(current).next_sibling;
        }
        self.region.read_unlock();
        out
    }

    /// Like [`Tree::children`] but keeps each child's handle alongside its
    /// data, so a caller (the diagnostic CLI's `tree` subcommand) can walk
    /// back down with further `children`/`child_nodes` calls.
    pub fn child_nodes(&self, handle: NodeHandle) -> Vec<(NodeHandle, NodeData)> {
        self.region.read_lock();
        let mut out = Vec::new();
        let mut current = self.region.read_node(handle.0).first_child;
        while current != NONE {
            out.push((NodeHandle(current), self.data(NodeHandle(current))));
            current = self.region.read_node(current).next_sibling;
        }
        self.region.read_unlock();
        out
    }

    /// The deepest ancestor of `canonical_path` flagged [`flags::CREATE_TARGET`],
    /// if any - used by `reroute_new`.
    pub fn deepest_create_target(&self, canonical_path: &str) -> Option<(NodeHandle, String)> {
        let mut found = None;
        self.visit_path(canonical_path, |handle, data| {
            if data.has_flag(flags::CREATE_TARGET) {
                if let Some(target) = &data.link_target {
                    found = Some((handle, target.clone()));
                }
            }
        });
        found
    }

    /// The deepest existing ancestor of `canonical_path` carrying any link
    /// target, plus the unconsumed tail below it - the general form of
    /// [`Tree::deepest_create_target`], used by [`crate::reroute::reroute`]
    /// so a directory link (e.g. a `mapdir` entry, linked without
    /// `LINKFLAG_RECURSIVE`) redirects every file physically reachable
    /// under it, not only the handful of subpaths that happen to have
    /// their own tree node.
    pub fn deepest_link(&self, canonical_path: &str) -> Option<(NodeHandle, String, String)> {
        let mut found: Option<(NodeHandle, String)> = None;
        self.visit_path(canonical_path, |handle, data| {
            if let Some(target) = &data.link_target {
                found = Some((handle, target.clone()));
            }
        });
        let (handle, target) = found?;
        let ancestor_path = self.path_of(handle);
        let tail = canonical_path
            .strip_prefix(&ancestor_path)
            .unwrap_or(canonical_path)
            .trim_start_matches('\\')
            .to_string();
        Some((handle, target, tail))
    }

    /// Insert (or replace) a node at `virtual_path`, creating missing
    /// intermediate directory nodes along the way. This is the tree's one
    /// mutating primitive; `add_file`, `link_file` and
    /// `link_directory_static` are all thin wrappers around it.
    fn insert(
        &self,
        virtual_path: &str,
        link_target: Option<&str>,
        is_directory: bool,
        extra_flags: u32,
    ) -> Result<NodeHandle> {
        self.region.write_lock();
        let result = self.insert_locked(virtual_path, link_target, is_directory, extra_flags);
        self.region.write_unlock();
        result
    }

    fn insert_locked(
        &self,
        virtual_path: &str,
        link_target: Option<&str>,
        is_directory: bool,
        extra_flags: u32,
    ) -> Result<NodeHandle> {
        let segments = path::segments(virtual_path);
        let mut current = self.region.root();
        for (i, segment) in segments.iter().enumerate() {
            let is_last = i == segments.len() - 1;
            match self.find_child(current, segment) {
                Some(existing) if !is_last => current = existing,
                Some(existing) if is_last => {
                    // Replace-on-collision: detach the old node first so
                    // readers that already hold it keep a consistent view,
                    // then splice a fresh node into its place in the
                    // sibling list.
                    let new_node = self.alloc_leaf(segment, link_target, is_directory, extra_flags)?;
                    self.splice_replace(current, existing, new_node)?;
                    current = new_node;
                }
                None if is_last => {
                    let new_node = self.alloc_leaf(segment, link_target, is_directory, extra_flags)?;
                    self.append_child(current, new_node)?;
                    current = new_node;
                }
                None => {
                    let dir = self.alloc_leaf(segment, None, true, 0)?;
                    self.append_child(current, dir)?;
                    current = dir;
                }
                Some(_) => unreachable!("is_last is a bool, so the guards above are exhaustive"),
            }
        }
        Ok(NodeHandle(current))
    }

    fn alloc_leaf(
        &self,
        name: &str,
        link_target: Option<&str>,
        is_directory: bool,
        extra_flags: u32,
    ) -> Result<u32> {
        let index = self.region.alloc_node()?;
        let (name_off, name_len) = self.region.alloc_string(name.as_bytes())?;
        let (link_off, link_len) = match link_target {
            Some(target) => self.region.alloc_string(target.as_bytes())?,
            None => (0, 0),
        };
        let raw = NodeRaw {
            parent: NONE,
            first_child: NONE,
            next_sibling: NONE,
            name_off,
            name_len,
            link_off,
            link_len,
            flags: extra_flags,
            is_directory,
        };
        self.region.write_node(index, &raw);
        Ok(index)
    }

    fn append_child(&self, parent: u32, child: u32) -> Result<()> {
        let mut parent_raw = self.region.read_node(parent);
        let mut child_raw = self.region.read_node(child);
        child_raw.parent = parent;

        if parent_raw.first_child == NONE
            || segment_cmp(&self.child_name(parent_raw.first_child), &self.node_name(&child_raw))
                == Ordering::Greater
        {
            child_raw.next_sibling = parent_raw.first_child;
            parent_raw.first_child = child;
            self.region.write_node(parent, &parent_raw);
            self.region.write_node(child, &child_raw);
            return Ok(());
        }

        let mut prev = parent_raw.first_child;
        loop {
            let prev_raw = self.region.read_node(prev);
            if prev_raw.next_sibling == NONE
                || segment_cmp(&self.child_name(prev_raw.next_sibling), &self.node_name(&child_raw))
                    == Ordering::Greater
            {
                child_raw.next_sibling = prev_raw.next_sibling;
                let mut prev_raw = prev_raw;
                prev_raw.next_sibling = child;
                self.region.write_node(prev, &prev_raw);
                self.region.write_node(child, &child_raw);
                return Ok(());
            }
            prev = prev_raw.next_sibling;
        }
    }

    fn splice_replace(&self, parent: u32, old_child: u32, new_child: u32) -> Result<()> {
        self.unlink_locked(parent, old_child);
        self.append_child(parent, new_child)
    }

    fn child_name(&self, index: u32) -> String {
        let raw = self.region.read_node(index);
        self.region.read_string(raw.name_off, raw.name_len)
    }

    fn node_name(&self, raw: &NodeRaw) -> String {
        self.region.read_string(raw.name_off, raw.name_len)
    }

    fn unlink_locked(&self, parent: u32, child: u32) {
        let parent_raw = self.region.read_node(parent);
        if parent_raw.first_child == child {
            let mut parent_raw = parent_raw;
            let child_raw = self.region.read_node(child);
            parent_raw.first_child = child_raw.next_sibling;
            self.region.write_node(parent, &parent_raw);
            return;
        }
        let mut prev = parent_raw.first_child;
        while prev != NONE {
            let prev_raw = self.region.read_node(prev);
            if prev_raw.next_sibling == child {
                let mut prev_raw = prev_raw;
                let child_raw = self.region.read_node(child);
                prev_raw.next_sibling = child_raw.next_sibling;
                self.region.write_node(prev, &prev_raw);
                return;
            }
            prev = prev_raw.next_sibling;
        }
    }

    /// Insert (or replace) a file link at `virtual_path`, pointing at
    /// `physical_target`. Used both by `VirtualLinkFile` and by the hook
    /// dispatcher recording a creation under a `CREATE_TARGET` subtree.
    pub fn add_file(&self, virtual_path: &str, physical_target: &str) -> Result<NodeHandle> {
        self.insert(virtual_path, Some(physical_target), false, 0)
    }

    /// `VirtualLinkFile`: requires the destination's parent to already
    /// resolve, either as an existing tree directory or a real directory on
    /// disk - matching the "link rejects non-existent parent" behavior.
    pub fn link_file(&self, source_real: &str, dest_virtual: &str) -> Result<NodeHandle> {
        self.ensure_parent_resolves(dest_virtual)?;
        self.insert(dest_virtual, Some(source_real), false, 0)
    }

    /// `VirtualLinkDirectoryStatic`. `source_real` must exist on disk.
    pub fn link_directory_static(
        &self,
        source_real: &str,
        dest_virtual: &str,
        flags: u32,
    ) -> Result<NodeHandle> {
        if !Path::new(source_real).is_dir() {
            return Err(Error::NoSuchSource(source_real.to_string()));
        }
        self.ensure_parent_resolves(dest_virtual)?;
        let extra = if flags & LINKFLAG_CREATETARGET != 0 {
            flags::CREATE_TARGET
        } else {
            0
        };
        let handle = self.insert(dest_virtual, Some(source_real), true, extra)?;

        if flags & LINKFLAG_RECURSIVE != 0 {
            self.link_recursive(source_real, dest_virtual)?;
        }
        Ok(handle)
    }

    fn link_recursive(&self, source_real: &str, dest_virtual: &str) -> Result<()> {
        for entry in walk_files(Path::new(source_real)) {
            let relative = entry
                .strip_prefix(source_real)
                .unwrap_or(&entry)
                .to_string_lossy()
                .trim_start_matches(['\\', '/'])
                .replace('/', "\\");
            let virtual_path = format!("{}\\{}", dest_virtual.trim_end_matches('\\'), relative);
            self.insert(&virtual_path, Some(&entry.to_string_lossy()), false, 0)?;
        }
        Ok(())
    }

    fn ensure_parent_resolves(&self, dest_virtual: &str) -> Result<()> {
        let segments = path::segments(dest_virtual);
        if segments.len() <= 1 {
            // dest_virtual is itself a bare drive (or UNC) root.
            return Ok(());
        }
        let parent_segments = &segments[..segments.len() - 1];
        if parent_segments.len() <= 1 {
            // parent is just the drive root, which always "exists"
            return Ok(());
        }
        let parent_path = parent_segments.join("\\");

        if self.find_node(&parent_path).is_some() {
            return Ok(());
        }
        if Path::new(&parent_path).is_dir() {
            return Ok(());
        }
        Err(Error::NoSuchParent(parent_path))
    }

    /// Detach `handle` from its parent's children. Readers that already
    /// hold `handle` (or obtained it from an in-flight `find_node`) keep
    /// reading valid, unchanged node data; they simply can no longer reach
    /// it by walking down from the root.
    pub fn remove_from_tree(&self, handle: NodeHandle) -> Result<()> {
        self.region.write_lock();
        let raw = self.region.read_node(handle.0);
        if raw.parent != NONE {
            self.unlink_locked(raw.parent, handle.0);
        }
        self.region.write_unlock();
        Ok(())
    }

    /// Drop all links, leaving only the root. Unlike `remove_from_tree`,
    /// this reclaims arena storage - any `NodeHandle` obtained before a
    /// `clear()` must not be dereferenced afterwards.
    pub fn clear(&self) {
        self.region.write_lock();
        self.region.reset_to_root_only();
        self.region.write_unlock();
    }
}

fn shared_region_path(instance_name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("usvfs-{instance_name}.tree"))
}

fn walk_files(root: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn find_node_on_empty_tree_returns_none() {
        let tree = Tree::new().unwrap();
        assert!(tree.find_node(r"C:\foo").is_none());
    }

    #[test]
    fn add_file_then_find_roundtrip() {
        let tree = Tree::new().unwrap();
        tree.add_file(r"C:\np.exe", r"C:\windows\notepad.exe").unwrap();
        let handle = tree.find_node(r"C:\np.exe").expect("inserted node");
        let data = tree.data(handle);
        assert_eq!(data.link_target.as_deref(), Some(r"C:\windows\notepad.exe"));
        assert!(!data.is_directory);
    }

    #[test]
    fn add_file_then_remove_makes_it_unfindable() {
        let tree = Tree::new().unwrap();
        let handle = tree.add_file(r"C:\np.exe", r"C:\windows\notepad.exe").unwrap();
        tree.remove_from_tree(handle).unwrap();
        assert!(tree.find_node(r"C:\np.exe").is_none());
    }

    #[test]
    fn removed_handle_data_still_readable() {
        let tree = Tree::new().unwrap();
        let handle = tree.add_file(r"C:\np.exe", r"C:\windows\notepad.exe").unwrap();
        tree.remove_from_tree(handle).unwrap();
        // the handle itself remains a valid read, per the arena's
        // never-recycle policy - this is what lets a reader mid-traversal
        // keep going safely.
        let data = tree.data(handle);
        assert_eq!(data.link_target.as_deref(), Some(r"C:\windows\notepad.exe"));
    }

    #[test]
    fn collision_replaces_and_detaches_old_node() {
        let tree = Tree::new().unwrap();
        let first = tree.add_file(r"C:\np.exe", r"C:\a.exe").unwrap();
        tree.add_file(r"C:\np.exe", r"C:\b.exe").unwrap();
        let current = tree.find_node(r"C:\np.exe").unwrap();
        assert_ne!(current, first);
        assert_eq!(tree.data(current).link_target.as_deref(), Some(r"C:\b.exe"));
        // the old node is unreachable but its own data is untouched.
        assert_eq!(tree.data(first).link_target.as_deref(), Some(r"C:\a.exe"));
    }

    #[test]
    fn link_file_rejects_nonexistent_parent() {
        let tree = Tree::new().unwrap();
        let err = tree
            .link_file(r"C:\windows\notepad.exe", r"C:\this_directory_shouldnt_exist\np.exe")
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchParent(_)));
    }

    #[test]
    fn link_file_under_drive_root_succeeds() {
        let tree = Tree::new().unwrap();
        tree.link_file(r"C:\windows\notepad.exe", r"C:\np.exe").unwrap();
        assert!(tree.find_node(r"C:\np.exe").is_some());
    }

    #[test]
    fn link_directory_static_recursive_enumerates_files() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a").join("f.txt"), b"hi").unwrap();
        std::fs::write(dir.path().join("g.txt"), b"hi").unwrap();

        let tree = Tree::new().unwrap();
        let source = dir.path().to_string_lossy().into_owned();
        tree.link_directory_static(&source, r"C:\mount", LINKFLAG_RECURSIVE)
            .unwrap();

        assert!(tree.find_node(r"C:\mount\g.txt").is_some());
        assert!(tree.find_node(r"C:\mount\a\f.txt").is_some());
    }

    #[test]
    fn create_target_flag_is_found_by_deepest_create_target() {
        let dir = tempdir().unwrap();
        let tree = Tree::new().unwrap();
        let source = dir.path().to_string_lossy().into_owned();
        tree.link_directory_static(&source, r"C:\mount", LINKFLAG_CREATETARGET)
            .unwrap();

        let (_, target) = tree
            .deepest_create_target(r"C:\mount\new\file.txt")
            .expect("create-target ancestor found");
        assert_eq!(target, source);
    }

    #[test]
    fn clear_removes_everything_but_root() {
        let tree = Tree::new().unwrap();
        tree.add_file(r"C:\np.exe", r"C:\a.exe").unwrap();
        tree.clear();
        assert!(tree.find_node(r"C:\np.exe").is_none());
    }

    #[test]
    fn directory_enumeration_order_is_case_folded_code_point_order() {
        let tree = Tree::new().unwrap();
        tree.add_file(r"C:\mount\b.txt", r"C:\src\b.txt").unwrap();
        tree.add_file(r"C:\mount\A.txt", r"C:\src\A.txt").unwrap();
        tree.add_file(r"C:\mount\c.txt", r"C:\src\c.txt").unwrap();

        let dir = tree.find_node(r"C:\mount").unwrap();
        let mut names = Vec::new();
        let mut current = tree.region.read_node(dir.0).first_child;
        while current != NONE {
            let raw = tree.region.read_node(current);
            names.push(tree.region.read_string(raw.name_off, raw.name_len));
            current = raw.next_sibling;
        }
        assert_eq!(names, vec!["A.txt", "b.txt", "c.txt"]);
    }
}
