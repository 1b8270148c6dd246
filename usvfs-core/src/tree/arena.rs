// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The position-independent node/string storage backing [`super::Tree`].
//!
//! Per the design notes on cross-process sharing: node data lives in a flat
//! byte region addressed by `u32` offsets rather than machine pointers, so
//! that a second process mapping the same named region sees the identical
//! tree without any pointer-relocation step. Two allocators share the
//! region: node slots bump forward from just after the header, and link-
//! target / segment-name bytes bump backward from the end. Detached nodes
//! are never reclaimed (see DESIGN.md) - this is a deliberate simplification
//! of the original's reference-counted node storage, acceptable because the
//! region's lifetime matches the tree's (created once at engine init,
//! destroyed at teardown, never long enough to exhaust a reasonably sized
//! region in practice).

use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;

use crate::error::{Error, Result};

pub const NONE: u32 = u32::MAX;

pub const FLAG_CREATE_TARGET: u32 = 1 << 0;

const HEADER_LEN: usize = 32;
const NODE_SIZE: usize = 48;

/// Default arena size: generous for a session's worth of links, small
/// enough to map eagerly without surprising a host process.
pub const DEFAULT_CAPACITY: usize = 8 * 1024 * 1024;

/// Fixed-layout fields of one tree node, as stored in the region.
/// Offsets are byte offsets from the start of the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRaw {
    pub parent: u32,
    pub first_child: u32,
    pub next_sibling: u32,
    pub name_off: u32,
    pub name_len: u32,
    pub link_off: u32,
    pub link_len: u32,
    pub flags: u32,
    pub is_directory: bool,
}

impl NodeRaw {
    fn empty() -> Self {
        NodeRaw {
            parent: NONE,
            first_child: NONE,
            next_sibling: NONE,
            name_off: 0,
            name_len: 0,
            link_off: 0,
            link_len: 0,
            flags: 0,
            is_directory: false,
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.parent.to_le_bytes());
        buf[4..8].copy_from_slice(&self.first_child.to_le_bytes());
        buf[8..12].copy_from_slice(&self.next_sibling.to_le_bytes());
        buf[12..16].copy_from_slice(&self.name_off.to_le_bytes());
        buf[16..20].copy_from_slice(&self.name_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.link_off.to_le_bytes());
        buf[24..28].copy_from_slice(&self.link_len.to_le_bytes());
        buf[28..32].copy_from_slice(&self.flags.to_le_bytes());
        buf[32..36].copy_from_slice(&(self.is_directory as u32).to_le_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
        NodeRaw {
            parent: u32_at(0),
            first_child: u32_at(4),
            next_sibling: u32_at(8),
            name_off: u32_at(12),
            name_len: u32_at(16),
            link_off: u32_at(20),
            link_len: u32_at(24),
            flags: u32_at(28),
            is_directory: u32_at(32) != 0,
        }
    }
}

/// Backing storage for a tree: either an anonymous in-process region (the
/// common case for a single hooked process) or one mapped from a named file
/// under the OS temp directory, which is how two processes sharing an
/// `instance_name` actually observe the same bytes.
pub struct Region {
    map: MmapMut,
}

// SAFETY: all mutation goes through atomics or is guarded by `RegionLock`,
// which readers and writers both acquire before touching node/string bytes.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a fresh anonymous region, header-initialized with an empty
    /// root node at offset 0.
    pub fn new_anonymous(capacity: usize) -> Result<Self> {
        let map = MmapMut::map_anon(capacity)?;
        let region = Region { map };
        region.init_header(capacity);
        Ok(region)
    }

    /// Create or attach to a named, file-backed region so a second process
    /// that maps the same path observes the same tree. `create` selects
    /// between initializing a fresh header and attaching to an existing one.
    pub fn open_named(path: &std::path::Path, capacity: usize, create: bool) -> Result<Self> {
        use std::fs::OpenOptions;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;
        if create {
            file.set_len(capacity as u64)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let region = Region { map };
        if create {
            region.init_header(capacity);
        }
        Ok(region)
    }

    fn init_header(&self, capacity: usize) {
        self.lock_state().store(0, Ordering::Relaxed);
        self.node_count().store(0, Ordering::Relaxed);
        self.string_used().store(0, Ordering::Relaxed);
        self.capacity_cell().store(capacity as u32, Ordering::Relaxed);
        // node 0 is always the root, allocated eagerly.
        let root = NodeRaw {
            is_directory: true,
            ..NodeRaw::empty()
        };
        self.node_count().store(1, Ordering::Relaxed);
        root.write(self.node_slot_mut(0));
    }

    fn header_u32(&self, byte_offset: usize) -> &AtomicU32 {
        let ptr = self.map.as_ptr().wrapping_add(byte_offset) as *mut u32;
        // SAFETY: `ptr` is 4-byte aligned (header fields are laid out on
        // 4-byte boundaries) and stays within the mapped region for the
        // region's lifetime.
        unsafe { AtomicU32::from_ptr(ptr) }
    }

    fn lock_state(&self) -> &AtomicU32 {
        self.header_u32(0)
    }

    fn node_count(&self) -> &AtomicU32 {
        self.header_u32(4)
    }

    fn string_used(&self) -> &AtomicU32 {
        self.header_u32(8)
    }

    fn capacity_cell(&self) -> &AtomicU32 {
        self.header_u32(12)
    }

    pub fn root(&self) -> u32 {
        0
    }

    fn node_slot(&self, index: u32) -> &[u8] {
        let start = HEADER_LEN + index as usize * NODE_SIZE;
        &self.map[start..start + NODE_SIZE]
    }

    fn node_slot_mut(&self, index: u32) -> &mut [u8] {
        let start = HEADER_LEN + index as usize * NODE_SIZE;
        // SAFETY: callers hold the region's write lock, or are the single
        // initializer before any other reference to the region exists.
        let ptr = self.map.as_ptr().wrapping_add(start) as *mut u8;
        unsafe { std::slice::from_raw_parts_mut(ptr, NODE_SIZE) }
    }

    pub fn read_node(&self, index: u32) -> NodeRaw {
        NodeRaw::read(self.node_slot(index))
    }

    pub fn write_node(&self, index: u32, node: &NodeRaw) {
        node.write(self.node_slot_mut(index));
    }

    pub fn read_string(&self, off: u32, len: u32) -> String {
        if len == 0 {
            return String::new();
        }
        let start = off as usize;
        let end = start + len as usize;
        String::from_utf8_lossy(&self.map[start..end]).into_owned()
    }

    /// Allocate a new node slot, returning its index.
    pub fn alloc_node(&self) -> Result<u32> {
        let capacity = self.capacity_cell().load(Ordering::Relaxed) as usize;
        let index = self.node_count().fetch_add(1, Ordering::AcqRel);
        let node_region_end = HEADER_LEN + (index as usize + 1) * NODE_SIZE;
        let string_region_start = capacity
            .checked_sub(self.string_used().load(Ordering::Relaxed) as usize)
            .unwrap_or(0);
        if node_region_end > string_region_start {
            self.node_count().fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ArenaFull { capacity });
        }
        NodeRaw::empty().write(self.node_slot_mut(index));
        Ok(index)
    }

    /// Copy `bytes` into the string heap (growing backward from the end of
    /// the region) and return `(offset, len)`.
    pub fn alloc_string(&self, bytes: &[u8]) -> Result<(u32, u32)> {
        if bytes.is_empty() {
            return Ok((0, 0));
        }
        let capacity = self.capacity_cell().load(Ordering::Relaxed) as usize;
        let used = self
            .string_used()
            .fetch_add(bytes.len() as u32, Ordering::AcqRel) as usize;
        let new_used = used + bytes.len();
        let node_region_end =
            HEADER_LEN + self.node_count().load(Ordering::Relaxed) as usize * NODE_SIZE;
        let start = match capacity.checked_sub(new_used) {
            Some(start) if start >= node_region_end => start,
            _ => {
                self.string_used()
                    .fetch_sub(bytes.len() as u32, Ordering::AcqRel);
                return Err(Error::ArenaFull { capacity });
            }
        };
        // SAFETY: `[start, start+len)` was just reserved exclusively by the
        // fetch_add above and lies within the mapped region.
        let ptr = self.map.as_ptr().wrapping_add(start) as *mut u8;
        let dst = unsafe { std::slice::from_raw_parts_mut(ptr, bytes.len()) };
        dst.copy_from_slice(bytes);
        Ok((start as u32, bytes.len() as u32))
    }

    /// A coarse-grained reader/writer lock living in the region itself, so
    /// every attached process synchronizes through the same word of memory
    /// rather than a process-local primitive. State encoding: `0` = free,
    /// `u32::MAX` = write-locked, otherwise the live reader count.
    pub fn read_lock(&self) {
        loop {
            let current = self.lock_state().load(Ordering::Acquire);
            if current == u32::MAX {
                std::thread::yield_now();
                continue;
            }
            if self
                .lock_state()
                .compare_exchange_weak(
                    current,
                    current + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn read_unlock(&self) {
        self.lock_state().fetch_sub(1, Ordering::AcqRel);
    }

    pub fn write_lock(&self) {
        loop {
            if self
                .lock_state()
                .compare_exchange_weak(0, u32::MAX, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            std::thread::yield_now();
        }
    }

    pub fn write_unlock(&self) {
        self.lock_state().store(0, Ordering::Release);
    }

    /// Reclaim every node and string except the root. Caller must hold the
    /// write lock.
    pub fn reset_to_root_only(&self) {
        self.node_count().store(1, Ordering::Relaxed);
        self.string_used().store(0, Ordering::Relaxed);
        NodeRaw {
            is_directory: true,
            ..NodeRaw::empty()
        }
        .write(self.node_slot_mut(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_node_exists_after_init() {
        let region = Region::new_anonymous(64 * 1024).unwrap();
        let root = region.read_node(region.root());
        assert!(root.is_directory);
        assert_eq!(root.parent, NONE);
    }

    #[test]
    fn alloc_node_and_string_roundtrip() {
        let region = Region::new_anonymous(64 * 1024).unwrap();
        let idx = region.alloc_node().unwrap();
        let (off, len) = region.alloc_string(b"hello").unwrap();
        let mut raw = region.read_node(idx);
        raw.name_off = off;
        raw.name_len = len;
        region.write_node(idx, &raw);
        assert_eq!(region.read_string(off, len), "hello");
    }

    #[test]
    fn arena_full_reports_capacity() {
        let region = Region::new_anonymous(HEADER_LEN + NODE_SIZE).unwrap();
        // slot 0 is the root; the next allocation has no room left.
        let err = region.alloc_node().unwrap_err();
        match err {
            Error::ArenaFull { capacity } => assert_eq!(capacity, HEADER_LEN + NODE_SIZE),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn concurrent_readers_do_not_block_each_other() {
        let region = Region::new_anonymous(64 * 1024).unwrap();
        region.read_lock();
        region.read_lock();
        region.read_unlock();
        region.read_unlock();
    }
}
