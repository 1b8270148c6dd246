// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Mutex groups: the thread-local reentrancy counters that let a hooked
//! call safely invoke another hooked API internally (spec §5, §9 "Recursion
//! through the very APIs we hook").
//!
//! A hook wraps its body in [`enter`]. If the returned `active` flag is
//! `false`, the current thread is already inside that same group - almost
//! always because the engine's own code (the canonicalizer, the
//! create-target directory-chain builder) is calling a hooked primitive -
//! and the dispatcher must call straight through to the original API
//! without consulting the rerouter.

use std::cell::RefCell;

use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum MutexGroup {
    OpenFile = 0,
    FileAttributes = 1,
    DeleteFile = 2,
    ShellFileOp = 3,
    SearchFiles = 4,
    FindFiles = 5,
    LoadLibrary = 6,
    CreateProcess = 7,
    FullPathname = 8,
}

const GROUP_COUNT: usize = 9;

const ALL_GROUPS: [MutexGroup; GROUP_COUNT] = [
    MutexGroup::OpenFile,
    MutexGroup::FileAttributes,
    MutexGroup::DeleteFile,
    MutexGroup::ShellFileOp,
    MutexGroup::SearchFiles,
    MutexGroup::FindFiles,
    MutexGroup::LoadLibrary,
    MutexGroup::CreateProcess,
    MutexGroup::FullPathname,
];

thread_local! {
    static DEPTH: RefCell<[u32; GROUP_COUNT]> = const { RefCell::new([0; GROUP_COUNT]) };
}

/// Raises the counters it was constructed with for its lifetime, and lowers
/// them again on drop - an RAII stand-in for the original's
/// `FunctionGroupLock`.
#[must_use]
pub struct GroupGuard(SmallVec<[usize; GROUP_COUNT]>);

impl Drop for GroupGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| {
            let mut depth = depth.borrow_mut();
            for &idx in &self.0 {
                depth[idx] = depth[idx].saturating_sub(1);
            }
        });
    }
}

/// Enter a single named group. The returned `bool` is `true` ("active")
/// exactly when this thread was not already inside that group - i.e. this
/// is a genuine call from the host, not the engine recursing into itself.
pub fn enter(group: MutexGroup) -> (GroupGuard, bool) {
    let idx = group as usize;
    let active = DEPTH.with(|depth| depth.borrow()[idx] == 0);
    DEPTH.with(|depth| depth.borrow_mut()[idx] += 1);
    let mut members = SmallVec::new();
    members.push(idx);
    (GroupGuard(members), active)
}

/// `ALL_GROUPS`: raise every counter, so nothing hooked can treat itself as
/// active while this guard lives - used around internal helpers (building
/// a create-target's directory chain, for instance) that must never
/// re-enter rerouting logic no matter which hook they end up calling.
pub fn enter_all() -> GroupGuard {
    DEPTH.with(|depth| {
        for c in depth.borrow_mut().iter_mut() {
            *c += 1;
        }
    });
    GroupGuard(ALL_GROUPS.iter().map(|g| *g as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entry_is_active() {
        let (_guard, active) = enter(MutexGroup::OpenFile);
        assert!(active);
    }

    #[test]
    fn nested_entry_into_same_group_is_inactive() {
        let (_outer, outer_active) = enter(MutexGroup::OpenFile);
        assert!(outer_active);
        let (_inner, inner_active) = enter(MutexGroup::OpenFile);
        assert!(!inner_active);
    }

    #[test]
    fn unrelated_groups_do_not_interfere() {
        let (_a, a_active) = enter(MutexGroup::OpenFile);
        let (_b, b_active) = enter(MutexGroup::DeleteFile);
        assert!(a_active);
        assert!(b_active);
    }

    #[test]
    fn guard_drop_restores_activity() {
        {
            let (_g, active) = enter(MutexGroup::FullPathname);
            assert!(active);
        }
        let (_g2, active2) = enter(MutexGroup::FullPathname);
        assert!(active2);
    }

    #[test]
    fn enter_all_blocks_every_group() {
        let _all = enter_all();
        let (_g, active) = enter(MutexGroup::CreateProcess);
        assert!(!active);
    }
}
