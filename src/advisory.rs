//! Advisory byte-range locking.
//!
//! Each node carries a lazily created lock structure (dropped again once its
//! list empties) and a wake primitive. Two owner semantics coexist in one
//! list: per-process byte-range locks, and whole/partial-file locks scoped to
//! a cooperating session, releasable by any member of that session.
//!
//! Two locks conflict when they overlap, belong to different owners and at
//! least one of them is exclusive. A blocking acquire waits on the node's
//! condvar and re-scans the list from scratch after every wake-up, since the
//! conflict set may have changed arbitrarily in between. Every mutation wakes
//! all waiters.

use std::sync::PoisonError;
use std::time::{Duration, Instant};

use crate::error::{vfs_error, ErrorKind, VfsResult};
use crate::node::Vnode;
use crate::types::LockOwner;

/// Byte range covering the whole file.
pub const WHOLE_FILE: (u64, u64) = (0, u64::MAX);

/// One advisory lock: a half-open byte range [start, end) plus owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvisoryLock {
    pub owner: LockOwner,
    pub start: u64,
    pub end: u64,
    pub shared: bool,
}

impl AdvisoryLock {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    /// Conflict rule: overlap, different owner, at least one side exclusive.
    pub fn conflicts_with(&self, other: &AdvisoryLock) -> bool {
        if self.owner == other.owner {
            return false;
        }
        if !self.overlaps(other.start, other.end) {
            return false;
        }
        !(self.shared && other.shared)
    }
}

/// The per-node lock list. Lives inside `Vnode::advisory` as an `Option` so
/// nodes that never see locking pay one pointer.
#[derive(Debug, Default)]
pub(crate) struct AdvisoryLocking {
    locks: Vec<AdvisoryLock>,
}

impl AdvisoryLocking {
    pub(crate) fn new() -> Self {
        Self { locks: Vec::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub(crate) fn find_conflict(&self, request: &AdvisoryLock) -> Option<&AdvisoryLock> {
        self.locks.iter().find(|held| held.conflicts_with(request))
    }

    pub(crate) fn insert(&mut self, lock: AdvisoryLock) {
        self.locks.push(lock);
    }

    /// Remove every lock a session owner holds. Returns whether anything
    /// changed.
    fn release_session(&mut self, owner: LockOwner) -> bool {
        let before = self.locks.len();
        self.locks.retain(|l| l.owner != owner);
        self.locks.len() != before
    }

    /// Release [start, end) for a process owner. Held ranges overlapping the
    /// request are removed, truncated, or split into two remains.
    fn release_range(&mut self, owner: LockOwner, start: u64, end: u64) -> bool {
        let mut changed = false;
        let mut remains: Vec<AdvisoryLock> = Vec::new();
        self.locks.retain_mut(|held| {
            if held.owner != owner || !held.overlaps(start, end) {
                return true;
            }
            changed = true;
            if held.start < start && held.end > end {
                // Release in the middle: split into two remains.
                remains.push(AdvisoryLock { start: end, end: held.end, ..*held });
                held.end = start;
                true
            } else if held.start < start {
                held.end = start;
                true
            } else if held.end > end {
                held.start = end;
                true
            } else {
                false
            }
        });
        self.locks.extend(remains);
        changed
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Acquire a lock on `vnode`.
///
/// Non-blocking conflicting requests fail `WouldBlock` immediately. Blocking
/// requests wait on the node's wake primitive; when `timeout` is set the wait
/// is abandoned with `Interrupted` once it elapses.
pub(crate) fn acquire(
    vnode: &Vnode,
    owner: LockOwner,
    range: (u64, u64),
    shared: bool,
    wait: bool,
    timeout: Option<Duration>,
) -> VfsResult<()> {
    let (start, end) = range;
    if start >= end {
        return Err(vfs_error(ErrorKind::InvalidArgument, "empty lock range"));
    }
    let request = AdvisoryLock { owner, start, end, shared };
    let deadline = timeout.map(|t| Instant::now() + t);

    let mut guard = vnode.advisory.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        let locking = guard.get_or_insert_with(AdvisoryLocking::new);
        if locking.find_conflict(&request).is_none() {
            locking.insert(request);
            return Ok(());
        }
        if !wait {
            return Err(vfs_error(ErrorKind::WouldBlock, "conflicting lock held"));
        }
        guard = match deadline {
            None => vnode
                .advisory_wake
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(vfs_error(ErrorKind::Interrupted, "lock wait abandoned"));
                }
                vnode
                    .advisory_wake
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        // Re-scan from scratch: the conflict set may have changed.
    }
}

/// Release locks on `vnode`.
///
/// Session owners drop every lock of that session regardless of `range`.
/// Process owners release the given range (whole file when `None`), which
/// may remove, truncate or split held entries. All waiters are woken after
/// any mutation.
pub(crate) fn release(
    vnode: &Vnode,
    owner: LockOwner,
    range: Option<(u64, u64)>,
) -> VfsResult<()> {
    let mut guard = vnode.advisory.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(locking) = guard.as_mut() else {
        return Ok(());
    };
    let changed = match owner {
        LockOwner::Session(_) => locking.release_session(owner),
        LockOwner::Process(_) => {
            let (start, end) = range.unwrap_or(WHOLE_FILE);
            locking.release_range(owner, start, end)
        }
    };
    if locking.is_empty() {
        *guard = None;
    }
    drop(guard);
    if changed {
        vnode.advisory_wake.notify_all();
    }
    Ok(())
}

/// Report the first held lock that would block the given request, if any.
pub(crate) fn query(
    vnode: &Vnode,
    owner: LockOwner,
    range: (u64, u64),
    shared: bool,
) -> Option<AdvisoryLock> {
    let (start, end) = range;
    let request = AdvisoryLock { owner, start, end, shared };
    let guard = vnode.advisory.lock().unwrap_or_else(PoisonError::into_inner);
    guard
        .as_ref()
        .and_then(|locking| locking.find_conflict(&request).copied())
}

/// Number of locks currently held on `vnode`; diagnostic/test aid.
pub(crate) fn held_count(vnode: &Vnode) -> usize {
    let guard = vnode.advisory.lock().unwrap_or_else(PoisonError::into_inner);
    guard.as_ref().map(|l| l.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(owner: LockOwner, start: u64, end: u64, shared: bool) -> AdvisoryLock {
        AdvisoryLock { owner, start, end, shared }
    }

    const P1: LockOwner = LockOwner::Process(1);
    const P2: LockOwner = LockOwner::Process(2);

    #[test]
    fn shared_locks_do_not_conflict() {
        let a = lock(P1, 0, 10, true);
        let b = lock(P2, 5, 15, true);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn exclusive_overlap_conflicts_across_owners_only() {
        let a = lock(P1, 0, 10, false);
        assert!(a.conflicts_with(&lock(P2, 5, 15, false)));
        assert!(a.conflicts_with(&lock(P2, 5, 15, true)));
        assert!(!a.conflicts_with(&lock(P1, 5, 15, false)));
        assert!(!a.conflicts_with(&lock(P2, 10, 15, false)));
    }

    #[test]
    fn release_middle_splits_into_two() {
        let mut locking = AdvisoryLocking::new();
        locking.insert(lock(P1, 0, 100, false));
        assert!(locking.release_range(P1, 40, 60));
        assert_eq!(locking.len(), 2);
        assert!(locking.find_conflict(&lock(P2, 0, 40, false)).is_some());
        assert!(locking.find_conflict(&lock(P2, 40, 60, false)).is_none());
        assert!(locking.find_conflict(&lock(P2, 60, 100, false)).is_some());
    }

    #[test]
    fn release_edge_truncates() {
        let mut locking = AdvisoryLocking::new();
        locking.insert(lock(P1, 10, 50, false));
        assert!(locking.release_range(P1, 0, 20));
        assert_eq!(locking.len(), 1);
        assert!(locking.find_conflict(&lock(P2, 10, 20, false)).is_none());
        assert!(locking.find_conflict(&lock(P2, 20, 30, false)).is_some());

        assert!(locking.release_range(P1, 40, 60));
        assert!(locking.find_conflict(&lock(P2, 45, 50, false)).is_none());
        assert!(locking.find_conflict(&lock(P2, 30, 40, false)).is_some());
    }

    #[test]
    fn release_exact_removes() {
        let mut locking = AdvisoryLocking::new();
        locking.insert(lock(P1, 0, 10, false));
        assert!(locking.release_range(P1, 0, 10));
        assert!(locking.is_empty());
    }

    #[test]
    fn session_release_drops_all_entries() {
        let session = LockOwner::Session(7);
        let mut locking = AdvisoryLocking::new();
        locking.insert(lock(session, 0, u64::MAX, false));
        locking.insert(lock(session, 0, 10, true));
        locking.insert(lock(P1, 0, 5, true));
        assert!(locking.release_session(session));
        assert_eq!(locking.len(), 1);
    }

    #[test]
    fn release_does_not_touch_other_owners() {
        let mut locking = AdvisoryLocking::new();
        locking.insert(lock(P1, 0, 10, true));
        locking.insert(lock(P2, 0, 10, true));
        assert!(locking.release_range(P1, 0, 10));
        assert_eq!(locking.len(), 1);
        assert!(locking.find_conflict(&lock(P1, 0, 10, false)).is_some());
    }
}
