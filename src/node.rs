//! Node (vnode) table and lifecycle.
//!
//! Every filesystem entry the VFS has touched is represented by one [`Vnode`]
//! in a process-wide table keyed by (mount id, node id). Callers never hold a
//! `Vnode` directly; they hold a [`NodeRef`], which owns exactly one unit of
//! the vnode's reference count and returns it on drop. That makes the
//! acquire/release discipline a move-semantics property instead of a
//! convention.
//!
//! Lifecycle: a vnode is created busy with one reference on first lookup (or
//! by driver registration), populated by the driver's `get_node` hook, and
//! published. When the count reaches zero it either moves to the unused LRU
//! list (cheap re-acquisition) or, if its remove flag is set, is freed at
//! once. Freeing always runs the driver teardown hook *before* the vnode
//! leaves the table, with the busy flag blocking new references meanwhile.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};

use hashbrown::HashMap;
use spin::RwLock as SpinRwLock;

use crate::driver::NodePrivate;
use crate::error::{vfs_error, ErrorKind, VfsResult};
use crate::mount::Mount;
use crate::types::{GlobalNodeId, MemoryPressure, MountId, NodeId, NodeKind, VfsOptions};

/// Opaque handle onto the page/block cache backing a node. The VFS only ever
/// flushes or discards it; the implementation lives elsewhere.
pub trait CacheHandle: Send + Sync {
    fn flush(&self) -> VfsResult<()>;
    fn discard(&self);
}

/// One cached or open filesystem entry.
pub struct Vnode {
    id: GlobalNodeId,
    mount: Weak<Mount>,
    ref_count: AtomicU32,
    /// Structural mutation in progress; no new references may be taken.
    busy: AtomicBool,
    /// Free (and ask the driver to delete) on last reference drop.
    removed: AtomicBool,
    /// Registered by a driver but not yet published; treated like busy.
    unpublished: AtomicBool,
    kind: SpinRwLock<NodeKind>,
    private: SpinRwLock<Option<NodePrivate>>,
    /// Root vnode of the mount covering this node, when this node is a mount
    /// point. Non-owning; the covering mount holds the owned references.
    covered_by: SpinRwLock<Option<Weak<Vnode>>>,
    /// On a mount's root vnode: the directory it covers.
    covers: SpinRwLock<Option<Arc<Vnode>>>,
    /// Directory this node was last looked up in, same mount. A hint for
    /// inverse path reconstruction; stale after a concurrent rename.
    parent: SpinRwLock<Option<NodeId>>,
    cache: SpinRwLock<Option<Arc<dyn CacheHandle>>>,
    /// Lazily created advisory-lock state, deleted once its list empties.
    pub(crate) advisory: Mutex<Option<crate::advisory::AdvisoryLocking>>,
    /// Wake primitive for advisory-lock waiters on this node.
    pub(crate) advisory_wake: Condvar,
}

impl Vnode {
    fn new(id: GlobalNodeId, mount: Weak<Mount>) -> Self {
        Self {
            id,
            mount,
            ref_count: AtomicU32::new(1),
            busy: AtomicBool::new(true),
            removed: AtomicBool::new(false),
            unpublished: AtomicBool::new(false),
            kind: SpinRwLock::new(NodeKind::Unknown),
            private: SpinRwLock::new(None),
            covered_by: SpinRwLock::new(None),
            covers: SpinRwLock::new(None),
            parent: SpinRwLock::new(None),
            cache: SpinRwLock::new(None),
            advisory: Mutex::new(None),
            advisory_wake: Condvar::new(),
        }
    }

    pub fn id(&self) -> GlobalNodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        *self.kind.read()
    }

    pub(crate) fn set_kind(&self, kind: NodeKind) {
        *self.kind.write() = kind;
    }

    pub fn mount(&self) -> VfsResult<Arc<Mount>> {
        self.mount
            .upgrade()
            .ok_or_else(|| vfs_error(ErrorKind::Stale, "owning mount is gone"))
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn set_removed(&self, removed: bool) {
        self.removed.store(removed, Ordering::Release);
    }

    fn is_unpublished(&self) -> bool {
        self.unpublished.load(Ordering::Acquire)
    }

    pub(crate) fn private(&self) -> VfsResult<NodePrivate> {
        self.private
            .read()
            .clone()
            .ok_or_else(|| vfs_error(ErrorKind::Internal, "node has no driver data"))
    }

    pub(crate) fn covered_by(&self) -> Option<Arc<Vnode>> {
        self.covered_by.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_covered_by(&self, root: Option<Weak<Vnode>>) {
        *self.covered_by.write() = root;
    }

    pub(crate) fn parent(&self) -> Option<NodeId> {
        *self.parent.read()
    }

    pub(crate) fn set_parent(&self, parent: NodeId) {
        *self.parent.write() = Some(parent);
    }

    pub(crate) fn covers(&self) -> Option<Arc<Vnode>> {
        self.covers.read().clone()
    }

    pub(crate) fn set_covers(&self, covers: Option<Arc<Vnode>>) {
        *self.covers.write() = covers;
    }

    pub(crate) fn cache(&self) -> Option<Arc<dyn CacheHandle>> {
        self.cache.read().clone()
    }

    pub(crate) fn set_cache(&self, handle: Option<Arc<dyn CacheHandle>>) {
        *self.cache.write() = handle;
    }
}

impl fmt::Debug for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vnode")
            .field("id", &self.id)
            .field("refs", &self.ref_count())
            .field("busy", &self.is_busy())
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// Owned reference to a vnode. Consuming (dropping) it releases exactly one
/// unit of the reference count; cloning acquires one.
pub struct NodeRef {
    vnode: Arc<Vnode>,
    table: Arc<NodeTable>,
}

impl NodeRef {
    fn new(vnode: Arc<Vnode>, table: Arc<NodeTable>) -> Self {
        Self { vnode, table }
    }

    pub fn id(&self) -> GlobalNodeId {
        self.vnode.id
    }

    pub fn node_id(&self) -> NodeId {
        self.vnode.id.node
    }

    pub fn mount_id(&self) -> MountId {
        self.vnode.id.mount
    }

    pub fn kind(&self) -> NodeKind {
        self.vnode.kind()
    }

    pub fn mount(&self) -> VfsResult<Arc<Mount>> {
        self.vnode.mount()
    }

    pub fn private(&self) -> VfsResult<NodePrivate> {
        self.vnode.private()
    }

    /// Mark the node for deletion: once the last reference drops the driver's
    /// `remove_node` hook runs instead of `put_node`.
    pub fn set_removed(&self) {
        self.vnode.set_removed(true);
    }

    /// Attach the opaque page-cache handle the low-memory path flushes.
    pub fn attach_cache(&self, handle: Arc<dyn CacheHandle>) {
        self.vnode.set_cache(Some(handle));
    }

    pub(crate) fn vnode(&self) -> &Arc<Vnode> {
        &self.vnode
    }

    pub(crate) fn same_node(&self, other: &Arc<Vnode>) -> bool {
        Arc::ptr_eq(&self.vnode, other)
    }

    /// Give up the reference without running the release path. Used only by
    /// unmount teardown, which frees the mount's nodes directly.
    pub(crate) fn leak(self) -> Arc<Vnode> {
        let vnode = Arc::clone(&self.vnode);
        core::mem::forget(self);
        vnode
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        // Safe without the table lock: we already hold a unit of the count,
        // so it cannot reach zero concurrently.
        self.vnode.ref_count.fetch_add(1, Ordering::AcqRel);
        Self {
            vnode: Arc::clone(&self.vnode),
            table: Arc::clone(&self.table),
        }
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.table.put(&self.vnode);
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.vnode).finish()
    }
}

struct TableInner {
    nodes: HashMap<GlobalNodeId, Arc<Vnode>>,
    /// Zero-reference nodes kept for cheap re-acquisition; front is most
    /// recently released.
    unused: VecDeque<Arc<Vnode>>,
}

impl TableInner {
    fn drop_unused(&mut self, vnode: &Arc<Vnode>) {
        if let Some(pos) = self.unused.iter().position(|v| Arc::ptr_eq(v, vnode)) {
            self.unused.remove(pos);
        }
    }
}

/// Process-wide vnode registry.
pub struct NodeTable {
    inner: Mutex<TableInner>,
    /// Signaled whenever a busy flag clears or a node leaves the table.
    busy_wake: Condvar,
    max_unused: usize,
    busy_retry_limit: u32,
    busy_wait_slice: core::time::Duration,
}

fn lock_inner(table: &NodeTable) -> std::sync::MutexGuard<'_, TableInner> {
    table.inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NodeTable {
    pub(crate) fn new(options: &VfsOptions) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TableInner {
                nodes: HashMap::new(),
                unused: VecDeque::new(),
            }),
            busy_wake: Condvar::new(),
            max_unused: options.max_unused_nodes,
            busy_retry_limit: options.busy_retry_limit,
            busy_wait_slice: options.busy_wait_slice,
        })
    }

    /// Acquire a reference to (mount, id), creating and populating the vnode
    /// through the driver's `get_node` hook on first reference.
    ///
    /// A busy or unpublished entry is waited on with bounded timed waits when
    /// `can_wait` is set; past the bound (or immediately when it is not) the
    /// call fails `Busy`.
    pub(crate) fn get(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        id: NodeId,
        can_wait: bool,
    ) -> VfsResult<NodeRef> {
        let gid = GlobalNodeId { mount: mount.id(), node: id };
        let mut attempts: u32 = 0;

        loop {
            let mut inner = lock_inner(self);

            if mount.is_unmounting() {
                return Err(vfs_error(ErrorKind::Busy, "mount is being unmounted"));
            }

            if let Some(vnode) = inner.nodes.get(&gid).cloned() {
                if vnode.is_busy() || vnode.is_unpublished() {
                    if !can_wait {
                        return Err(vfs_error(ErrorKind::Busy, "node is busy"));
                    }
                    attempts += 1;
                    if attempts > self.busy_retry_limit {
                        return Err(vfs_error(
                            ErrorKind::Busy,
                            "node stayed busy past the retry bound",
                        ));
                    }
                    let (guard, _timeout) = self
                        .busy_wake
                        .wait_timeout(inner, self.busy_wait_slice)
                        .unwrap_or_else(PoisonError::into_inner);
                    drop(guard);
                    continue;
                }
                let previous = vnode.ref_count.fetch_add(1, Ordering::AcqRel);
                if previous == 0 {
                    inner.drop_unused(&vnode);
                }
                return Ok(NodeRef::new(vnode, Arc::clone(self)));
            }

            let ops = mount.ops()?;

            // First reference: insert a busy skeleton so concurrent callers
            // wait, then populate it outside the table lock.
            let vnode = Arc::new(Vnode::new(gid, Arc::downgrade(mount)));
            inner.nodes.insert(gid, Arc::clone(&vnode));
            // Registered with the mount before the table lock drops, so an
            // unmount scan cannot miss it.
            mount.track_node(id, Arc::downgrade(&vnode));
            drop(inner);

            return match ops.get_node(id) {
                Ok((private, kind)) => {
                    *vnode.private.write() = Some(private);
                    vnode.set_kind(kind);
                    vnode.set_busy(false);
                    self.busy_wake.notify_all();
                    Ok(NodeRef::new(vnode, Arc::clone(self)))
                }
                Err(err) => {
                    let mut inner = lock_inner(self);
                    inner.nodes.remove(&gid);
                    drop(inner);
                    mount.forget_node(id);
                    self.busy_wake.notify_all();
                    Err(err)
                }
            };
        }
    }

    /// Pre-register a node a driver is constructing, avoiding the race where
    /// a concurrent lookup would call `get_node` for a half-built entity. The
    /// entry stays busy/unpublished until [`NodeTable::publish`].
    pub(crate) fn register(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        id: NodeId,
        private: NodePrivate,
        kind: NodeKind,
    ) -> VfsResult<NodeRef> {
        let gid = GlobalNodeId { mount: mount.id(), node: id };
        let mut inner = lock_inner(self);
        if inner.nodes.contains_key(&gid) {
            return Err(vfs_error(ErrorKind::AlreadyExists, "node already registered"));
        }
        if mount.is_unmounting() {
            return Err(vfs_error(ErrorKind::Busy, "mount is being unmounted"));
        }
        let vnode = Arc::new(Vnode::new(gid, Arc::downgrade(mount)));
        vnode.unpublished.store(true, Ordering::Release);
        *vnode.private.write() = Some(private);
        vnode.set_kind(kind);
        inner.nodes.insert(gid, Arc::clone(&vnode));
        mount.track_node(id, Arc::downgrade(&vnode));
        drop(inner);
        Ok(NodeRef::new(vnode, Arc::clone(self)))
    }

    /// Make a registered node visible to lookups.
    pub(crate) fn publish(&self, node: &NodeRef) {
        node.vnode.unpublished.store(false, Ordering::Release);
        node.vnode.set_busy(false);
        self.busy_wake.notify_all();
    }

    /// Release one reference. At zero the node is freed immediately when its
    /// remove flag is set (or it was never published), otherwise parked on
    /// the unused list, evicting past the cap.
    pub(crate) fn put(&self, vnode: &Arc<Vnode>) {
        let mut free_now = false;
        let mut evicted: Option<Arc<Vnode>> = None;
        {
            let mut inner = lock_inner(self);
            let previous = vnode.ref_count.fetch_sub(1, Ordering::AcqRel);
            if previous == 0 {
                panic!("put_node on a node with no references: {:?}", vnode);
            }
            if previous == 1 {
                if vnode.is_removed() || vnode.is_unpublished() {
                    vnode.set_busy(true);
                    free_now = true;
                } else {
                    inner.unused.push_front(Arc::clone(vnode));
                    if inner.unused.len() > self.max_unused {
                        if let Some(oldest) = inner.unused.pop_back() {
                            // Marked busy under the lock, so no lookup can
                            // revive it between here and the free below.
                            oldest.set_busy(true);
                            evicted = Some(oldest);
                        }
                    }
                }
            }
        }
        if free_now {
            self.free_node(vnode, false);
        }
        if let Some(oldest) = evicted {
            self.free_node(&oldest, false);
        }
    }

    /// Tear down a busy zero-reference node: driver hook first, table removal
    /// second, so no thread can observe a half-torn-down entry.
    pub(crate) fn free_node(&self, vnode: &Arc<Vnode>, reenter: bool) {
        if !vnode.is_busy() {
            panic!("freeing a non-busy node: {:?}", vnode);
        }
        let private = vnode.private.write().take();
        if let Some(private) = private {
            if let Ok(mount) = vnode.mount() {
                if let Ok(ops) = mount.ops() {
                    if vnode.is_removed() {
                        ops.remove_node(&private, reenter);
                    } else {
                        ops.put_node(&private, reenter);
                    }
                }
            }
        }
        {
            let mut inner = lock_inner(self);
            inner.nodes.remove(&vnode.id);
            inner.drop_unused(vnode);
        }
        if let Ok(mount) = vnode.mount() {
            mount.forget_node(vnode.id.node);
        }
        self.busy_wake.notify_all();
    }

    /// Driver-initiated removal: set the remove flag on a cached node so the
    /// last reference drop deletes it. A node already idle on the unused list
    /// is freed on the spot. Returns whether the node was cached at all.
    pub(crate) fn mark_removed(self: &Arc<Self>, gid: GlobalNodeId) -> bool {
        let mut inner = lock_inner(self);
        let Some(vnode) = inner.nodes.get(&gid).cloned() else {
            return false;
        };
        vnode.set_removed(true);
        if vnode.ref_count() == 0 && !vnode.is_busy() {
            inner.drop_unused(&vnode);
            vnode.set_busy(true);
            drop(inner);
            self.free_node(&vnode, false);
        }
        true
    }

    /// Wake every waiter parked on a busy node; used once unmount marks a
    /// whole mount's nodes busy so waiters fail fast instead of timing out.
    pub(crate) fn notify_busy_waiters(&self) {
        self.busy_wake.notify_all();
    }

    /// Low-memory reclaim: walk the unused list tail-first, flush dirty
    /// cached pages, then free the oldest entries. The share freed scales
    /// with severity.
    pub(crate) fn low_memory(&self, pressure: MemoryPressure) -> usize {
        let mut victims = Vec::new();
        {
            let mut inner = lock_inner(self);
            let len = inner.unused.len();
            let count = match pressure {
                MemoryPressure::Low => len.div_ceil(4),
                MemoryPressure::Moderate => len.div_ceil(2),
                MemoryPressure::Critical => len,
            };
            for _ in 0..count {
                if let Some(oldest) = inner.unused.pop_back() {
                    oldest.set_busy(true);
                    victims.push(oldest);
                }
            }
        }
        let freed = victims.len();
        for vnode in victims {
            if let Some(cache) = vnode.cache() {
                if let Err(err) = cache.flush() {
                    log::warn!("cache flush failed while reclaiming {}: {}", vnode.id, err);
                }
                cache.discard();
            }
            self.free_node(&vnode, false);
        }
        if freed > 0 {
            log::debug!("low-memory reclaim freed {} unused nodes", freed);
        }
        freed
    }

    /// Whether (mount, id) currently has a table entry. Test and diagnostic
    /// aid; the answer can be stale the moment it returns.
    pub(crate) fn contains(&self, gid: GlobalNodeId) -> bool {
        lock_inner(self).nodes.contains_key(&gid)
    }

    pub(crate) fn unused_count(&self) -> usize {
        lock_inner(self).unused.len()
    }
}

impl fmt::Debug for NodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock_inner(self);
        f.debug_struct("NodeTable")
            .field("nodes", &inner.nodes.len())
            .field("unused", &inner.unused.len())
            .finish()
    }
}
