//! Mount records and the mount table.
//!
//! A [`Mount`] is one active binding of a filesystem driver instance into the
//! namespace: its operation table, its root node, the directory node it
//! covers, and the registry of every vnode it owns. The [`MountTable`] maps
//! mount ids to records and carries the single global mount-operation lock
//! that serializes mount() and unmount() sequences against each other; the
//! orchestration itself lives in [`crate::vfs`].

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use hashbrown::HashMap;
use spin::{Mutex as SpinMutex, RwLock as SpinRwLock};

use crate::driver::FilesystemOps;
use crate::error::{vfs_error, ErrorKind, VfsResult};
use crate::node::{NodeRef, Vnode};
use crate::types::{MountFlags, MountId, MountInfo, NodeId};

/// One mounted volume.
pub struct Mount {
    id: MountId,
    driver_name: String,
    flags: MountFlags,
    /// Set once the driver's mount hook returns. Until then the record is
    /// visible in the table (so registration callbacks work) but lookups
    /// through it fail busy.
    ops: SpinRwLock<Option<Arc<dyn FilesystemOps>>>,
    /// Owned reference to the volume root; fixed once mounting completes.
    root: SpinRwLock<Option<NodeRef>>,
    /// Owned reference to the covered directory; `None` for the root mount.
    covers: SpinRwLock<Option<NodeRef>>,
    /// Every vnode this mount owns. Entries are weak: the node table holds
    /// the strong references; this list only shrinks as nodes are freed.
    nodes: SpinMutex<HashMap<NodeId, Weak<Vnode>>>,
    unmounting: AtomicBool,
}

impl Mount {
    pub(crate) fn new(id: MountId, driver_name: String, flags: MountFlags) -> Arc<Self> {
        Arc::new(Self {
            id,
            driver_name,
            flags,
            ops: SpinRwLock::new(None),
            root: SpinRwLock::new(None),
            covers: SpinRwLock::new(None),
            nodes: SpinMutex::new(HashMap::new()),
            unmounting: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> MountId {
        self.id
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(MountFlags::READ_ONLY)
    }

    /// The per-mount operation table, or busy while the mount hook is still
    /// running.
    pub fn ops(&self) -> VfsResult<Arc<dyn FilesystemOps>> {
        self.ops
            .read()
            .clone()
            .ok_or_else(|| vfs_error(ErrorKind::Busy, "mount is still being set up"))
    }

    pub(crate) fn set_ops(&self, ops: Arc<dyn FilesystemOps>) {
        *self.ops.write() = Some(ops);
    }

    pub(crate) fn set_root(&self, root: NodeRef) {
        *self.root.write() = Some(root);
    }

    pub(crate) fn take_root(&self) -> Option<NodeRef> {
        self.root.write().take()
    }

    /// The root vnode, without acquiring a new reference.
    pub(crate) fn root_vnode(&self) -> Option<Arc<Vnode>> {
        self.root.read().as_ref().map(|r| Arc::clone(r.vnode()))
    }

    pub(crate) fn is_root_of(&self, vnode: &Arc<Vnode>) -> bool {
        self.root
            .read()
            .as_ref()
            .map(|r| r.same_node(vnode))
            .unwrap_or(false)
    }

    pub(crate) fn set_covers(&self, covers: NodeRef) {
        *self.covers.write() = Some(covers);
    }

    pub(crate) fn take_covers(&self) -> Option<NodeRef> {
        self.covers.write().take()
    }

    pub(crate) fn covers_vnode(&self) -> Option<Arc<Vnode>> {
        self.covers.read().as_ref().map(|r| Arc::clone(r.vnode()))
    }

    pub fn is_unmounting(&self) -> bool {
        self.unmounting.load(Ordering::Acquire)
    }

    pub(crate) fn set_unmounting(&self, value: bool) {
        self.unmounting.store(value, Ordering::Release);
    }

    pub(crate) fn track_node(&self, id: NodeId, vnode: Weak<Vnode>) {
        self.nodes.lock().insert(id, vnode);
    }

    pub(crate) fn forget_node(&self, id: NodeId) {
        self.nodes.lock().remove(&id);
    }

    /// Snapshot of the live nodes this mount owns.
    pub(crate) fn owned_nodes(&self) -> Vec<Arc<Vnode>> {
        self.nodes
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn info(&self) -> MountInfo {
        MountInfo {
            id: self.id,
            driver: self.driver_name.clone(),
            root: self
                .root_vnode()
                .map(|v| v.id().node)
                .unwrap_or(NodeId(0)),
            covers: self.covers_vnode().map(|v| v.id()),
        }
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("driver", &self.driver_name)
            .field("unmounting", &self.is_unmounting())
            .field("nodes", &self.nodes.lock().len())
            .finish()
    }
}

/// Registry of active mounts plus the global mount-operation lock.
pub(crate) struct MountTable {
    mounts: SpinRwLock<HashMap<MountId, Arc<Mount>>>,
    root: SpinRwLock<Option<Arc<Mount>>>,
    next_id: AtomicU64,
    /// Serializes whole mount()/unmount() sequences; held across driver
    /// mount hooks and unmount draining, never across ordinary I/O.
    pub(crate) op_lock: Mutex<()>,
}

impl MountTable {
    pub(crate) fn new() -> Self {
        Self {
            mounts: SpinRwLock::new(HashMap::new()),
            root: SpinRwLock::new(None),
            next_id: AtomicU64::new(1),
            op_lock: Mutex::new(()),
        }
    }

    pub(crate) fn allocate_id(&self) -> MountId {
        MountId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert(&self, mount: Arc<Mount>) {
        self.mounts.write().insert(mount.id(), mount);
    }

    pub(crate) fn remove(&self, id: MountId) -> Option<Arc<Mount>> {
        let removed = self.mounts.write().remove(&id);
        let mut root = self.root.write();
        if root.as_ref().map(|m| m.id()) == Some(id) {
            *root = None;
        }
        removed
    }

    pub(crate) fn get(&self, id: MountId) -> Option<Arc<Mount>> {
        self.mounts.read().get(&id).cloned()
    }

    pub(crate) fn root_mount(&self) -> Option<Arc<Mount>> {
        self.root.read().clone()
    }

    pub(crate) fn set_root_mount(&self, mount: Arc<Mount>) {
        *self.root.write() = Some(mount);
    }

    pub(crate) fn len(&self) -> usize {
        self.mounts.read().len()
    }

    /// Cursor-style enumeration: the first mount with an id greater than
    /// `cursor`, in id order.
    pub(crate) fn next_info(&self, cursor: Option<MountId>) -> Option<MountInfo> {
        let mounts = self.mounts.read();
        let floor = cursor.map(|c| c.0).unwrap_or(0);
        mounts
            .values()
            .filter(|m| m.id().0 > floor)
            .min_by_key(|m| m.id().0)
            .map(|m| m.info())
    }

    pub(crate) fn all(&self) -> Vec<Arc<Mount>> {
        let mut mounts: Vec<_> = self.mounts.read().values().cloned().collect();
        mounts.sort_by_key(|m| m.id().0);
        mounts
    }
}
