//! The VFS core: driver registry, mount orchestration and the operation
//! surface.
//!
//! One [`Vfs`] instance owns the node table, the mount table and a weak
//! registry of I/O contexts. Mount and unmount sequences are serialized by a
//! single mount-operation lock and follow a strict order:
//!
//! * mounting inserts the mount record *before* running the driver's mount
//!   hook, so the driver can register and publish nodes from inside it;
//! * unmounting first verifies (or, when forced, manufactures) the
//!   reference-count invariant, then marks every owned node busy, frees them
//!   through the driver teardown hooks, removes the record and finally calls
//!   the driver's unmount hook.
//!
//! Everything else (open, I/O, namespace mutation, attributes, indexes,
//! queries, advisory locking) is thin dispatch: resolve, check, call the
//! driver hook, normalize the result.

use std::sync::{Arc, PoisonError, Weak};

use hashbrown::HashMap;
use spin::{Mutex as SpinMutex, RwLock as SpinRwLock};

use crate::advisory::{self, AdvisoryLock, WHOLE_FILE};
use crate::descriptor::Descriptor;
use crate::driver::{FilesystemDriver, IoCookie, NodePrivate};
use crate::error::{vfs_error, ErrorKind, VfsResult};
use crate::io_context::{Fd, IoContext};
use crate::mount::{Mount, MountTable};
use crate::node::{NodeRef, NodeTable};
use crate::types::{
    AccessMode, AttrInfo, DirEntry, FsInfo, FsInfoMask, GlobalNodeId, LockOwner, MemoryPressure,
    MountFlags, MountId, MountInfo, NodeId, NodeKind, OpenFlags, SeekFrom, Stat, StatMask,
    UnmountFlags, VfsOptions,
};

/// The virtual filesystem layer.
pub struct Vfs {
    options: VfsOptions,
    nodes: Arc<NodeTable>,
    mounts: MountTable,
    drivers: SpinRwLock<HashMap<String, Arc<dyn FilesystemDriver>>>,
    contexts: SpinMutex<Vec<Weak<IoContext>>>,
}

impl Vfs {
    pub fn new() -> Arc<Self> {
        Self::with_options(VfsOptions::default())
    }

    pub fn with_options(options: VfsOptions) -> Arc<Self> {
        Arc::new(Self {
            nodes: NodeTable::new(&options),
            mounts: MountTable::new(),
            drivers: SpinRwLock::new(HashMap::new()),
            contexts: SpinMutex::new(Vec::new()),
            options,
        })
    }

    pub(crate) fn nodes(&self) -> &Arc<NodeTable> {
        &self.nodes
    }

    pub(crate) fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    pub(crate) fn options(&self) -> &VfsOptions {
        &self.options
    }

    // --- drivers ---

    /// Register a filesystem driver under its own name.
    pub fn register_driver(&self, driver: Arc<dyn FilesystemDriver>) -> VfsResult<()> {
        let name = driver.name().to_string();
        let mut drivers = self.drivers.write();
        if drivers.contains_key(&name) {
            return Err(vfs_error(ErrorKind::AlreadyExists, "driver name already registered"));
        }
        log::debug!("registered filesystem driver {name}");
        drivers.insert(name, driver);
        Ok(())
    }

    pub fn unregister_driver(&self, name: &str) -> VfsResult<()> {
        if self.mounts.all().iter().any(|m| m.driver_name() == name) {
            return Err(vfs_error(ErrorKind::Busy, "driver has active mounts"));
        }
        self.drivers
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such driver"))
    }

    // --- I/O contexts ---

    /// Create a process-like I/O context. Its working directory starts at the
    /// global root when one exists.
    pub fn create_io_context(self: &Arc<Self>) -> Arc<IoContext> {
        let ctx = IoContext::new(self.options.descriptor_table_size);
        if let Ok(root) = self.root_ref() {
            ctx.set_cwd(root);
        }
        let mut contexts = self.contexts.lock();
        contexts.retain(|c| c.strong_count() > 0);
        contexts.push(Arc::downgrade(&ctx));
        ctx
    }

    /// Tear down a context: close every descriptor and drop the working
    /// directory reference.
    pub fn exit_io_context(&self, ctx: &Arc<IoContext>) {
        for desc in ctx.take_all() {
            if desc.release_slot() {
                desc.close();
            }
        }
        drop(ctx.take_cwd());
        self.contexts
            .lock()
            .retain(|c| c.upgrade().map(|c| !Arc::ptr_eq(&c, ctx)).unwrap_or(false));
    }

    fn live_contexts(&self) -> Vec<Arc<IoContext>> {
        let mut contexts = self.contexts.lock();
        contexts.retain(|c| c.strong_count() > 0);
        contexts.iter().filter_map(Weak::upgrade).collect()
    }

    /// Starting node for relative resolution: the context's working
    /// directory, or the root for a context that never had one.
    fn context_start(&self, ctx: &IoContext) -> VfsResult<NodeRef> {
        ctx.cwd_ref().or_else(|_| self.root_ref())
    }

    /// Starting node for a `(descriptor, path)` pair: the descriptor's node
    /// when one is given, otherwise the working directory.
    fn start_at(&self, ctx: &Arc<IoContext>, dirfd: Option<Fd>) -> VfsResult<NodeRef> {
        match dirfd {
            Some(fd) => ctx.get(fd)?.node(),
            None => self.context_start(ctx),
        }
    }

    /// Resolve a `(descriptor, path)` pair. An absolute path ignores the
    /// descriptor; a relative one resolves against the directory it refers
    /// to; no path at all yields the open node itself.
    fn resolve_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: Option<&str>,
        traverse: bool,
    ) -> VfsResult<NodeRef> {
        match path {
            Some(path) => self.resolve_node(self.start_at(ctx, dirfd)?, path, traverse),
            None => match dirfd {
                Some(fd) => ctx.get(fd)?.node(),
                None => Err(vfs_error(
                    ErrorKind::InvalidArgument,
                    "neither descriptor nor path given",
                )),
            },
        }
    }

    fn resolve_parent_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: &str,
    ) -> VfsResult<(NodeRef, String)> {
        self.resolve_parent(self.start_at(ctx, dirfd)?, path)
    }

    // --- mounting ---

    /// Mount a registered driver at `path` (which must be absolute).
    ///
    /// The very first mount must target "/" and becomes the global root.
    /// Later mounts cover an existing directory; a directory already covered
    /// (or a mount's root) cannot be mounted over.
    pub fn mount(
        self: &Arc<Self>,
        path: &str,
        driver_name: &str,
        device: Option<&str>,
        args: Option<&str>,
        flags: MountFlags,
    ) -> VfsResult<MountId> {
        if !path.starts_with('/') {
            return Err(vfs_error(ErrorKind::InvalidPath, "mount path must be absolute"));
        }
        let _op = self.mounts.op_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let driver = self
            .drivers
            .read()
            .get(driver_name)
            .cloned()
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such driver"))?;

        let covers: Option<NodeRef> = if self.mounts.root_mount().is_none() {
            if !path.trim_end_matches('/').is_empty() {
                return Err(vfs_error(ErrorKind::InvalidPath, "first mount must target the root"));
            }
            None
        } else {
            let node = self.resolve_node(self.root_ref()?, path, true)?;
            if node.kind() != NodeKind::Directory {
                return Err(vfs_error(ErrorKind::NotADirectory, "mount point is not a directory"));
            }
            // Resolution already substituted any covering root, so landing on
            // a mount root means the caller is trying to stack mounts.
            if node.mount()?.is_root_of(node.vnode()) {
                return Err(vfs_error(ErrorKind::Busy, "directory is already a mount point"));
            }
            if node.vnode().covered_by().is_some() {
                return Err(vfs_error(ErrorKind::Busy, "directory is already a mount point"));
            }
            Some(node)
        };

        let id = self.mounts.allocate_id();
        let mount = Mount::new(id, driver_name.to_string(), flags);
        // Visible in the table before the driver hook runs, so the driver may
        // register and publish nodes while mounting.
        self.mounts.insert(Arc::clone(&mount));

        let root_id = match driver.mount(self, id, device, args, flags) {
            Ok((ops, root_id)) => {
                mount.set_ops(ops);
                root_id
            }
            Err(err) => {
                self.mounts.remove(id);
                return Err(err);
            }
        };

        let root = match self.nodes.get(&mount, root_id, true) {
            Ok(root) => root,
            Err(err) => {
                self.abort_mount(&mount, None);
                return Err(err);
            }
        };
        if root.kind() != NodeKind::Directory {
            self.abort_mount(&mount, Some(root));
            return Err(vfs_error(ErrorKind::NotADirectory, "volume root is not a directory"));
        }

        mount.set_root(root.clone());
        match covers {
            Some(covers) => {
                covers.vnode().set_covered_by(Some(Arc::downgrade(root.vnode())));
                root.vnode().set_covers(Some(Arc::clone(covers.vnode())));
                mount.set_covers(covers);
            }
            None => self.mounts.set_root_mount(Arc::clone(&mount)),
        }
        drop(root);

        log::info!("mounted {driver_name} at {path} as mount {id}");
        Ok(id)
    }

    /// Roll back a half-constructed mount after its driver hook succeeded.
    fn abort_mount(&self, mount: &Arc<Mount>, root: Option<NodeRef>) {
        mount.set_unmounting(true);
        if let Some(root) = root {
            let vnode = root.leak();
            vnode.set_busy(true);
            self.nodes.free_node(&vnode, false);
        }
        self.mounts.remove(mount.id());
        if let Ok(ops) = mount.ops() {
            ops.unmount();
        }
    }

    /// Unmount the volume whose root `path` resolves to.
    ///
    /// The volume must be quiescent: its root carries exactly the two
    /// expected references (the mount's own and this call's), every other
    /// node none, and no other mount is stacked on top. With
    /// [`UnmountFlags::FORCE`] live descriptors on the volume are
    /// disconnected and working directories evicted first, then the check is
    /// retried for a bounded number of drain passes.
    pub fn unmount(self: &Arc<Self>, path: &str, flags: UnmountFlags) -> VfsResult<()> {
        let _op = self.mounts.op_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let root = self.resolve_node(self.root_ref()?, path, true)?;
        let mount = root.mount()?;
        if !mount.is_root_of(root.vnode()) {
            return Err(vfs_error(ErrorKind::InvalidArgument, "path is not a mount point"));
        }
        for other in self.mounts.all() {
            if other.id() != mount.id()
                && other
                    .covers_vnode()
                    .map(|v| v.id().mount == mount.id())
                    .unwrap_or(false)
            {
                return Err(vfs_error(ErrorKind::Busy, "another volume is mounted on top"));
            }
        }

        mount.set_unmounting(true);
        let force = flags.contains(UnmountFlags::FORCE);
        if force {
            log::warn!("forcibly unmounting mount {} ({})", mount.id(), mount.driver_name());
        }

        let mut attempts: u32 = 0;
        loop {
            if force {
                for ctx in self.live_contexts() {
                    ctx.disconnect_mount(mount.id());
                    if ctx.cwd_is_on(mount.id()) {
                        drop(ctx.take_cwd());
                    }
                }
            }
            if self.excess_refs(&mount) == 0 {
                break;
            }
            attempts += 1;
            if !force || attempts > self.options.unmount_drain_limit {
                mount.set_unmounting(false);
                self.nodes.notify_busy_waiters();
                return Err(vfs_error(ErrorKind::Busy, "volume has nodes in use"));
            }
            std::thread::sleep(self.options.unmount_drain_slice);
        }

        // Quiescent. Block every remaining way to take a reference, then
        // free the volume's nodes directly through the driver hooks.
        let owned = mount.owned_nodes();
        for vnode in &owned {
            vnode.set_busy(true);
        }
        self.nodes.notify_busy_waiters();

        let root_vnode = root.leak();
        if let Some(mount_root) = mount.take_root() {
            let _ = mount_root.leak();
        }
        if let Some(covers_ref) = mount.take_covers() {
            covers_ref.vnode().set_covered_by(None);
            root_vnode.set_covers(None);
            // Returns the covered directory's reference to its own mount.
            drop(covers_ref);
        }
        for vnode in &owned {
            self.nodes.free_node(vnode, false);
        }

        self.mounts.remove(mount.id());
        if let Ok(ops) = mount.ops() {
            ops.unmount();
        }
        log::info!("unmounted mount {} ({})", mount.id(), mount.driver_name());
        Ok(())
    }

    /// References held on the mount's nodes beyond the two expected on its
    /// root (the mount's own plus the unmounting caller's).
    fn excess_refs(&self, mount: &Arc<Mount>) -> u32 {
        mount
            .owned_nodes()
            .iter()
            .map(|vnode| {
                let expected = if mount.is_root_of(vnode) { 2 } else { 0 };
                vnode.ref_count().saturating_sub(expected)
            })
            .sum()
    }

    /// Cursor-style mount enumeration in mount-id order.
    pub fn next_mount_info(&self, cursor: Option<MountId>) -> Option<MountInfo> {
        self.mounts.next_info(cursor)
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }

    pub fn read_fs_info(&self, mount_id: MountId) -> VfsResult<FsInfo> {
        self.mount_by_id(mount_id)?.ops()?.read_fs_info()
    }

    pub fn write_fs_info(&self, mount_id: MountId, info: &FsInfo, mask: FsInfoMask) -> VfsResult<()> {
        let mount = self.mount_by_id(mount_id)?;
        if mount.is_read_only() {
            return Err(vfs_error(ErrorKind::ReadOnly, "volume is mounted read-only"));
        }
        mount.ops()?.write_fs_info(info, mask)
    }

    fn mount_by_id(&self, id: MountId) -> VfsResult<Arc<Mount>> {
        self.mounts
            .get(id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such mount"))
    }

    // --- driver callbacks for node construction ---

    /// Pre-register a node the driver is constructing; see
    /// [`Vfs::publish_node`]. Usable from inside a driver mount hook.
    pub fn register_node(
        &self,
        mount_id: MountId,
        node_id: NodeId,
        private: NodePrivate,
        kind: NodeKind,
    ) -> VfsResult<NodeRef> {
        let mount = self.mount_by_id(mount_id)?;
        self.nodes.register(&mount, node_id, private, kind)
    }

    /// Make a registered node visible to lookups.
    pub fn publish_node(&self, node: &NodeRef) {
        self.nodes.publish(node);
    }

    /// Driver callback after removing an entity's last name: delete the node
    /// once its final reference drops (immediately when it is already idle).
    pub fn mark_node_removed(&self, mount_id: MountId, node_id: NodeId) -> bool {
        self.nodes
            .mark_removed(GlobalNodeId { mount: mount_id, node: node_id })
    }

    /// Acquire a reference to an arbitrary node; mostly a driver/test aid.
    pub fn get_node(&self, mount_id: MountId, node_id: NodeId) -> VfsResult<NodeRef> {
        let mount = self.mount_by_id(mount_id)?;
        self.nodes.get(&mount, node_id, true)
    }

    // --- open and descriptor I/O ---

    /// Open `path` and install a file descriptor.
    ///
    /// With [`OpenFlags::CREATE`] a missing leaf is created through the
    /// driver; [`OpenFlags::EXCLUSIVE`] then insists on creating. A creation
    /// that fails late (no free descriptor slot) is rolled back: the open
    /// state is released and the freshly created leaf unlinked.
    pub fn open(
        &self,
        ctx: &Arc<IoContext>,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Fd> {
        self.open_at(ctx, None, Some(path), flags, mode)
    }

    /// [`Vfs::open`] over a `(descriptor, path)` pair; with no path the
    /// descriptor's own node is opened again.
    pub fn open_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: Option<&str>,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Fd> {
        let traverse = !flags.contains(OpenFlags::NO_TRAVERSE);

        let (node, cookie, created) = match path {
            Some(path) if flags.contains(OpenFlags::CREATE) => {
                let (dir, leaf) = self.resolve_parent_at(ctx, dirfd, path)?;
                match self.resolve_node(dir.clone(), &leaf, traverse) {
                    Ok(node) => {
                        if flags.contains(OpenFlags::EXCLUSIVE) {
                            return Err(vfs_error(ErrorKind::AlreadyExists, "path already exists"));
                        }
                        let cookie = self.open_existing(&node, flags)?;
                        (node, cookie, None)
                    }
                    Err(err) if err.kind == ErrorKind::NotFound => {
                        let mount = dir.mount()?;
                        if mount.is_read_only() {
                            return Err(vfs_error(
                                ErrorKind::ReadOnly,
                                "volume is mounted read-only",
                            ));
                        }
                        let ops = mount.ops()?;
                        let (node_id, cookie) = ops.create(&dir.private()?, &leaf, flags, mode)?;
                        let node = match self.nodes.get(&mount, node_id, true) {
                            Ok(node) => node,
                            Err(err) => {
                                let _ = ops.unlink(&dir.private()?, &leaf);
                                return Err(err);
                            }
                        };
                        (node, cookie, Some((dir, leaf)))
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => {
                let node = self.resolve_at(ctx, dirfd, path, traverse)?;
                let cookie = self.open_existing(&node, flags)?;
                (node, cookie, None)
            }
        };

        let desc = Descriptor::new_file(node, cookie, flags);
        match ctx.attach(desc, flags.contains(OpenFlags::CLOEXEC)) {
            Ok(fd) => Ok(fd),
            Err(err) => {
                // Dropping the descriptor releases the driver open state and
                // the node reference; a fresh creation is unlinked again.
                if let Some((dir, leaf)) = created {
                    if let Ok(ops) = dir.mount().and_then(|m| m.ops()) {
                        if let Ok(private) = dir.private() {
                            let _ = ops.unlink(&private, &leaf);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    fn open_existing(&self, node: &NodeRef, flags: OpenFlags) -> VfsResult<IoCookie> {
        if node.kind() == NodeKind::Directory && flags.writable() {
            return Err(vfs_error(ErrorKind::IsADirectory, "cannot open a directory for writing"));
        }
        let mount = node.mount()?;
        if flags.writable() && mount.is_read_only() {
            return Err(vfs_error(ErrorKind::ReadOnly, "volume is mounted read-only"));
        }
        mount.ops()?.open(&node.private()?, flags)
    }

    /// Close a descriptor slot. Driver-side open state is released only when
    /// the last slot sharing the descriptor (via [`Vfs::dup`]) goes away.
    pub fn close(&self, ctx: &Arc<IoContext>, fd: Fd) -> VfsResult<()> {
        let desc = ctx.detach(fd)?;
        if desc.release_slot() {
            desc.close();
        }
        Ok(())
    }

    pub fn read(&self, ctx: &Arc<IoContext>, fd: Fd, buf: &mut [u8]) -> VfsResult<usize> {
        ctx.get(fd)?.read(buf)
    }

    pub fn write(&self, ctx: &Arc<IoContext>, fd: Fd, buf: &[u8]) -> VfsResult<usize> {
        ctx.get(fd)?.write(buf)
    }

    pub fn seek(&self, ctx: &Arc<IoContext>, fd: Fd, from: SeekFrom) -> VfsResult<u64> {
        ctx.get(fd)?.seek(from)
    }

    pub fn ioctl(&self, ctx: &Arc<IoContext>, fd: Fd, op: u32, arg: &mut [u8]) -> VfsResult<()> {
        ctx.get(fd)?.ioctl(op, arg)
    }

    pub fn fstat(&self, ctx: &Arc<IoContext>, fd: Fd) -> VfsResult<Stat> {
        ctx.get(fd)?.read_stat()
    }

    pub fn fstat_write(
        &self,
        ctx: &Arc<IoContext>,
        fd: Fd,
        stat: &Stat,
        mask: StatMask,
    ) -> VfsResult<()> {
        ctx.get(fd)?.write_stat(stat, mask)
    }

    pub fn fsync(&self, ctx: &Arc<IoContext>, fd: Fd) -> VfsResult<()> {
        let node = ctx.get(fd)?.node()?;
        node.mount()?.ops()?.fsync(&node.private()?)
    }

    /// Duplicate a descriptor into the lowest free slot. The two descriptors
    /// share open state, including the file position.
    pub fn dup(&self, ctx: &Arc<IoContext>, fd: Fd) -> VfsResult<Fd> {
        let desc = ctx.get(fd)?;
        ctx.attach(desc, false)
    }

    /// Close every descriptor flagged close-on-exec.
    pub fn exec_cleanup(&self, ctx: &Arc<IoContext>) {
        for desc in ctx.take_cloexec() {
            if desc.release_slot() {
                desc.close();
            }
        }
    }

    // --- directories ---

    pub fn open_dir(&self, ctx: &Arc<IoContext>, path: &str) -> VfsResult<Fd> {
        self.open_dir_at(ctx, None, Some(path))
    }

    pub fn open_dir_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: Option<&str>,
    ) -> VfsResult<Fd> {
        let node = self.resolve_at(ctx, dirfd, path, true)?;
        if node.kind() != NodeKind::Directory {
            return Err(vfs_error(ErrorKind::NotADirectory, "not a directory"));
        }
        let cookie = node.mount()?.ops()?.open_dir(&node.private()?)?;
        ctx.attach(Descriptor::new_directory(node, cookie), false)
    }

    pub fn read_dir(&self, ctx: &Arc<IoContext>, fd: Fd) -> VfsResult<Option<DirEntry>> {
        ctx.get(fd)?.read_dir()
    }

    pub fn rewind_dir(&self, ctx: &Arc<IoContext>, fd: Fd) -> VfsResult<()> {
        ctx.get(fd)?.rewind_dir()
    }

    pub fn create_dir(&self, ctx: &Arc<IoContext>, path: &str, mode: u32) -> VfsResult<()> {
        self.create_dir_at(ctx, None, path, mode)
    }

    pub fn create_dir_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: &str,
        mode: u32,
    ) -> VfsResult<()> {
        let (dir, leaf) = self.resolve_parent_at(ctx, dirfd, path)?;
        let mount = self.writable_mount(&dir)?;
        mount.ops()?.create_dir(&dir.private()?, &leaf, mode)
    }

    pub fn remove_dir(&self, ctx: &Arc<IoContext>, path: &str) -> VfsResult<()> {
        self.remove_dir_at(ctx, None, path)
    }

    pub fn remove_dir_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: &str,
    ) -> VfsResult<()> {
        let (dir, leaf) = self.resolve_parent_at(ctx, dirfd, path)?;
        let mount = self.writable_mount(&dir)?;
        mount.ops()?.remove_dir(&dir.private()?, &leaf)
    }

    // --- namespace mutation ---

    pub fn unlink(&self, ctx: &Arc<IoContext>, path: &str) -> VfsResult<()> {
        self.unlink_at(ctx, None, path)
    }

    pub fn unlink_at(&self, ctx: &Arc<IoContext>, dirfd: Option<Fd>, path: &str) -> VfsResult<()> {
        let (dir, leaf) = self.resolve_parent_at(ctx, dirfd, path)?;
        let mount = self.writable_mount(&dir)?;
        mount.ops()?.unlink(&dir.private()?, &leaf)
    }

    pub fn create_symlink(
        &self,
        ctx: &Arc<IoContext>,
        path: &str,
        target: &str,
        mode: u32,
    ) -> VfsResult<()> {
        self.create_symlink_at(ctx, None, path, target, mode)
    }

    pub fn create_symlink_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: &str,
        target: &str,
        mode: u32,
    ) -> VfsResult<()> {
        let (dir, leaf) = self.resolve_parent_at(ctx, dirfd, path)?;
        let mount = self.writable_mount(&dir)?;
        mount.ops()?.create_symlink(&dir.private()?, &leaf, target, mode)
    }

    pub fn read_symlink(&self, ctx: &Arc<IoContext>, path: &str) -> VfsResult<String> {
        self.read_symlink_at(ctx, None, Some(path))
    }

    pub fn read_symlink_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: Option<&str>,
    ) -> VfsResult<String> {
        let node = self.resolve_at(ctx, dirfd, path, false)?;
        if node.kind() != NodeKind::SymbolicLink {
            return Err(vfs_error(ErrorKind::InvalidArgument, "not a symbolic link"));
        }
        node.mount()?.ops()?.read_symlink(&node.private()?)
    }

    /// Hard-link `existing` under `new_path`. Both must live on the same
    /// volume; directories cannot be linked.
    pub fn link(&self, ctx: &Arc<IoContext>, existing: &str, new_path: &str) -> VfsResult<()> {
        self.link_at(ctx, None, existing, None, new_path)
    }

    pub fn link_at(
        &self,
        ctx: &Arc<IoContext>,
        existing_dirfd: Option<Fd>,
        existing: &str,
        new_dirfd: Option<Fd>,
        new_path: &str,
    ) -> VfsResult<()> {
        let node = self.resolve_at(ctx, existing_dirfd, Some(existing), false)?;
        if node.kind() == NodeKind::Directory {
            return Err(vfs_error(ErrorKind::PermissionDenied, "cannot hard-link a directory"));
        }
        let (dir, leaf) = self.resolve_parent_at(ctx, new_dirfd, new_path)?;
        if dir.mount_id() != node.mount_id() {
            return Err(vfs_error(ErrorKind::CrossDevice, "link crosses volumes"));
        }
        let mount = self.writable_mount(&dir)?;
        mount.ops()?.link(&dir.private()?, &leaf, &node.private()?)
    }

    /// Rename within one volume; cross-volume renames are refused rather than
    /// emulated.
    pub fn rename(&self, ctx: &Arc<IoContext>, from: &str, to: &str) -> VfsResult<()> {
        self.rename_at(ctx, None, from, None, to)
    }

    pub fn rename_at(
        &self,
        ctx: &Arc<IoContext>,
        from_dirfd: Option<Fd>,
        from: &str,
        to_dirfd: Option<Fd>,
        to: &str,
    ) -> VfsResult<()> {
        let (from_dir, from_leaf) = self.resolve_parent_at(ctx, from_dirfd, from)?;
        let (to_dir, to_leaf) = self.resolve_parent_at(ctx, to_dirfd, to)?;
        if from_dir.mount_id() != to_dir.mount_id() {
            return Err(vfs_error(ErrorKind::CrossDevice, "rename crosses volumes"));
        }
        let mount = self.writable_mount(&from_dir)?;
        mount
            .ops()?
            .rename(&from_dir.private()?, &from_leaf, &to_dir.private()?, &to_leaf)
    }

    pub fn access(&self, ctx: &Arc<IoContext>, path: &str, mode: AccessMode) -> VfsResult<()> {
        self.access_at(ctx, None, Some(path), mode)
    }

    pub fn access_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: Option<&str>,
        mode: AccessMode,
    ) -> VfsResult<()> {
        let node = self.resolve_at(ctx, dirfd, path, true)?;
        if mode.contains(AccessMode::WRITE) && node.mount()?.is_read_only() {
            return Err(vfs_error(ErrorKind::ReadOnly, "volume is mounted read-only"));
        }
        node.mount()?.ops()?.access(&node.private()?, mode)
    }

    pub fn read_stat(&self, ctx: &Arc<IoContext>, path: &str, traverse: bool) -> VfsResult<Stat> {
        self.read_stat_at(ctx, None, Some(path), traverse)
    }

    pub fn read_stat_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: Option<&str>,
        traverse: bool,
    ) -> VfsResult<Stat> {
        let node = self.resolve_at(ctx, dirfd, path, traverse)?;
        let mut stat = node.mount()?.ops()?.read_stat(&node.private()?)?;
        stat.device = node.mount_id().0;
        stat.node = node.node_id().0;
        Ok(stat)
    }

    pub fn write_stat(
        &self,
        ctx: &Arc<IoContext>,
        path: &str,
        stat: &Stat,
        mask: StatMask,
    ) -> VfsResult<()> {
        self.write_stat_at(ctx, None, Some(path), stat, mask)
    }

    pub fn write_stat_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: Option<&str>,
        stat: &Stat,
        mask: StatMask,
    ) -> VfsResult<()> {
        let node = self.resolve_at(ctx, dirfd, path, true)?;
        let mount = self.writable_mount(&node)?;
        mount.ops()?.write_stat(&node.private()?, stat, mask)
    }

    fn writable_mount(&self, node: &NodeRef) -> VfsResult<Arc<Mount>> {
        let mount = node.mount()?;
        if mount.is_read_only() {
            return Err(vfs_error(ErrorKind::ReadOnly, "volume is mounted read-only"));
        }
        Ok(mount)
    }

    // --- working directory ---

    pub fn set_cwd(&self, ctx: &Arc<IoContext>, path: &str) -> VfsResult<()> {
        self.set_cwd_at(ctx, None, Some(path))
    }

    pub fn set_cwd_at(
        &self,
        ctx: &Arc<IoContext>,
        dirfd: Option<Fd>,
        path: Option<&str>,
    ) -> VfsResult<()> {
        let node = self.resolve_at(ctx, dirfd, path, true)?;
        if node.kind() != NodeKind::Directory {
            return Err(vfs_error(ErrorKind::NotADirectory, "not a directory"));
        }
        drop(ctx.set_cwd(node));
        Ok(())
    }

    /// Absolute path of the context's working directory, reconstructed by
    /// upward traversal.
    pub fn get_cwd(&self, ctx: &Arc<IoContext>) -> VfsResult<String> {
        let cwd = ctx.cwd_ref()?;
        self.path_for_node(&cwd)
    }

    // --- extended attributes (fd-based) ---

    pub fn open_attr_dir(&self, ctx: &Arc<IoContext>, fd: Fd) -> VfsResult<Fd> {
        let node = ctx.get(fd)?.node()?;
        let cookie = node.mount()?.ops()?.open_attr_dir(&node.private()?)?;
        ctx.attach(Descriptor::new_attribute_directory(node, cookie), false)
    }

    pub fn create_attr(
        &self,
        ctx: &Arc<IoContext>,
        fd: Fd,
        name: &str,
        type_code: u32,
        flags: OpenFlags,
    ) -> VfsResult<Fd> {
        let node = ctx.get(fd)?.node()?;
        let mount = self.writable_mount(&node)?;
        let cookie = mount.ops()?.create_attr(&node.private()?, name, type_code, flags)?;
        ctx.attach(
            Descriptor::new_attribute(node, cookie, flags),
            flags.contains(OpenFlags::CLOEXEC),
        )
    }

    pub fn open_attr(
        &self,
        ctx: &Arc<IoContext>,
        fd: Fd,
        name: &str,
        flags: OpenFlags,
    ) -> VfsResult<Fd> {
        let node = ctx.get(fd)?.node()?;
        if flags.writable() && node.mount()?.is_read_only() {
            return Err(vfs_error(ErrorKind::ReadOnly, "volume is mounted read-only"));
        }
        let cookie = node.mount()?.ops()?.open_attr(&node.private()?, name, flags)?;
        ctx.attach(
            Descriptor::new_attribute(node, cookie, flags),
            flags.contains(OpenFlags::CLOEXEC),
        )
    }

    pub fn read_attr_stat(&self, ctx: &Arc<IoContext>, attr_fd: Fd) -> VfsResult<AttrInfo> {
        let desc = ctx.get(attr_fd)?;
        let node = desc.node()?;
        node.mount()?.ops()?.read_attr_stat(&node.private()?, desc.cookie())
    }

    pub fn write_attr_stat(
        &self,
        ctx: &Arc<IoContext>,
        attr_fd: Fd,
        info: &AttrInfo,
    ) -> VfsResult<()> {
        let desc = ctx.get(attr_fd)?;
        let node = desc.node()?;
        let mount = self.writable_mount(&node)?;
        mount.ops()?.write_attr_stat(&node.private()?, desc.cookie(), info)
    }

    pub fn remove_attr(&self, ctx: &Arc<IoContext>, fd: Fd, name: &str) -> VfsResult<()> {
        let node = ctx.get(fd)?.node()?;
        let mount = self.writable_mount(&node)?;
        mount.ops()?.remove_attr(&node.private()?, name)
    }

    pub fn rename_attr(
        &self,
        ctx: &Arc<IoContext>,
        fd: Fd,
        from_name: &str,
        to_name: &str,
    ) -> VfsResult<()> {
        let node = ctx.get(fd)?.node()?;
        let mount = self.writable_mount(&node)?;
        mount.ops()?.rename_attr(&node.private()?, from_name, to_name)
    }

    // --- indexes (mount-level) ---

    pub fn open_index_dir(&self, ctx: &Arc<IoContext>, mount_id: MountId) -> VfsResult<Fd> {
        let mount = self.mount_by_id(mount_id)?;
        let cookie = mount.ops()?.open_index_dir()?;
        ctx.attach(Descriptor::new_index_directory(mount, cookie), false)
    }

    pub fn create_index(&self, mount_id: MountId, name: &str, type_code: u32) -> VfsResult<()> {
        let mount = self.mount_by_id(mount_id)?;
        if mount.is_read_only() {
            return Err(vfs_error(ErrorKind::ReadOnly, "volume is mounted read-only"));
        }
        mount.ops()?.create_index(name, type_code)
    }

    pub fn remove_index(&self, mount_id: MountId, name: &str) -> VfsResult<()> {
        let mount = self.mount_by_id(mount_id)?;
        if mount.is_read_only() {
            return Err(vfs_error(ErrorKind::ReadOnly, "volume is mounted read-only"));
        }
        mount.ops()?.remove_index(name)
    }

    pub fn read_index_stat(&self, mount_id: MountId, name: &str) -> VfsResult<AttrInfo> {
        self.mount_by_id(mount_id)?.ops()?.read_index_stat(name)
    }

    // --- queries (mount-level) ---

    pub fn open_query(
        &self,
        ctx: &Arc<IoContext>,
        mount_id: MountId,
        query: &str,
        flags: u32,
    ) -> VfsResult<Fd> {
        let mount = self.mount_by_id(mount_id)?;
        let cookie = mount.ops()?.open_query(query, flags)?;
        ctx.attach(Descriptor::new_query(mount, cookie), false)
    }

    // --- advisory locking ---

    /// Acquire an advisory lock on the file behind `fd`. A `None` range means
    /// the whole file. `wait` is ignored on descriptors opened non-blocking.
    pub fn lock(
        &self,
        ctx: &Arc<IoContext>,
        fd: Fd,
        owner: LockOwner,
        range: Option<(u64, u64)>,
        shared: bool,
        wait: bool,
    ) -> VfsResult<()> {
        let desc = ctx.get(fd)?;
        let node = desc.node()?;
        let wait = wait && !desc.open_flags().contains(OpenFlags::NONBLOCK);
        advisory::acquire(
            node.vnode(),
            owner,
            range.unwrap_or(WHOLE_FILE),
            shared,
            wait,
            self.options.lock_wait_timeout,
        )
    }

    /// Release advisory locks on the file behind `fd`; see
    /// [`crate::advisory::release`] for owner semantics.
    pub fn unlock(
        &self,
        ctx: &Arc<IoContext>,
        fd: Fd,
        owner: LockOwner,
        range: Option<(u64, u64)>,
    ) -> VfsResult<()> {
        let node = ctx.get(fd)?.node()?;
        advisory::release(node.vnode(), owner, range)
    }

    /// Report the held lock that would block the given request, if any.
    pub fn test_lock(
        &self,
        ctx: &Arc<IoContext>,
        fd: Fd,
        owner: LockOwner,
        range: Option<(u64, u64)>,
        shared: bool,
    ) -> VfsResult<Option<AdvisoryLock>> {
        let node = ctx.get(fd)?.node()?;
        Ok(advisory::query(node.vnode(), owner, range.unwrap_or(WHOLE_FILE), shared))
    }

    // --- maintenance ---

    /// Flush every mounted volume. Failures are logged and the first one
    /// reported, but every volume is attempted.
    pub fn sync_all(&self) -> VfsResult<()> {
        let mut first_err = None;
        for mount in self.mounts.all() {
            let result = mount.ops().and_then(|ops| ops.sync());
            if let Err(err) = result {
                log::warn!("sync of mount {} failed: {}", mount.id(), err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Low-memory entry point; returns how many unused nodes were freed.
    pub fn low_memory(&self, pressure: MemoryPressure) -> usize {
        self.nodes.low_memory(pressure)
    }

    /// Number of zero-reference nodes currently parked for re-use.
    pub fn unused_node_count(&self) -> usize {
        self.nodes.unused_count()
    }

    /// Resolve `path` to an owned node reference; test and embedding aid.
    pub fn node_for_path(&self, ctx: &Arc<IoContext>, path: &str) -> VfsResult<NodeRef> {
        self.resolve_node(self.context_start(ctx)?, path, true)
    }
}
