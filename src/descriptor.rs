//! Open descriptors and per-type operation tables.
//!
//! Every open descriptor carries a type tag and a fixed operation table for
//! that type; generic calls (read, write, seek, read_dir, stat, ioctl)
//! dispatch through the table into the matching driver hook. File,
//! directory, attribute and attribute-directory descriptors reference a
//! node; index-directory and query descriptors reference a mount, since
//! their hooks are mount-level.
//!
//! Results are normalized on the way out: `read_stat` stamps the externally
//! visible (device, node) identifiers over whatever the driver reported,
//! because a driver does not know its externally assigned numbering.
//!
//! A descriptor disconnected by forced unmount fails every subsequent
//! operation with `Stale`; an in-flight operation counter lets the unmount
//! drain loop wait for quiescence before dropping the node reference.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use spin::RwLock as SpinRwLock;

use crate::driver::{FilesystemOps, IoCookie, NodePrivate};
use crate::error::{vfs_error, ErrorKind, VfsResult};
use crate::mount::Mount;
use crate::node::NodeRef;
use crate::types::{DirEntry, GlobalNodeId, MountId, OpenFlags, SeekFrom, Stat, StatMask};

/// What a descriptor refers to.
pub(crate) enum DescTarget {
    Node(NodeRef),
    Mount(Arc<Mount>),
}

/// Descriptor type tag; selects the operation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    File,
    Directory,
    Attribute,
    AttributeDirectory,
    IndexDirectory,
    Query,
}

/// One open descriptor.
pub struct Descriptor {
    kind: DescriptorKind,
    ops: &'static (dyn DescriptorOps),
    /// Taken on close or once a disconnected descriptor drains.
    target: SpinRwLock<Option<DescTarget>>,
    cookie: IoCookie,
    pos: AtomicU64,
    open_flags: OpenFlags,
    disconnected: AtomicBool,
    in_flight: AtomicU32,
    /// Descriptor-table slots holding this descriptor; `dup` shares one
    /// descriptor across several slots and only the last one drives the close.
    slots: AtomicU32,
}

impl Descriptor {
    fn new(
        kind: DescriptorKind,
        ops: &'static dyn DescriptorOps,
        target: DescTarget,
        cookie: IoCookie,
        open_flags: OpenFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            ops,
            target: SpinRwLock::new(Some(target)),
            cookie,
            pos: AtomicU64::new(0),
            open_flags,
            disconnected: AtomicBool::new(false),
            in_flight: AtomicU32::new(0),
            slots: AtomicU32::new(0),
        })
    }

    pub(crate) fn new_file(node: NodeRef, cookie: IoCookie, flags: OpenFlags) -> Arc<Self> {
        Self::new(DescriptorKind::File, &FILE_OPS, DescTarget::Node(node), cookie, flags)
    }

    pub(crate) fn new_directory(node: NodeRef, cookie: IoCookie) -> Arc<Self> {
        Self::new(
            DescriptorKind::Directory,
            &DIRECTORY_OPS,
            DescTarget::Node(node),
            cookie,
            OpenFlags::READ,
        )
    }

    pub(crate) fn new_attribute(node: NodeRef, cookie: IoCookie, flags: OpenFlags) -> Arc<Self> {
        Self::new(
            DescriptorKind::Attribute,
            &ATTRIBUTE_OPS,
            DescTarget::Node(node),
            cookie,
            flags,
        )
    }

    pub(crate) fn new_attribute_directory(node: NodeRef, cookie: IoCookie) -> Arc<Self> {
        Self::new(
            DescriptorKind::AttributeDirectory,
            &ATTRIBUTE_DIRECTORY_OPS,
            DescTarget::Node(node),
            cookie,
            OpenFlags::READ,
        )
    }

    pub(crate) fn new_index_directory(mount: Arc<Mount>, cookie: IoCookie) -> Arc<Self> {
        Self::new(
            DescriptorKind::IndexDirectory,
            &INDEX_DIRECTORY_OPS,
            DescTarget::Mount(mount),
            cookie,
            OpenFlags::READ,
        )
    }

    pub(crate) fn new_query(mount: Arc<Mount>, cookie: IoCookie) -> Arc<Self> {
        Self::new(
            DescriptorKind::Query,
            &QUERY_OPS,
            DescTarget::Mount(mount),
            cookie,
            OpenFlags::READ,
        )
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn open_flags(&self) -> OpenFlags {
        self.open_flags
    }

    pub(crate) fn cookie(&self) -> &IoCookie {
        &self.cookie
    }

    /// Account for another table slot referencing this descriptor.
    pub(crate) fn retain_slot(&self) {
        self.slots.fetch_add(1, Ordering::AcqRel);
    }

    /// Account for a slot letting go. Returns true when it was the last one,
    /// at which point the caller drives the close.
    pub(crate) fn release_slot(&self) -> bool {
        self.slots.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// A fresh owned reference to the descriptor's node.
    pub(crate) fn node(&self) -> VfsResult<NodeRef> {
        let guard = self.target.read();
        match guard.as_ref() {
            Some(DescTarget::Node(node)) => Ok(node.clone()),
            Some(DescTarget::Mount(_)) => {
                Err(vfs_error(ErrorKind::BadDescriptor, "descriptor has no node"))
            }
            None => Err(vfs_error(ErrorKind::Stale, "descriptor was disconnected")),
        }
    }

    /// Mount id of whatever the descriptor references.
    pub(crate) fn target_mount_id(&self) -> Option<MountId> {
        let guard = self.target.read();
        match guard.as_ref() {
            Some(DescTarget::Node(node)) => Some(node.mount_id()),
            Some(DescTarget::Mount(mount)) => Some(mount.id()),
            None => None,
        }
    }

    fn node_ops(&self) -> VfsResult<(Arc<dyn FilesystemOps>, NodePrivate, GlobalNodeId)> {
        let guard = self.target.read();
        match guard.as_ref() {
            Some(DescTarget::Node(node)) => {
                Ok((node.mount()?.ops()?, node.private()?, node.id()))
            }
            Some(DescTarget::Mount(_)) => {
                Err(vfs_error(ErrorKind::BadDescriptor, "descriptor has no node"))
            }
            None => Err(vfs_error(ErrorKind::Stale, "descriptor was disconnected")),
        }
    }

    fn mount_ops(&self) -> VfsResult<Arc<dyn FilesystemOps>> {
        let guard = self.target.read();
        match guard.as_ref() {
            Some(DescTarget::Mount(mount)) => mount.ops(),
            Some(DescTarget::Node(node)) => node.mount()?.ops(),
            None => Err(vfs_error(ErrorKind::Stale, "descriptor was disconnected")),
        }
    }

    fn begin_op(&self) -> VfsResult<OpGuard<'_>> {
        if self.is_disconnected() {
            return Err(vfs_error(ErrorKind::Stale, "descriptor was disconnected"));
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.is_disconnected() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(vfs_error(ErrorKind::Stale, "descriptor was disconnected"));
        }
        Ok(OpGuard(self))
    }

    // --- generic dispatch ---

    pub fn read(&self, buf: &mut [u8]) -> VfsResult<usize> {
        let _op = self.begin_op()?;
        self.ops.read(self, buf)
    }

    pub fn write(&self, buf: &[u8]) -> VfsResult<usize> {
        let _op = self.begin_op()?;
        self.ops.write(self, buf)
    }

    pub fn seek(&self, from: SeekFrom) -> VfsResult<u64> {
        let _op = self.begin_op()?;
        self.ops.seek(self, from)
    }

    pub fn read_dir(&self) -> VfsResult<Option<DirEntry>> {
        let _op = self.begin_op()?;
        self.ops.read_dir(self)
    }

    pub fn rewind_dir(&self) -> VfsResult<()> {
        let _op = self.begin_op()?;
        self.ops.rewind_dir(self)
    }

    pub fn read_stat(&self) -> VfsResult<Stat> {
        let _op = self.begin_op()?;
        self.ops.read_stat(self)
    }

    pub fn write_stat(&self, stat: &Stat, mask: StatMask) -> VfsResult<()> {
        let _op = self.begin_op()?;
        self.ops.write_stat(self, stat, mask)
    }

    pub fn ioctl(&self, op: u32, arg: &mut [u8]) -> VfsResult<()> {
        let _op = self.begin_op()?;
        self.ops.ioctl(self, op, arg)
    }

    /// Release driver-side open state and the target reference. Safe to call
    /// once; later calls are no-ops.
    pub(crate) fn close(&self) {
        let target = self.target.write().take();
        match target {
            Some(DescTarget::Node(node)) => {
                if !self.is_disconnected() {
                    if let (Ok(mount), Ok(private)) = (node.mount(), node.private()) {
                        if let Ok(ops) = mount.ops() {
                            let _ = self.ops.close_hook(&*ops, &private, &self.cookie);
                            self.ops.free_hook(&*ops, Some(&private), &self.cookie);
                        }
                    }
                }
                drop(node);
            }
            Some(DescTarget::Mount(mount)) => {
                if !self.is_disconnected() {
                    if let Ok(ops) = mount.ops() {
                        let _ = self.ops.close_hook(&*ops, &NULL_PRIVATE, &self.cookie);
                        self.ops.free_hook(&*ops, None, &self.cookie);
                    }
                }
            }
            None => {}
        }
    }

    /// Forced-unmount disconnection. Returns true once the descriptor is
    /// quiescent and its target reference has been dropped.
    pub(crate) fn disconnect(&self) -> bool {
        self.disconnected.store(true, Ordering::Release);
        if self.in_flight.load(Ordering::Acquire) != 0 {
            return false;
        }
        let target = self.target.write().take();
        if let Some(DescTarget::Node(node)) = target {
            drop(node);
        }
        true
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        // Close releases driver state if the owner never did.
        self.close();
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("kind", &self.kind)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

struct OpGuard<'a>(&'a Descriptor);

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Placeholder private for mount-level close hooks, never inspected.
static NULL_PRIVATE: std::sync::LazyLock<NodePrivate> =
    std::sync::LazyLock::new(|| Arc::new(()));

fn wrong_type<T>() -> VfsResult<T> {
    Err(vfs_error(
        ErrorKind::InvalidArgument,
        "operation not supported by this descriptor type",
    ))
}

/// Stat through the node, with the (device, node) identifiers stamped by the
/// VFS: the driver does not know its externally assigned numbering.
fn node_read_stat(desc: &Descriptor) -> VfsResult<Stat> {
    let (ops, private, id) = desc.node_ops()?;
    let mut stat = ops.read_stat(&private)?;
    stat.device = id.mount.0;
    stat.node = id.node.0;
    Ok(stat)
}

fn node_write_stat(desc: &Descriptor, stat: &Stat, mask: StatMask) -> VfsResult<()> {
    let (ops, private, _) = desc.node_ops()?;
    ops.write_stat(&private, stat, mask)
}

/// Fixed per-type operation table. One static instance per descriptor type.
#[allow(unused_variables)]
trait DescriptorOps: Send + Sync {
    fn read(&self, desc: &Descriptor, buf: &mut [u8]) -> VfsResult<usize> {
        wrong_type()
    }

    fn write(&self, desc: &Descriptor, buf: &[u8]) -> VfsResult<usize> {
        wrong_type()
    }

    fn seek(&self, desc: &Descriptor, from: SeekFrom) -> VfsResult<u64> {
        wrong_type()
    }

    fn read_dir(&self, desc: &Descriptor) -> VfsResult<Option<DirEntry>> {
        wrong_type()
    }

    fn rewind_dir(&self, desc: &Descriptor) -> VfsResult<()> {
        wrong_type()
    }

    fn read_stat(&self, desc: &Descriptor) -> VfsResult<Stat> {
        node_read_stat(desc)
    }

    fn write_stat(&self, desc: &Descriptor, stat: &Stat, mask: StatMask) -> VfsResult<()> {
        node_write_stat(desc, stat, mask)
    }

    fn ioctl(&self, desc: &Descriptor, op: u32, arg: &mut [u8]) -> VfsResult<()> {
        wrong_type()
    }

    /// Driver close hook for this descriptor type.
    fn close_hook(
        &self,
        ops: &dyn FilesystemOps,
        private: &NodePrivate,
        cookie: &IoCookie,
    ) -> VfsResult<()>;

    /// Driver cookie-release hook for this descriptor type.
    fn free_hook(&self, ops: &dyn FilesystemOps, private: Option<&NodePrivate>, cookie: &IoCookie);
}

// --- file descriptors ---

struct FileOps;
static FILE_OPS: FileOps = FileOps;

impl DescriptorOps for FileOps {
    fn read(&self, desc: &Descriptor, buf: &mut [u8]) -> VfsResult<usize> {
        if !desc.open_flags.readable() {
            return Err(vfs_error(ErrorKind::BadDescriptor, "descriptor not open for reading"));
        }
        let (ops, private, _) = desc.node_ops()?;
        let pos = desc.pos.load(Ordering::Acquire);
        let read = ops.read(&private, &desc.cookie, pos, buf)?;
        desc.pos.store(pos + read as u64, Ordering::Release);
        Ok(read)
    }

    fn write(&self, desc: &Descriptor, buf: &[u8]) -> VfsResult<usize> {
        if !desc.open_flags.writable() {
            return Err(vfs_error(ErrorKind::BadDescriptor, "descriptor not open for writing"));
        }
        let (ops, private, _) = desc.node_ops()?;
        let pos = if desc.open_flags.contains(OpenFlags::APPEND) {
            ops.read_stat(&private)?.size
        } else {
            desc.pos.load(Ordering::Acquire)
        };
        let written = ops.write(&private, &desc.cookie, pos, buf)?;
        desc.pos.store(pos + written as u64, Ordering::Release);
        Ok(written)
    }

    fn seek(&self, desc: &Descriptor, from: SeekFrom) -> VfsResult<u64> {
        let (ops, private, _) = desc.node_ops()?;
        let base = match from {
            SeekFrom::Start(pos) => return set_position(desc, pos as i128),
            SeekFrom::Current(delta) => desc.pos.load(Ordering::Acquire) as i128 + delta as i128,
            SeekFrom::End(delta) => ops.read_stat(&private)?.size as i128 + delta as i128,
        };
        set_position(desc, base)
    }

    fn ioctl(&self, desc: &Descriptor, op: u32, arg: &mut [u8]) -> VfsResult<()> {
        let (ops, private, _) = desc.node_ops()?;
        ops.ioctl(&private, &desc.cookie, op, arg)
    }

    fn close_hook(
        &self,
        ops: &dyn FilesystemOps,
        private: &NodePrivate,
        cookie: &IoCookie,
    ) -> VfsResult<()> {
        ops.close(private, cookie)
    }

    fn free_hook(&self, ops: &dyn FilesystemOps, private: Option<&NodePrivate>, cookie: &IoCookie) {
        if let Some(private) = private {
            ops.free_cookie(private, cookie);
        }
    }
}

fn set_position(desc: &Descriptor, pos: i128) -> VfsResult<u64> {
    if pos < 0 || pos > u64::MAX as i128 {
        return Err(vfs_error(ErrorKind::InvalidArgument, "seek before start of file"));
    }
    let pos = pos as u64;
    desc.pos.store(pos, Ordering::Release);
    Ok(pos)
}

// --- directory descriptors ---

struct DirectoryOps;
static DIRECTORY_OPS: DirectoryOps = DirectoryOps;

impl DescriptorOps for DirectoryOps {
    fn read_dir(&self, desc: &Descriptor) -> VfsResult<Option<DirEntry>> {
        let (ops, private, _) = desc.node_ops()?;
        ops.read_dir(&private, &desc.cookie)
    }

    fn rewind_dir(&self, desc: &Descriptor) -> VfsResult<()> {
        let (ops, private, _) = desc.node_ops()?;
        ops.rewind_dir(&private, &desc.cookie)
    }

    fn close_hook(
        &self,
        ops: &dyn FilesystemOps,
        private: &NodePrivate,
        cookie: &IoCookie,
    ) -> VfsResult<()> {
        ops.close_dir(private, cookie)
    }

    fn free_hook(&self, ops: &dyn FilesystemOps, private: Option<&NodePrivate>, cookie: &IoCookie) {
        if let Some(private) = private {
            ops.free_dir_cookie(private, cookie);
        }
    }
}

// --- attribute descriptors ---

struct AttributeOps;
static ATTRIBUTE_OPS: AttributeOps = AttributeOps;

impl DescriptorOps for AttributeOps {
    fn read(&self, desc: &Descriptor, buf: &mut [u8]) -> VfsResult<usize> {
        if !desc.open_flags.readable() {
            return Err(vfs_error(ErrorKind::BadDescriptor, "descriptor not open for reading"));
        }
        let (ops, private, _) = desc.node_ops()?;
        let pos = desc.pos.load(Ordering::Acquire);
        let read = ops.read_attr(&private, &desc.cookie, pos, buf)?;
        desc.pos.store(pos + read as u64, Ordering::Release);
        Ok(read)
    }

    fn write(&self, desc: &Descriptor, buf: &[u8]) -> VfsResult<usize> {
        if !desc.open_flags.writable() {
            return Err(vfs_error(ErrorKind::BadDescriptor, "descriptor not open for writing"));
        }
        let (ops, private, _) = desc.node_ops()?;
        let pos = desc.pos.load(Ordering::Acquire);
        let written = ops.write_attr(&private, &desc.cookie, pos, buf)?;
        desc.pos.store(pos + written as u64, Ordering::Release);
        Ok(written)
    }

    fn seek(&self, desc: &Descriptor, from: SeekFrom) -> VfsResult<u64> {
        match from {
            SeekFrom::Start(pos) => set_position(desc, pos as i128),
            SeekFrom::Current(delta) => {
                set_position(desc, desc.pos.load(Ordering::Acquire) as i128 + delta as i128)
            }
            SeekFrom::End(delta) => {
                let (ops, private, _) = desc.node_ops()?;
                let size = ops.read_attr_stat(&private, &desc.cookie)?.size;
                set_position(desc, size as i128 + delta as i128)
            }
        }
    }

    fn close_hook(
        &self,
        ops: &dyn FilesystemOps,
        private: &NodePrivate,
        cookie: &IoCookie,
    ) -> VfsResult<()> {
        ops.close_attr(private, cookie)
    }

    fn free_hook(&self, ops: &dyn FilesystemOps, private: Option<&NodePrivate>, cookie: &IoCookie) {
        if let Some(private) = private {
            ops.free_attr_cookie(private, cookie);
        }
    }
}

// --- attribute-directory descriptors ---

struct AttributeDirectoryOps;
static ATTRIBUTE_DIRECTORY_OPS: AttributeDirectoryOps = AttributeDirectoryOps;

impl DescriptorOps for AttributeDirectoryOps {
    fn read_dir(&self, desc: &Descriptor) -> VfsResult<Option<DirEntry>> {
        let (ops, private, _) = desc.node_ops()?;
        ops.read_attr_dir(&private, &desc.cookie)
    }

    fn rewind_dir(&self, desc: &Descriptor) -> VfsResult<()> {
        let (ops, private, _) = desc.node_ops()?;
        ops.rewind_attr_dir(&private, &desc.cookie)
    }

    fn close_hook(
        &self,
        ops: &dyn FilesystemOps,
        private: &NodePrivate,
        cookie: &IoCookie,
    ) -> VfsResult<()> {
        ops.close_attr_dir(private, cookie)
    }

    fn free_hook(&self, ops: &dyn FilesystemOps, private: Option<&NodePrivate>, cookie: &IoCookie) {
        if let Some(private) = private {
            ops.free_attr_dir_cookie(private, cookie);
        }
    }
}

// --- index-directory descriptors (mount level) ---

struct IndexDirectoryOps;
static INDEX_DIRECTORY_OPS: IndexDirectoryOps = IndexDirectoryOps;

impl DescriptorOps for IndexDirectoryOps {
    fn read_dir(&self, desc: &Descriptor) -> VfsResult<Option<DirEntry>> {
        let ops = desc.mount_ops()?;
        ops.read_index_dir(&desc.cookie)
    }

    fn rewind_dir(&self, desc: &Descriptor) -> VfsResult<()> {
        let ops = desc.mount_ops()?;
        ops.rewind_index_dir(&desc.cookie)
    }

    fn read_stat(&self, _desc: &Descriptor) -> VfsResult<Stat> {
        wrong_type()
    }

    fn write_stat(&self, _desc: &Descriptor, _stat: &Stat, _mask: StatMask) -> VfsResult<()> {
        wrong_type()
    }

    fn close_hook(
        &self,
        ops: &dyn FilesystemOps,
        _private: &NodePrivate,
        cookie: &IoCookie,
    ) -> VfsResult<()> {
        ops.close_index_dir(cookie)
    }

    fn free_hook(&self, ops: &dyn FilesystemOps, _private: Option<&NodePrivate>, cookie: &IoCookie) {
        ops.free_index_dir_cookie(cookie);
    }
}

// --- query descriptors (mount level) ---

struct QueryOps;
static QUERY_OPS: QueryOps = QueryOps;

impl DescriptorOps for QueryOps {
    fn read_dir(&self, desc: &Descriptor) -> VfsResult<Option<DirEntry>> {
        let ops = desc.mount_ops()?;
        ops.read_query(&desc.cookie)
    }

    fn rewind_dir(&self, desc: &Descriptor) -> VfsResult<()> {
        let ops = desc.mount_ops()?;
        ops.rewind_query(&desc.cookie)
    }

    fn read_stat(&self, _desc: &Descriptor) -> VfsResult<Stat> {
        wrong_type()
    }

    fn write_stat(&self, _desc: &Descriptor, _stat: &Stat, _mask: StatMask) -> VfsResult<()> {
        wrong_type()
    }

    fn close_hook(
        &self,
        ops: &dyn FilesystemOps,
        _private: &NodePrivate,
        cookie: &IoCookie,
    ) -> VfsResult<()> {
        ops.close_query(cookie)
    }

    fn free_hook(&self, ops: &dyn FilesystemOps, _private: Option<&NodePrivate>, cookie: &IoCookie) {
        ops.free_query_cookie(cookie);
    }
}
