//! Per-context I/O state: descriptor table and working directory.
//!
//! An [`IoContext`] models one process-like consumer of the VFS: a
//! fixed-size descriptor slot table with a close-on-exec bit per slot, and a
//! current working directory holding an owned node reference. The VFS keeps a
//! weak registry of live contexts so forced unmount can sweep every table for
//! descriptors touching the doomed mount.

use core::fmt;
use std::sync::Arc;

use spin::RwLock as SpinRwLock;

use crate::descriptor::Descriptor;
use crate::error::{vfs_error, ErrorKind, VfsResult};
use crate::node::NodeRef;
use crate::types::MountId;

/// Descriptor slot index.
pub type Fd = usize;

pub struct IoContext {
    inner: SpinRwLock<IoContextInner>,
}

struct IoContextInner {
    cwd: Option<NodeRef>,
    slots: Vec<Option<Arc<Descriptor>>>,
    /// Close-on-exec bitmap, one bit per slot.
    cloexec: Vec<u64>,
}

impl IoContext {
    pub(crate) fn new(table_size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: SpinRwLock::new(IoContextInner {
                cwd: None,
                slots: vec![None; table_size],
                cloexec: vec![0; table_size.div_ceil(64)],
            }),
        })
    }

    /// Place a descriptor in the lowest free slot.
    pub(crate) fn attach(&self, desc: Arc<Descriptor>, cloexec: bool) -> VfsResult<Fd> {
        let mut inner = self.inner.write();
        let fd = inner
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| vfs_error(ErrorKind::DescriptorTableFull, "descriptor table is full"))?;
        desc.retain_slot();
        inner.slots[fd] = Some(desc);
        inner.set_cloexec_bit(fd, cloexec);
        Ok(fd)
    }

    pub(crate) fn get(&self, fd: Fd) -> VfsResult<Arc<Descriptor>> {
        self.inner
            .read()
            .slots
            .get(fd)
            .and_then(Clone::clone)
            .ok_or_else(|| vfs_error(ErrorKind::BadDescriptor, "no such descriptor"))
    }

    /// Remove a descriptor from its slot; the caller drives the close.
    pub(crate) fn detach(&self, fd: Fd) -> VfsResult<Arc<Descriptor>> {
        let mut inner = self.inner.write();
        let slot = inner
            .slots
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or_else(|| vfs_error(ErrorKind::BadDescriptor, "no such descriptor"))?;
        inner.set_cloexec_bit(fd, false);
        Ok(slot)
    }

    pub fn set_cloexec(&self, fd: Fd, value: bool) -> VfsResult<()> {
        let mut inner = self.inner.write();
        if inner.slots.get(fd).map(Option::is_some) != Some(true) {
            return Err(vfs_error(ErrorKind::BadDescriptor, "no such descriptor"));
        }
        inner.set_cloexec_bit(fd, value);
        Ok(())
    }

    pub fn is_cloexec(&self, fd: Fd) -> VfsResult<bool> {
        let inner = self.inner.read();
        if inner.slots.get(fd).map(Option::is_some) != Some(true) {
            return Err(vfs_error(ErrorKind::BadDescriptor, "no such descriptor"));
        }
        Ok(inner.cloexec_bit(fd))
    }

    /// Pull every close-on-exec descriptor out of the table. The caller
    /// closes them; the slots are free immediately.
    pub(crate) fn take_cloexec(&self) -> Vec<Arc<Descriptor>> {
        let mut inner = self.inner.write();
        let mut taken = Vec::new();
        for fd in 0..inner.slots.len() {
            if inner.cloexec_bit(fd) {
                if let Some(desc) = inner.slots[fd].take() {
                    taken.push(desc);
                }
                inner.set_cloexec_bit(fd, false);
            }
        }
        taken
    }

    /// Pull every descriptor out of the table, e.g. on context teardown.
    pub(crate) fn take_all(&self) -> Vec<Arc<Descriptor>> {
        let mut inner = self.inner.write();
        for word in inner.cloexec.iter_mut() {
            *word = 0;
        }
        inner.slots.iter_mut().filter_map(Option::take).collect()
    }

    pub(crate) fn set_cwd(&self, cwd: NodeRef) -> Option<NodeRef> {
        self.inner.write().cwd.replace(cwd)
    }

    pub(crate) fn take_cwd(&self) -> Option<NodeRef> {
        self.inner.write().cwd.take()
    }

    /// A fresh owned reference to the working directory.
    pub(crate) fn cwd_ref(&self) -> VfsResult<NodeRef> {
        self.inner
            .read()
            .cwd
            .clone()
            .ok_or_else(|| vfs_error(ErrorKind::Internal, "context has no working directory"))
    }

    pub(crate) fn cwd_is_on(&self, mount_id: MountId) -> bool {
        self.inner
            .read()
            .cwd
            .as_ref()
            .map(|cwd| cwd.mount_id() == mount_id)
            .unwrap_or(false)
    }

    /// Disconnect every descriptor referencing `mount_id`. Returns the number
    /// that still has an operation in flight.
    pub(crate) fn disconnect_mount(&self, mount_id: MountId) -> usize {
        let descriptors: Vec<Arc<Descriptor>> = self
            .inner
            .read()
            .slots
            .iter()
            .flatten()
            .filter(|d| d.target_mount_id() == Some(mount_id))
            .cloned()
            .collect();
        descriptors.iter().filter(|d| !d.disconnect()).count()
    }

    pub fn open_count(&self) -> usize {
        self.inner.read().slots.iter().flatten().count()
    }
}

impl IoContextInner {
    fn cloexec_bit(&self, fd: Fd) -> bool {
        self.cloexec[fd / 64] & (1u64 << (fd % 64)) != 0
    }

    fn set_cloexec_bit(&mut self, fd: Fd, value: bool) {
        if value {
            self.cloexec[fd / 64] |= 1u64 << (fd % 64);
        } else {
            self.cloexec[fd / 64] &= !(1u64 << (fd % 64));
        }
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("IoContext")
            .field("open", &inner.slots.iter().flatten().count())
            .field("cwd", &inner.cwd)
            .finish()
    }
}
