//! The filesystem driver contract.
//!
//! Drivers plug into the VFS through two traits. [`FilesystemDriver`] is the
//! registered factory: it knows how to mount one volume and hand back a
//! per-mount [`FilesystemOps`] instance. [`FilesystemOps`] is the operation
//! table every VFS call is dispatched through; one instance per mounted
//! volume, so the driver's mount cookie is simply `self`.
//!
//! Node private data and open cookies are opaque to the core. The VFS stores
//! and returns them, never inspects them; a driver downcasts with `Any`.
//! Hooks a driver does not support keep their default `Unsupported` bodies,
//! with two exceptions the core treats specially: `get_node_name` falls back
//! to a parent-directory scan, and `access` defaults to permitting.

use core::any::Any;
use std::sync::Arc;

use crate::error::{vfs_error, ErrorKind, VfsResult};
use crate::types::{
    AccessMode, AttrInfo, DirEntry, FsInfo, FsInfoMask, MountFlags, MountId, NodeId, NodeKind,
    OpenFlags, Stat, StatMask,
};
use crate::vfs::Vfs;

/// Driver-private per-node data, created by `get_node` and released through
/// `put_node`/`remove_node`.
pub type NodePrivate = Arc<dyn Any + Send + Sync>;

/// Driver-private per-open state (file position bookkeeping, directory
/// iteration cursors, query state, ...).
pub type IoCookie = Arc<dyn Any + Send + Sync>;

fn unsupported<T>(message: &'static str) -> VfsResult<T> {
    Err(vfs_error(ErrorKind::Unsupported, message))
}

/// A mountable filesystem implementation, registered by name.
pub trait FilesystemDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Instantiate one volume.
    ///
    /// The mount record is already present in the mount table when this hook
    /// runs, so the driver may call [`Vfs::register_node`] /
    /// [`Vfs::publish_node`] for nodes it constructs while mounting. Returns
    /// the per-mount operation table and the node id of the volume root.
    fn mount(
        &self,
        vfs: &Arc<Vfs>,
        mount_id: MountId,
        device: Option<&str>,
        args: Option<&str>,
        flags: MountFlags,
    ) -> VfsResult<(Arc<dyn FilesystemOps>, NodeId)>;
}

/// Per-mount operation table consumed by the VFS core.
///
/// Mount-level hooks take no node; node-level hooks receive the opaque
/// private data the driver returned from `get_node`.
#[allow(unused_variables)]
pub trait FilesystemOps: Send + Sync {
    // --- mount level ---

    /// Final teardown, invoked after the VFS has already freed every node
    /// and removed the mount record.
    fn unmount(&self);

    fn sync(&self) -> VfsResult<()> {
        Ok(())
    }

    fn read_fs_info(&self) -> VfsResult<FsInfo> {
        unsupported("read_fs_info not supported")
    }

    fn write_fs_info(&self, info: &FsInfo, mask: FsInfoMask) -> VfsResult<()> {
        unsupported("write_fs_info not supported")
    }

    // --- node lifecycle ---

    /// Produce private data for a node the VFS is caching. Runs with the
    /// vnode marked busy; no other caller can observe it yet.
    fn get_node(&self, id: NodeId) -> VfsResult<(NodePrivate, NodeKind)>;

    /// Release private data for a node leaving the cache.
    fn put_node(&self, node: &NodePrivate, reenter: bool);

    /// Like `put_node`, for a node whose remove flag was set: the driver
    /// should delete the underlying entity.
    fn remove_node(&self, node: &NodePrivate, reenter: bool) {
        self.put_node(node, reenter);
    }

    // --- namespace ---

    fn lookup(&self, dir: &NodePrivate, name: &str) -> VfsResult<(NodeId, NodeKind)>;

    /// Name of a node within its parent. Optional: when unsupported the VFS
    /// scans the parent directory instead.
    fn get_node_name(&self, node: &NodePrivate) -> VfsResult<String> {
        unsupported("get_node_name not supported")
    }

    fn create(
        &self,
        dir: &NodePrivate,
        name: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<(NodeId, IoCookie)> {
        unsupported("create not supported")
    }

    fn create_dir(&self, dir: &NodePrivate, name: &str, mode: u32) -> VfsResult<()> {
        unsupported("create_dir not supported")
    }

    fn remove_dir(&self, dir: &NodePrivate, name: &str) -> VfsResult<()> {
        unsupported("remove_dir not supported")
    }

    fn create_symlink(
        &self,
        dir: &NodePrivate,
        name: &str,
        target: &str,
        mode: u32,
    ) -> VfsResult<()> {
        unsupported("create_symlink not supported")
    }

    fn read_symlink(&self, node: &NodePrivate) -> VfsResult<String> {
        unsupported("read_symlink not supported")
    }

    fn link(&self, dir: &NodePrivate, name: &str, node: &NodePrivate) -> VfsResult<()> {
        unsupported("link not supported")
    }

    fn unlink(&self, dir: &NodePrivate, name: &str) -> VfsResult<()> {
        unsupported("unlink not supported")
    }

    fn rename(
        &self,
        from_dir: &NodePrivate,
        from_name: &str,
        to_dir: &NodePrivate,
        to_name: &str,
    ) -> VfsResult<()> {
        unsupported("rename not supported")
    }

    /// Search/access permission check. Defaults to permitting, matching
    /// filesystems without permission metadata.
    fn access(&self, node: &NodePrivate, mode: AccessMode) -> VfsResult<()> {
        Ok(())
    }

    fn read_stat(&self, node: &NodePrivate) -> VfsResult<Stat>;

    fn write_stat(&self, node: &NodePrivate, stat: &Stat, mask: StatMask) -> VfsResult<()> {
        unsupported("write_stat not supported")
    }

    fn fsync(&self, node: &NodePrivate) -> VfsResult<()> {
        Ok(())
    }

    // --- file I/O ---

    fn open(&self, node: &NodePrivate, flags: OpenFlags) -> VfsResult<IoCookie> {
        unsupported("open not supported")
    }

    fn close(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<()> {
        Ok(())
    }

    fn free_cookie(&self, node: &NodePrivate, cookie: &IoCookie) {}

    fn read(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        pos: u64,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        unsupported("read not supported")
    }

    fn write(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        pos: u64,
        buf: &[u8],
    ) -> VfsResult<usize> {
        unsupported("write not supported")
    }

    fn ioctl(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        op: u32,
        arg: &mut [u8],
    ) -> VfsResult<()> {
        unsupported("ioctl not supported")
    }

    // --- directories ---

    fn open_dir(&self, node: &NodePrivate) -> VfsResult<IoCookie> {
        unsupported("open_dir not supported")
    }

    fn read_dir(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<Option<DirEntry>> {
        unsupported("read_dir not supported")
    }

    fn rewind_dir(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<()> {
        unsupported("rewind_dir not supported")
    }

    fn close_dir(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<()> {
        Ok(())
    }

    fn free_dir_cookie(&self, node: &NodePrivate, cookie: &IoCookie) {}

    // --- attributes ---

    fn open_attr_dir(&self, node: &NodePrivate) -> VfsResult<IoCookie> {
        unsupported("open_attr_dir not supported")
    }

    fn read_attr_dir(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<Option<DirEntry>> {
        unsupported("read_attr_dir not supported")
    }

    fn rewind_attr_dir(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<()> {
        unsupported("rewind_attr_dir not supported")
    }

    fn close_attr_dir(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<()> {
        Ok(())
    }

    fn free_attr_dir_cookie(&self, node: &NodePrivate, cookie: &IoCookie) {}

    fn create_attr(
        &self,
        node: &NodePrivate,
        name: &str,
        type_code: u32,
        flags: OpenFlags,
    ) -> VfsResult<IoCookie> {
        unsupported("create_attr not supported")
    }

    fn open_attr(&self, node: &NodePrivate, name: &str, flags: OpenFlags) -> VfsResult<IoCookie> {
        unsupported("open_attr not supported")
    }

    fn close_attr(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<()> {
        Ok(())
    }

    fn free_attr_cookie(&self, node: &NodePrivate, cookie: &IoCookie) {}

    fn read_attr(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        pos: u64,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        unsupported("read_attr not supported")
    }

    fn write_attr(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        pos: u64,
        buf: &[u8],
    ) -> VfsResult<usize> {
        unsupported("write_attr not supported")
    }

    fn read_attr_stat(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<AttrInfo> {
        unsupported("read_attr_stat not supported")
    }

    fn write_attr_stat(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        info: &AttrInfo,
    ) -> VfsResult<()> {
        unsupported("write_attr_stat not supported")
    }

    fn remove_attr(&self, node: &NodePrivate, name: &str) -> VfsResult<()> {
        unsupported("remove_attr not supported")
    }

    fn rename_attr(
        &self,
        node: &NodePrivate,
        from_name: &str,
        to_name: &str,
    ) -> VfsResult<()> {
        unsupported("rename_attr not supported")
    }

    // --- indexes ---

    fn open_index_dir(&self) -> VfsResult<IoCookie> {
        unsupported("open_index_dir not supported")
    }

    fn read_index_dir(&self, cookie: &IoCookie) -> VfsResult<Option<DirEntry>> {
        unsupported("read_index_dir not supported")
    }

    fn rewind_index_dir(&self, cookie: &IoCookie) -> VfsResult<()> {
        unsupported("rewind_index_dir not supported")
    }

    fn close_index_dir(&self, cookie: &IoCookie) -> VfsResult<()> {
        Ok(())
    }

    fn free_index_dir_cookie(&self, cookie: &IoCookie) {}

    fn create_index(&self, name: &str, type_code: u32) -> VfsResult<()> {
        unsupported("create_index not supported")
    }

    fn remove_index(&self, name: &str) -> VfsResult<()> {
        unsupported("remove_index not supported")
    }

    fn read_index_stat(&self, name: &str) -> VfsResult<AttrInfo> {
        unsupported("read_index_stat not supported")
    }

    // --- queries ---

    fn open_query(&self, query: &str, flags: u32) -> VfsResult<IoCookie> {
        unsupported("open_query not supported")
    }

    fn read_query(&self, cookie: &IoCookie) -> VfsResult<Option<DirEntry>> {
        unsupported("read_query not supported")
    }

    fn rewind_query(&self, cookie: &IoCookie) -> VfsResult<()> {
        unsupported("rewind_query not supported")
    }

    fn close_query(&self, cookie: &IoCookie) -> VfsResult<()> {
        Ok(())
    }

    fn free_query_cookie(&self, cookie: &IoCookie) {}

    // --- paging seam ---

    /// Whether the node's data may be mapped through the page cache.
    fn can_page(&self, node: &NodePrivate) -> bool {
        false
    }

    fn read_pages(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        pos: u64,
        bufs: &mut [&mut [u8]],
    ) -> VfsResult<usize> {
        unsupported("read_pages not supported")
    }

    fn write_pages(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        pos: u64,
        bufs: &[&[u8]],
    ) -> VfsResult<usize> {
        unsupported("write_pages not supported")
    }

    /// Map a byte range of the file onto backing extents (offset, length).
    fn get_file_map(
        &self,
        node: &NodePrivate,
        pos: u64,
        len: u64,
    ) -> VfsResult<Vec<(u64, u64)>> {
        unsupported("get_file_map not supported")
    }

    // --- event interest ---

    fn select(&self, node: &NodePrivate, cookie: &IoCookie, events: u32) -> VfsResult<u32> {
        unsupported("select not supported")
    }

    fn deselect(&self, node: &NodePrivate, cookie: &IoCookie, events: u32) -> VfsResult<()> {
        Ok(())
    }
}
