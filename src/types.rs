//! Shared data model: identifiers, stat records, flags and directory entries.

use core::fmt;

/// Identifier of one mounted volume, unique for the lifetime of a [`crate::Vfs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MountId(pub u64);

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Driver-assigned identifier of a node within its own volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide unique node key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalNodeId {
    pub mount: MountId,
    pub node: NodeId,
}

impl fmt::Display for GlobalNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mount, self.node)
    }
}

/// What kind of entity a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    SymbolicLink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

/// Stat record exchanged with drivers.
///
/// `device` and `node` are stamped by the VFS after every driver `read_stat`
/// call; a driver does not know the mount id it was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub device: u64,
    pub node: u64,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub link_count: u32,
    pub created_time: u64,
    pub modified_time: u64,
    pub accessed_time: u64,
}

impl Default for Stat {
    fn default() -> Self {
        Self {
            device: 0,
            node: 0,
            kind: NodeKind::Unknown,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            link_count: 1,
            created_time: 0,
            modified_time: 0,
            accessed_time: 0,
        }
    }
}

bitflags::bitflags! {
    /// Field selector for `write_stat` style operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatMask: u32 {
        const MODE = 1 << 0;
        const UID = 1 << 1;
        const GID = 1 << 2;
        const SIZE = 1 << 3;
        const CREATED_TIME = 1 << 4;
        const MODIFIED_TIME = 1 << 5;
        const ACCESSED_TIME = 1 << 6;
    }
}

/// Volume-level information reported by a driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsInfo {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_nodes: u64,
    pub free_nodes: u64,
    pub volume_name: String,
    pub fs_name: String,
}

bitflags::bitflags! {
    /// Field selector for `write_fs_info`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsInfoMask: u32 {
        const VOLUME_NAME = 1 << 0;
    }
}

/// One directory (or attribute/index/query) listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
}

/// Attribute metadata returned by `read_attr_stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrInfo {
    pub size: u64,
    pub type_code: u32,
}

bitflags::bitflags! {
    /// Open mode and behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const EXCLUSIVE = 1 << 3;
        const TRUNCATE = 1 << 4;
        const APPEND = 1 << 5;
        const NONBLOCK = 1 << 6;
        /// Do not traverse a symbolic link in the final path component.
        const NO_TRAVERSE = 1 << 7;
        const CLOEXEC = 1 << 8;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        self.contains(OpenFlags::READ)
    }

    pub fn writable(self) -> bool {
        self.contains(OpenFlags::WRITE)
    }
}

bitflags::bitflags! {
    /// Access-check mode for the driver `access` hook.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags accepted by `mount`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u32 {
        const READ_ONLY = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Flags accepted by `unmount`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnmountFlags: u32 {
        /// Disconnect live descriptors instead of failing busy.
        const FORCE = 1 << 0;
    }
}

/// Seek origin for descriptor position updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// Severity passed to the low-memory reclaim entry point. The share of the
/// unused-node list that gets freed scales with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    Low,
    Moderate,
    Critical,
}

/// Identity that owns an advisory lock.
///
/// Process owners hold ordinary per-process byte-range locks. Session owners
/// model cooperating groups sharing whole-file locks: any member of the
/// session may release them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    Process(u64),
    Session(u64),
}

/// Summary row produced by mount enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub id: MountId,
    pub driver: String,
    pub root: NodeId,
    /// Global id of the directory this mount covers; `None` for the root mount.
    pub covers: Option<GlobalNodeId>,
}

/// Tunable limits, in the spirit of option-string construction on the
/// drivers' side: everything has a default a kernel would pick.
#[derive(Debug, Clone)]
pub struct VfsOptions {
    /// Soft cap on the unused-node LRU list.
    pub max_unused_nodes: usize,
    /// Timed condvar waits taken on a busy node before giving up.
    pub busy_retry_limit: u32,
    /// Length of one busy-node wait slice.
    pub busy_wait_slice: core::time::Duration,
    /// Symbolic link nesting bound during path resolution.
    pub max_symlink_depth: u32,
    /// Longest accepted single path component.
    pub max_name_length: usize,
    /// Slots in each descriptor table.
    pub descriptor_table_size: usize,
    /// Passes of the forced-unmount drain loop before failing busy.
    pub unmount_drain_limit: u32,
    /// Pause between forced-unmount drain passes.
    pub unmount_drain_slice: core::time::Duration,
    /// Upper bound on one advisory-lock wait; `None` waits indefinitely.
    pub lock_wait_timeout: Option<core::time::Duration>,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self {
            max_unused_nodes: 32,
            busy_retry_limit: 300,
            busy_wait_slice: core::time::Duration::from_millis(10),
            max_symlink_depth: 16,
            max_name_length: 255,
            descriptor_table_size: 128,
            unmount_drain_limit: 10,
            unmount_drain_slice: core::time::Duration::from_millis(10),
            lock_wait_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_node_id_is_hashable_key() {
        let a = GlobalNodeId { mount: MountId(1), node: NodeId(5) };
        let b = GlobalNodeId { mount: MountId(1), node: NodeId(5) };
        let c = GlobalNodeId { mount: MountId(2), node: NodeId(5) };
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut map = hashbrown::HashMap::new();
        map.insert(a, "x");
        assert_eq!(map.get(&b), Some(&"x"));
    }

    #[test]
    fn open_flags_accessors() {
        let flags = OpenFlags::READ | OpenFlags::CREATE;
        assert!(flags.readable());
        assert!(!flags.writable());
    }
}
