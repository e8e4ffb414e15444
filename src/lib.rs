//! A virtual filesystem layer in the classic vnode style.
//!
//! The crate multiplexes any number of mounted filesystem volumes into one
//! namespace. Filesystem implementations plug in through the driver contract
//! in [`driver`]; everything else is core machinery:
//!
//! * [`node`]: the process-wide vnode table. Nodes are cached with an
//!   explicit reference count, parked on a bounded unused list at zero
//!   references, and torn down through driver hooks. [`NodeRef`] makes the
//!   acquire/release discipline a move-semantics property.
//! * [`mount`]: mount records, cover links between volumes, and the global
//!   mount-operation lock. Orchestration (including forced unmount with
//!   descriptor disconnection) lives in [`Vfs`].
//! * the resolver: path walking, including symbolic links with a nesting
//!   bound, transparent mount crossing in both directions, and inverse path
//!   reconstruction.
//! * [`advisory`]: per-node advisory byte-range locks with blocking waits.
//! * [`descriptor`]: type-tagged open descriptors dispatching through fixed
//!   per-type operation tables; [`io_context`] holds the per-process
//!   descriptor slot table and working directory.
//!
//! [`testfs`] is a complete in-memory driver, used by the test suite and
//! handy as a reference implementation of the contract.

pub mod advisory;
pub mod driver;
pub mod error;
pub mod testfs;
pub mod types;

pub mod descriptor;
pub mod io_context;
pub mod mount;
pub mod node;
mod resolver;
mod vfs;

pub use descriptor::{Descriptor, DescriptorKind};
pub use error::{ErrorKind, VfsError, VfsResult};
pub use io_context::{Fd, IoContext};
pub use mount::Mount;
pub use node::{CacheHandle, NodeRef, NodeTable, Vnode};
pub use types::{
    AccessMode, AttrInfo, DirEntry, FsInfo, FsInfoMask, GlobalNodeId, LockOwner, MemoryPressure,
    MountFlags, MountId, MountInfo, NodeId, NodeKind, OpenFlags, SeekFrom, Stat, StatMask,
    UnmountFlags, VfsOptions,
};
pub use vfs::Vfs;

#[cfg(test)]
mod tests;
