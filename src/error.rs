//! VFS error type and POSIX errno mapping.
//!
//! Every fallible operation in the crate returns [`VfsError`], a kind plus a
//! static message. At the outermost (syscall-like) boundary callers can turn
//! any error into a negative errno with [`VfsError::errno`]; the mapping is
//! 1:1 and lossless in that direction.

use core::fmt;

/// Classification of VFS failures.
///
/// Three broad families: semantic path errors detected before a driver hook
/// runs, contention results (`Busy`, `WouldBlock`, `Interrupted`) and
/// resource exhaustion. Driver errors pass through with whatever kind the
/// driver chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Path component or node does not exist.
    NotFound,
    /// Node, mount or mount point is in use.
    Busy,
    /// A non-blocking lock request conflicts with an existing lock.
    WouldBlock,
    /// A blocking wait was abandoned before the resource became available.
    Interrupted,
    NotADirectory,
    IsADirectory,
    AlreadyExists,
    /// Symbolic link nesting exceeded the traversal bound.
    LinkLimit,
    NameTooLong,
    /// Hard link or rename across mount boundaries.
    CrossDevice,
    BadDescriptor,
    DescriptorTableFull,
    NoMemory,
    NoSpace,
    InvalidPath,
    InvalidArgument,
    PermissionDenied,
    ReadOnly,
    /// The driver does not implement the requested hook.
    Unsupported,
    /// The descriptor was disconnected by a forced unmount.
    Stale,
    Io,
    /// Structural condition that should not occur in a healthy VFS, e.g.
    /// resolving a path before any root filesystem is mounted.
    Internal,
}

impl ErrorKind {
    /// The POSIX errno this kind maps to, as a positive value.
    pub fn as_errno(self) -> i32 {
        match self {
            ErrorKind::NotFound => libc::ENOENT,
            ErrorKind::Busy => libc::EBUSY,
            ErrorKind::WouldBlock => libc::EAGAIN,
            ErrorKind::Interrupted => libc::EINTR,
            ErrorKind::NotADirectory => libc::ENOTDIR,
            ErrorKind::IsADirectory => libc::EISDIR,
            ErrorKind::AlreadyExists => libc::EEXIST,
            ErrorKind::LinkLimit => libc::ELOOP,
            ErrorKind::NameTooLong => libc::ENAMETOOLONG,
            ErrorKind::CrossDevice => libc::EXDEV,
            ErrorKind::BadDescriptor => libc::EBADF,
            ErrorKind::DescriptorTableFull => libc::EMFILE,
            ErrorKind::NoMemory => libc::ENOMEM,
            ErrorKind::NoSpace => libc::ENOSPC,
            ErrorKind::InvalidPath => libc::EINVAL,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::PermissionDenied => libc::EACCES,
            ErrorKind::ReadOnly => libc::EROFS,
            ErrorKind::Unsupported => libc::ENOTSUP,
            ErrorKind::Stale => libc::ESTALE,
            ErrorKind::Io => libc::EIO,
            ErrorKind::Internal => libc::EIO,
        }
    }
}

/// Error value carried through every VFS operation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VfsError {
    pub kind: ErrorKind,
    pub message: &'static str,
}

impl VfsError {
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// Negative errno for the syscall boundary.
    pub fn errno(&self) -> i32 {
        -self.kind.as_errno()
    }
}

impl fmt::Debug for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VfsError {{ kind: {:?}, message: {} }}", self.kind, self.message)
    }
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for VfsError {}

/// Result alias used throughout the crate.
pub type VfsResult<T> = Result<T, VfsError>;

/// Shorthand constructor, mirroring how call sites read best.
pub(crate) fn vfs_error(kind: ErrorKind, message: &'static str) -> VfsError {
    VfsError::new(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_negative_posix() {
        assert_eq!(vfs_error(ErrorKind::NotFound, "x").errno(), -libc::ENOENT);
        assert_eq!(vfs_error(ErrorKind::Busy, "x").errno(), -libc::EBUSY);
        assert_eq!(vfs_error(ErrorKind::LinkLimit, "x").errno(), -libc::ELOOP);
        assert_eq!(vfs_error(ErrorKind::WouldBlock, "x").errno(), -libc::EAGAIN);
        assert_eq!(vfs_error(ErrorKind::CrossDevice, "x").errno(), -libc::EXDEV);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = vfs_error(ErrorKind::NotADirectory, "lookup on a file");
        let text = format!("{}", err);
        assert!(text.contains("NotADirectory"));
        assert!(text.contains("lookup on a file"));
    }
}
