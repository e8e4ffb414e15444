//! Path resolution.
//!
//! Turns a starting node plus a path string into a terminal node. The walk
//! consumes its starting reference on every exit path, success or failure,
//! which falls out of `NodeRef`'s move semantics rather than bookkeeping.
//!
//! Per component: optional driver access check, driver `lookup`, node-table
//! fetch. Symbolic links expand bounded by the nesting limit, with absolute
//! targets restarting from the root. A resolved node covered by another
//! mount's root is transparently substituted by that root; ".." at a mount's
//! root first steps to the underlying covered directory, allowing escape
//! from the mount.

use std::collections::VecDeque;

use crate::error::{vfs_error, ErrorKind, VfsResult};
use crate::node::NodeRef;
use crate::types::{AccessMode, NodeId, NodeKind};
use crate::vfs::Vfs;

/// Hard ceiling on walked components, guarding against pathological inputs
/// independent of the symlink bound.
const MAX_COMPONENTS: usize = 1024;

impl Vfs {
    /// Reference to the global root node, or `Internal` before any root
    /// filesystem is mounted (deliberately not "not found").
    pub(crate) fn root_ref(&self) -> VfsResult<NodeRef> {
        let root_mount = self
            .mounts()
            .root_mount()
            .ok_or_else(|| vfs_error(ErrorKind::Internal, "no root filesystem mounted"))?;
        let root_vnode = root_mount
            .root_vnode()
            .ok_or_else(|| vfs_error(ErrorKind::Internal, "root mount has no root node"))?;
        self.nodes().get(&root_mount, root_vnode.id().node, true)
    }

    /// Resolve `path` starting from `start` (ignored for absolute paths).
    /// `traverse_leaf` controls whether a symlink in the final component is
    /// followed.
    pub(crate) fn resolve_node(
        &self,
        start: NodeRef,
        path: &str,
        traverse_leaf: bool,
    ) -> VfsResult<NodeRef> {
        let mut depth = 0u32;
        self.walk(start, path, traverse_leaf, &mut depth)
    }

    fn walk(
        &self,
        start: NodeRef,
        path: &str,
        traverse_leaf: bool,
        depth: &mut u32,
    ) -> VfsResult<NodeRef> {
        if path.is_empty() {
            return Err(vfs_error(ErrorKind::NotFound, "empty path"));
        }

        let mut current = if path.starts_with('/') {
            drop(start);
            self.root_ref()?
        } else {
            start
        };

        let mut components: VecDeque<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        let mut walked = 0usize;

        while let Some(name) = components.pop_front() {
            walked += 1;
            if walked > MAX_COMPONENTS {
                return Err(vfs_error(ErrorKind::LinkLimit, "path expansion too long"));
            }
            if name == "." {
                continue;
            }
            if name.len() > self.options().max_name_length {
                return Err(vfs_error(ErrorKind::NameTooLong, "path component too long"));
            }
            if current.kind() != NodeKind::Directory {
                return Err(vfs_error(ErrorKind::NotADirectory, "component is not a directory"));
            }

            if name == ".." {
                // At a mount's root, ".." escapes into the mount below by
                // stepping to the covered directory first.
                let mount = current.mount()?;
                if mount.is_root_of(current.vnode()) {
                    match mount.covers_vnode() {
                        Some(covers) => {
                            let covers_mount = covers.mount()?;
                            current = self.nodes().get(&covers_mount, covers.id().node, true)?;
                        }
                        // ".." at the global root stays at the root.
                        None => continue,
                    }
                }
            }

            let mount = current.mount()?;
            let ops = mount.ops()?;
            let dir_private = current.private()?;
            ops.access(&dir_private, AccessMode::EXECUTE)?;
            let (child_id, child_kind) = ops.lookup(&dir_private, &name)?;
            let child = self.nodes().get(&mount, child_id, true)?;
            if child.kind() == NodeKind::Unknown {
                child.vnode().set_kind(child_kind);
            }
            // A ".." lookup yields the parent, not a child of `current`.
            if name != ".." && child_id != current.node_id() {
                child.vnode().set_parent(current.node_id());
            }

            if child.kind() == NodeKind::SymbolicLink
                && (!components.is_empty() || traverse_leaf)
            {
                *depth += 1;
                if *depth > self.options().max_symlink_depth {
                    return Err(vfs_error(ErrorKind::LinkLimit, "too many nested symbolic links"));
                }
                let target = ops.read_symlink(&child.private()?)?;
                drop(child);
                if target.is_empty() {
                    return Err(vfs_error(ErrorKind::NotFound, "empty symbolic link target"));
                }
                if target.starts_with('/') {
                    current = self.root_ref()?;
                }
                for component in target.split('/').rev().filter(|c| !c.is_empty()) {
                    components.push_front(component.to_string());
                }
                continue;
            }

            // A node covered by another mount's root resolves to that root.
            current = match child.vnode().covered_by() {
                Some(cover_root) => {
                    let cover_mount = cover_root.mount()?;
                    drop(child);
                    self.nodes().get(&cover_mount, cover_root.id().node, true)?
                }
                None => child,
            };
        }

        Ok(current)
    }

    /// Resolve everything but the final component, returning the parent
    /// directory and the leaf name. Used by create/unlink/rename-style
    /// operations that hand the leaf to a driver hook.
    pub(crate) fn resolve_parent(
        &self,
        start: NodeRef,
        path: &str,
    ) -> VfsResult<(NodeRef, String)> {
        if path.is_empty() {
            return Err(vfs_error(ErrorKind::NotFound, "empty path"));
        }
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(vfs_error(ErrorKind::InvalidPath, "no leaf name in path"));
        }
        let (dir_part, leaf) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
            None => ("", trimmed),
        };
        if leaf == "." || leaf == ".." {
            return Err(vfs_error(ErrorKind::InvalidPath, "leaf cannot be . or .."));
        }
        if leaf.len() > self.options().max_name_length {
            return Err(vfs_error(ErrorKind::NameTooLong, "leaf name too long"));
        }
        let dir = if dir_part.is_empty() {
            if path.starts_with('/') {
                drop(start);
                self.root_ref()?
            } else {
                start
            }
        } else {
            self.resolve_node(start, dir_part, true)?
        };
        if dir.kind() != NodeKind::Directory {
            return Err(vfs_error(ErrorKind::NotADirectory, "parent is not a directory"));
        }
        Ok((dir, leaf.to_string()))
    }

    /// Reconstruct an absolute path for `node` by walking ".." upward,
    /// hopping from mount roots to the directories they cover. Inverse of
    /// resolution absent concurrent renames.
    pub fn path_for_node(&self, node: &NodeRef) -> VfsResult<String> {
        let root = self.root_ref()?;
        let mut names: Vec<String> = Vec::new();
        let mut current = node.clone();
        let mut steps = 0usize;

        loop {
            // Hop over stacked mount roots to the covered directory.
            loop {
                let mount = current.mount()?;
                if mount.is_root_of(current.vnode()) {
                    if let Some(covers) = mount.covers_vnode() {
                        let covers_mount = covers.mount()?;
                        current = self.nodes().get(&covers_mount, covers.id().node, true)?;
                        continue;
                    }
                }
                break;
            }
            if current.id() == root.id() {
                break;
            }
            steps += 1;
            if steps > MAX_COMPONENTS {
                return Err(vfs_error(ErrorKind::Internal, "node is not reachable from the root"));
            }

            let mount = current.mount()?;
            let ops = mount.ops()?;
            let private = current.private()?;
            // Only directories answer a ".." lookup; other nodes rely on the
            // parent hint recorded when they were resolved.
            let parent_id = if current.kind() == NodeKind::Directory {
                ops.lookup(&private, "..")?.0
            } else {
                current.vnode().parent().ok_or_else(|| {
                    vfs_error(ErrorKind::Unsupported, "node has no recorded parent directory")
                })?
            };
            if parent_id == current.node_id() {
                return Err(vfs_error(ErrorKind::Internal, "node is its own parent"));
            }
            let parent = self.nodes().get(&mount, parent_id, true)?;
            let name = match ops.get_node_name(&private) {
                Ok(name) => name,
                Err(err) if err.kind == ErrorKind::Unsupported => {
                    scan_parent_for_name(&parent, current.node_id())?
                }
                Err(err) => return Err(err),
            };
            names.push(name);
            current = parent;
        }

        if names.is_empty() {
            return Ok(String::from("/"));
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }
}

/// Fallback for drivers without a `get_node_name` hook: scan the parent
/// directory for the entry with the matching node id.
fn scan_parent_for_name(parent: &NodeRef, id: NodeId) -> VfsResult<String> {
    let mount = parent.mount()?;
    let ops = mount.ops()?;
    let private = parent.private()?;
    let cookie = ops.open_dir(&private)?;
    let found = loop {
        match ops.read_dir(&private, &cookie) {
            Ok(Some(entry)) => {
                if entry.id == id && entry.name != "." && entry.name != ".." {
                    break Ok(entry.name);
                }
            }
            Ok(None) => {
                break Err(vfs_error(ErrorKind::NotFound, "entry not present in its parent"))
            }
            Err(err) => break Err(err),
        }
    };
    let _ = ops.close_dir(&private, &cookie);
    ops.free_dir_cookie(&private, &cookie);
    found
}
