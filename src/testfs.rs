//! In-memory filesystem driver backing the test suite.
//!
//! Small but complete enough to exercise every dispatch path: a directory
//! hierarchy with files, symbolic links and hard links, extended attributes,
//! indexes and exact-name queries. Lifecycle hook invocations are counted so
//! tests can assert that every `get_node` is balanced by a `put_node` or
//! `remove_node`.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use spin::Mutex as SpinMutex;

use crate::driver::{FilesystemDriver, FilesystemOps, IoCookie, NodePrivate};
use crate::error::{vfs_error, ErrorKind, VfsResult};
use crate::types::{
    AttrInfo, DirEntry, FsInfo, FsInfoMask, MountFlags, MountId, NodeId, NodeKind, OpenFlags,
    Stat, StatMask,
};
use crate::vfs::Vfs;

pub const ROOT_ID: NodeId = NodeId(1);

/// `ioctl` op understood by test files: fill the argument buffer with 0x5a.
pub const IOCTL_FILL: u32 = 0x7466;

/// The registered driver. Keeps a handle to the most recently mounted volume
/// so tests can reach its hook counters.
pub struct TestFs {
    last_volume: SpinMutex<Option<Arc<TestVolume>>>,
}

impl TestFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { last_volume: SpinMutex::new(None) })
    }

    pub fn volume(&self) -> Option<Arc<TestVolume>> {
        self.last_volume.lock().clone()
    }
}

impl FilesystemDriver for TestFs {
    fn name(&self) -> &str {
        "testfs"
    }

    fn mount(
        &self,
        vfs: &Arc<Vfs>,
        mount_id: MountId,
        _device: Option<&str>,
        args: Option<&str>,
        _flags: MountFlags,
    ) -> VfsResult<(Arc<dyn FilesystemOps>, NodeId)> {
        let volume = TestVolume::new(Arc::downgrade(vfs), mount_id);
        if args == Some("fail") {
            return Err(vfs_error(ErrorKind::Io, "mount refused by test arguments"));
        }
        if args == Some("publish-root") {
            // Exercise the register/publish callbacks from inside the mount
            // hook; the core then finds the root already cached.
            let node = vfs.register_node(
                mount_id,
                ROOT_ID,
                Arc::new(TestNode { id: ROOT_ID }),
                NodeKind::Directory,
            )?;
            vfs.publish_node(&node);
        }
        *self.last_volume.lock() = Some(Arc::clone(&volume));
        Ok((volume, ROOT_ID))
    }
}

/// Per-node private data handed to the VFS; just the entity id.
struct TestNode {
    id: NodeId,
}

struct Attr {
    type_code: u32,
    data: Vec<u8>,
}

struct Entity {
    kind: NodeKind,
    mode: u32,
    link_count: u32,
    /// File content, or the target path for a symbolic link.
    data: Vec<u8>,
    children: BTreeMap<String, NodeId>,
    parent: NodeId,
    attrs: BTreeMap<String, Attr>,
    created: u64,
    modified: u64,
}

impl Entity {
    fn new(kind: NodeKind, mode: u32, parent: NodeId, now: u64) -> Self {
        Self {
            kind,
            mode,
            link_count: 1,
            data: Vec::new(),
            children: BTreeMap::new(),
            parent,
            attrs: BTreeMap::new(),
            created: now,
            modified: now,
        }
    }
}

struct VolumeState {
    entities: HashMap<NodeId, Entity>,
    next_id: u64,
    indexes: BTreeMap<String, u32>,
    volume_name: String,
}

/// One mounted in-memory volume.
pub struct TestVolume {
    vfs: Weak<Vfs>,
    mount_id: MountId,
    state: SpinMutex<VolumeState>,
    clock: AtomicU64,
    get_nodes: AtomicU32,
    put_nodes: AtomicU32,
    removed_nodes: AtomicU32,
}

impl TestVolume {
    fn new(vfs: Weak<Vfs>, mount_id: MountId) -> Arc<Self> {
        let mut entities = HashMap::new();
        let mut root = Entity::new(NodeKind::Directory, 0o755, ROOT_ID, 0);
        root.link_count = 2;
        entities.insert(ROOT_ID, root);
        Arc::new(Self {
            vfs,
            mount_id,
            state: SpinMutex::new(VolumeState {
                entities,
                next_id: ROOT_ID.0 + 1,
                indexes: BTreeMap::new(),
                volume_name: String::from("testfs volume"),
            }),
            clock: AtomicU64::new(1),
            get_nodes: AtomicU32::new(0),
            put_nodes: AtomicU32::new(0),
            removed_nodes: AtomicU32::new(0),
        })
    }

    pub fn get_node_calls(&self) -> u32 {
        self.get_nodes.load(Ordering::Acquire)
    }

    pub fn put_node_calls(&self) -> u32 {
        self.put_nodes.load(Ordering::Acquire)
    }

    pub fn removed_node_calls(&self) -> u32 {
        self.removed_nodes.load(Ordering::Acquire)
    }

    pub fn entity_count(&self) -> usize {
        self.state.lock().entities.len()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate(&self, state: &mut VolumeState) -> NodeId {
        let id = NodeId(state.next_id);
        state.next_id += 1;
        id
    }

    /// Drop one name of `id` under the state lock. Returns the id when the
    /// last name went away; the caller must hand it to [`Self::reap`] after
    /// releasing the lock.
    fn drop_name(&self, state: &mut VolumeState, id: NodeId) -> Option<NodeId> {
        let entity = state.entities.get_mut(&id)?;
        entity.link_count = entity.link_count.saturating_sub(1);
        (entity.link_count == 0).then_some(id)
    }

    /// Dispose of a nameless entity. Deletion is deferred through the VFS
    /// when the node is cached, so an open descriptor keeps it alive; the
    /// `remove_node` hook may run re-entrantly, so no state lock here.
    fn reap(&self, id: NodeId) {
        let deferred = self
            .vfs
            .upgrade()
            .map(|vfs| vfs.mark_node_removed(self.mount_id, id))
            .unwrap_or(false);
        if !deferred {
            self.state.lock().entities.remove(&id);
        }
    }
}

fn node_id(private: &NodePrivate) -> VfsResult<NodeId> {
    private
        .downcast_ref::<TestNode>()
        .map(|n| n.id)
        .ok_or_else(|| vfs_error(ErrorKind::Internal, "foreign node private data"))
}

/// Snapshot-style listing cursor shared by directory, attribute-directory,
/// index-directory and query cookies.
struct ListCookie {
    entries: SpinMutex<Vec<DirEntry>>,
    pos: AtomicUsize,
}

impl ListCookie {
    fn new(entries: Vec<DirEntry>) -> Arc<Self> {
        Arc::new(Self { entries: SpinMutex::new(entries), pos: AtomicUsize::new(0) })
    }

    fn next(&self) -> Option<DirEntry> {
        let entries = self.entries.lock();
        let pos = self.pos.fetch_add(1, Ordering::AcqRel);
        entries.get(pos).cloned()
    }

    fn reset(&self, entries: Vec<DirEntry>) {
        *self.entries.lock() = entries;
        self.pos.store(0, Ordering::Release);
    }
}

fn list_cookie(cookie: &IoCookie) -> VfsResult<&ListCookie> {
    cookie
        .downcast_ref::<ListCookie>()
        .ok_or_else(|| vfs_error(ErrorKind::Internal, "foreign listing cookie"))
}

/// Per-open attribute cookie: just the attribute's name.
struct AttrCookie {
    name: String,
}

fn attr_cookie(cookie: &IoCookie) -> VfsResult<&AttrCookie> {
    cookie
        .downcast_ref::<AttrCookie>()
        .ok_or_else(|| vfs_error(ErrorKind::Internal, "foreign attribute cookie"))
}

impl TestVolume {
    fn dir_entries(&self, id: NodeId) -> VfsResult<Vec<DirEntry>> {
        let state = self.state.lock();
        let entity = state
            .entities
            .get(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        if entity.kind != NodeKind::Directory {
            return Err(vfs_error(ErrorKind::NotADirectory, "not a directory"));
        }
        let mut entries = vec![
            DirEntry { id, name: String::from("."), kind: NodeKind::Directory },
            DirEntry { id: entity.parent, name: String::from(".."), kind: NodeKind::Directory },
        ];
        for (name, child_id) in &entity.children {
            let kind = state
                .entities
                .get(child_id)
                .map(|c| c.kind)
                .unwrap_or(NodeKind::Unknown);
            entries.push(DirEntry { id: *child_id, name: name.clone(), kind });
        }
        Ok(entries)
    }

    fn attr_entries(&self, id: NodeId) -> VfsResult<Vec<DirEntry>> {
        let state = self.state.lock();
        let entity = state
            .entities
            .get(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        Ok(entity
            .attrs
            .keys()
            .map(|name| DirEntry { id, name: name.clone(), kind: NodeKind::File })
            .collect())
    }

    fn index_entries(&self) -> Vec<DirEntry> {
        self.state
            .lock()
            .indexes
            .keys()
            .map(|name| DirEntry { id: NodeId(0), name: name.clone(), kind: NodeKind::File })
            .collect()
    }

    /// Exact-name query: every directory entry whose name equals the operand
    /// of a `name == "..."` expression.
    fn query_entries(&self, query: &str) -> VfsResult<Vec<DirEntry>> {
        let wanted = parse_name_query(query)?;
        let state = self.state.lock();
        let mut matches = Vec::new();
        for entity in state.entities.values() {
            for (name, child_id) in &entity.children {
                if name == &wanted {
                    let kind = state
                        .entities
                        .get(child_id)
                        .map(|c| c.kind)
                        .unwrap_or(NodeKind::Unknown);
                    matches.push(DirEntry { id: *child_id, name: name.clone(), kind });
                }
            }
        }
        matches.sort_by_key(|e| e.id.0);
        Ok(matches)
    }
}

fn parse_name_query(query: &str) -> VfsResult<String> {
    let rest = query
        .trim()
        .strip_prefix("name")
        .map(str::trim_start)
        .and_then(|r| r.strip_prefix("==").or_else(|| r.strip_prefix('=')))
        .map(str::trim)
        .ok_or_else(|| vfs_error(ErrorKind::InvalidArgument, "unsupported query expression"))?;
    Ok(rest.trim_matches('"').to_string())
}

impl FilesystemOps for TestVolume {
    fn unmount(&self) {
        log::debug!("testfs volume {} unmounted", self.mount_id);
    }

    fn read_fs_info(&self) -> VfsResult<FsInfo> {
        let state = self.state.lock();
        Ok(FsInfo {
            block_size: 1,
            total_blocks: u64::MAX,
            free_blocks: u64::MAX,
            total_nodes: state.entities.len() as u64,
            free_nodes: u64::MAX,
            volume_name: state.volume_name.clone(),
            fs_name: String::from("testfs"),
        })
    }

    fn write_fs_info(&self, info: &FsInfo, mask: FsInfoMask) -> VfsResult<()> {
        if mask.contains(FsInfoMask::VOLUME_NAME) {
            self.state.lock().volume_name = info.volume_name.clone();
        }
        Ok(())
    }

    fn get_node(&self, id: NodeId) -> VfsResult<(NodePrivate, NodeKind)> {
        let state = self.state.lock();
        let entity = state
            .entities
            .get(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        self.get_nodes.fetch_add(1, Ordering::AcqRel);
        Ok((Arc::new(TestNode { id }), entity.kind))
    }

    fn put_node(&self, _node: &NodePrivate, _reenter: bool) {
        self.put_nodes.fetch_add(1, Ordering::AcqRel);
    }

    fn remove_node(&self, node: &NodePrivate, _reenter: bool) {
        self.removed_nodes.fetch_add(1, Ordering::AcqRel);
        if let Ok(id) = node_id(node) {
            self.state.lock().entities.remove(&id);
        }
    }

    fn lookup(&self, dir: &NodePrivate, name: &str) -> VfsResult<(NodeId, NodeKind)> {
        let dir_id = node_id(dir)?;
        let state = self.state.lock();
        let entity = state
            .entities
            .get(&dir_id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such directory"))?;
        if entity.kind != NodeKind::Directory {
            return Err(vfs_error(ErrorKind::NotADirectory, "not a directory"));
        }
        let child_id = match name {
            "." => dir_id,
            ".." => entity.parent,
            _ => *entity
                .children
                .get(name)
                .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such entry"))?,
        };
        let kind = state
            .entities
            .get(&child_id)
            .map(|c| c.kind)
            .unwrap_or(NodeKind::Unknown);
        Ok((child_id, kind))
    }

    fn create(
        &self,
        dir: &NodePrivate,
        name: &str,
        _flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<(NodeId, IoCookie)> {
        let dir_id = node_id(dir)?;
        let now = self.tick();
        let mut state = self.state.lock();
        let id = self.allocate(&mut state);
        let parent = state
            .entities
            .get_mut(&dir_id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such directory"))?;
        if parent.children.contains_key(name) {
            return Err(vfs_error(ErrorKind::AlreadyExists, "entry already exists"));
        }
        parent.children.insert(name.to_string(), id);
        state
            .entities
            .insert(id, Entity::new(NodeKind::File, mode, dir_id, now));
        Ok((id, Arc::new(()) as IoCookie))
    }

    fn create_dir(&self, dir: &NodePrivate, name: &str, mode: u32) -> VfsResult<()> {
        let dir_id = node_id(dir)?;
        let now = self.tick();
        let mut state = self.state.lock();
        let id = self.allocate(&mut state);
        let parent = state
            .entities
            .get_mut(&dir_id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such directory"))?;
        if parent.children.contains_key(name) {
            return Err(vfs_error(ErrorKind::AlreadyExists, "entry already exists"));
        }
        parent.children.insert(name.to_string(), id);
        parent.link_count += 1;
        let mut entity = Entity::new(NodeKind::Directory, mode, dir_id, now);
        entity.link_count = 2;
        state.entities.insert(id, entity);
        Ok(())
    }

    fn remove_dir(&self, dir: &NodePrivate, name: &str) -> VfsResult<()> {
        let dir_id = node_id(dir)?;
        let mut state = self.state.lock();
        let id = *state
            .entities
            .get(&dir_id)
            .and_then(|p| p.children.get(name))
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such entry"))?;
        let target = state
            .entities
            .get(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        if target.kind != NodeKind::Directory {
            return Err(vfs_error(ErrorKind::NotADirectory, "not a directory"));
        }
        if !target.children.is_empty() {
            return Err(vfs_error(ErrorKind::InvalidArgument, "directory not empty"));
        }
        if let Some(parent) = state.entities.get_mut(&dir_id) {
            parent.children.remove(name);
            parent.link_count = parent.link_count.saturating_sub(1);
        }
        if let Some(target) = state.entities.get_mut(&id) {
            // Directories start at two names ("." and the parent entry).
            target.link_count = target.link_count.saturating_sub(1);
        }
        let orphan = self.drop_name(&mut state, id);
        drop(state);
        if let Some(id) = orphan {
            self.reap(id);
        }
        Ok(())
    }

    fn create_symlink(
        &self,
        dir: &NodePrivate,
        name: &str,
        target: &str,
        mode: u32,
    ) -> VfsResult<()> {
        let dir_id = node_id(dir)?;
        let now = self.tick();
        let mut state = self.state.lock();
        let id = self.allocate(&mut state);
        let parent = state
            .entities
            .get_mut(&dir_id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such directory"))?;
        if parent.children.contains_key(name) {
            return Err(vfs_error(ErrorKind::AlreadyExists, "entry already exists"));
        }
        parent.children.insert(name.to_string(), id);
        let mut entity = Entity::new(NodeKind::SymbolicLink, mode, dir_id, now);
        entity.data = target.as_bytes().to_vec();
        state.entities.insert(id, entity);
        Ok(())
    }

    fn read_symlink(&self, node: &NodePrivate) -> VfsResult<String> {
        let id = node_id(node)?;
        let state = self.state.lock();
        let entity = state
            .entities
            .get(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        if entity.kind != NodeKind::SymbolicLink {
            return Err(vfs_error(ErrorKind::InvalidArgument, "not a symbolic link"));
        }
        String::from_utf8(entity.data.clone())
            .map_err(|_| vfs_error(ErrorKind::Io, "symbolic link target is not utf-8"))
    }

    fn link(&self, dir: &NodePrivate, name: &str, node: &NodePrivate) -> VfsResult<()> {
        let dir_id = node_id(dir)?;
        let target_id = node_id(node)?;
        let mut state = self.state.lock();
        if !state.entities.contains_key(&target_id) {
            return Err(vfs_error(ErrorKind::NotFound, "no such node"));
        }
        let parent = state
            .entities
            .get_mut(&dir_id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such directory"))?;
        if parent.children.contains_key(name) {
            return Err(vfs_error(ErrorKind::AlreadyExists, "entry already exists"));
        }
        parent.children.insert(name.to_string(), target_id);
        if let Some(target) = state.entities.get_mut(&target_id) {
            target.link_count += 1;
        }
        Ok(())
    }

    fn unlink(&self, dir: &NodePrivate, name: &str) -> VfsResult<()> {
        let dir_id = node_id(dir)?;
        let mut state = self.state.lock();
        let id = *state
            .entities
            .get(&dir_id)
            .and_then(|p| p.children.get(name))
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such entry"))?;
        if state.entities.get(&id).map(|e| e.kind) == Some(NodeKind::Directory) {
            return Err(vfs_error(ErrorKind::IsADirectory, "cannot unlink a directory"));
        }
        if let Some(parent) = state.entities.get_mut(&dir_id) {
            parent.children.remove(name);
        }
        let orphan = self.drop_name(&mut state, id);
        drop(state);
        if let Some(id) = orphan {
            self.reap(id);
        }
        Ok(())
    }

    fn rename(
        &self,
        from_dir: &NodePrivate,
        from_name: &str,
        to_dir: &NodePrivate,
        to_name: &str,
    ) -> VfsResult<()> {
        let from_id = node_id(from_dir)?;
        let to_id = node_id(to_dir)?;
        let mut state = self.state.lock();
        let moved = *state
            .entities
            .get(&from_id)
            .and_then(|p| p.children.get(from_name))
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such entry"))?;
        let replaced = state
            .entities
            .get(&to_id)
            .and_then(|p| p.children.get(to_name))
            .copied();
        if replaced == Some(moved) {
            return Ok(());
        }
        let mut orphan = None;
        if let Some(replaced) = replaced {
            if state.entities.get(&replaced).map(|e| e.kind) == Some(NodeKind::Directory) {
                return Err(vfs_error(ErrorKind::IsADirectory, "target is a directory"));
            }
            if let Some(target_parent) = state.entities.get_mut(&to_id) {
                target_parent.children.remove(to_name);
            }
            orphan = self.drop_name(&mut state, replaced);
        }
        if let Some(source_parent) = state.entities.get_mut(&from_id) {
            source_parent.children.remove(from_name);
        }
        if let Some(target_parent) = state.entities.get_mut(&to_id) {
            target_parent.children.insert(to_name.to_string(), moved);
        }
        if let Some(entity) = state.entities.get_mut(&moved) {
            entity.parent = to_id;
        }
        drop(state);
        if let Some(id) = orphan {
            self.reap(id);
        }
        Ok(())
    }

    fn read_stat(&self, node: &NodePrivate) -> VfsResult<Stat> {
        let id = node_id(node)?;
        let state = self.state.lock();
        let entity = state
            .entities
            .get(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        Ok(Stat {
            device: 0,
            node: 0,
            kind: entity.kind,
            mode: entity.mode,
            uid: 0,
            gid: 0,
            size: if entity.kind == NodeKind::Directory { 0 } else { entity.data.len() as u64 },
            link_count: entity.link_count,
            created_time: entity.created,
            modified_time: entity.modified,
            accessed_time: entity.modified,
        })
    }

    fn write_stat(&self, node: &NodePrivate, stat: &Stat, mask: StatMask) -> VfsResult<()> {
        let id = node_id(node)?;
        let mut state = self.state.lock();
        let entity = state
            .entities
            .get_mut(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        if mask.contains(StatMask::MODE) {
            entity.mode = stat.mode;
        }
        if mask.contains(StatMask::SIZE) {
            entity.data.resize(stat.size as usize, 0);
        }
        if mask.contains(StatMask::CREATED_TIME) {
            entity.created = stat.created_time;
        }
        if mask.contains(StatMask::MODIFIED_TIME) {
            entity.modified = stat.modified_time;
        }
        Ok(())
    }

    fn open(&self, node: &NodePrivate, flags: OpenFlags) -> VfsResult<IoCookie> {
        let id = node_id(node)?;
        let mut state = self.state.lock();
        let entity = state
            .entities
            .get_mut(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        if flags.contains(OpenFlags::TRUNCATE) && flags.writable() {
            entity.data.clear();
        }
        Ok(Arc::new(()) as IoCookie)
    }

    fn read(
        &self,
        node: &NodePrivate,
        _cookie: &IoCookie,
        pos: u64,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        let id = node_id(node)?;
        let state = self.state.lock();
        let entity = state
            .entities
            .get(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        let pos = pos.min(entity.data.len() as u64) as usize;
        let available = &entity.data[pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn write(
        &self,
        node: &NodePrivate,
        _cookie: &IoCookie,
        pos: u64,
        buf: &[u8],
    ) -> VfsResult<usize> {
        let id = node_id(node)?;
        let now = self.tick();
        let mut state = self.state.lock();
        let entity = state
            .entities
            .get_mut(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        let pos = pos as usize;
        let end = pos + buf.len();
        if entity.data.len() < end {
            entity.data.resize(end, 0);
        }
        entity.data[pos..end].copy_from_slice(buf);
        entity.modified = now;
        Ok(buf.len())
    }

    fn ioctl(
        &self,
        _node: &NodePrivate,
        _cookie: &IoCookie,
        op: u32,
        arg: &mut [u8],
    ) -> VfsResult<()> {
        match op {
            IOCTL_FILL => {
                arg.fill(0x5a);
                Ok(())
            }
            _ => Err(vfs_error(ErrorKind::InvalidArgument, "unknown ioctl op")),
        }
    }

    fn open_dir(&self, node: &NodePrivate) -> VfsResult<IoCookie> {
        let entries = self.dir_entries(node_id(node)?)?;
        Ok(ListCookie::new(entries) as IoCookie)
    }

    fn read_dir(&self, _node: &NodePrivate, cookie: &IoCookie) -> VfsResult<Option<DirEntry>> {
        Ok(list_cookie(cookie)?.next())
    }

    fn rewind_dir(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<()> {
        let entries = self.dir_entries(node_id(node)?)?;
        list_cookie(cookie)?.reset(entries);
        Ok(())
    }

    // --- attributes ---

    fn open_attr_dir(&self, node: &NodePrivate) -> VfsResult<IoCookie> {
        let entries = self.attr_entries(node_id(node)?)?;
        Ok(ListCookie::new(entries) as IoCookie)
    }

    fn read_attr_dir(&self, _node: &NodePrivate, cookie: &IoCookie) -> VfsResult<Option<DirEntry>> {
        Ok(list_cookie(cookie)?.next())
    }

    fn rewind_attr_dir(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<()> {
        let entries = self.attr_entries(node_id(node)?)?;
        list_cookie(cookie)?.reset(entries);
        Ok(())
    }

    fn create_attr(
        &self,
        node: &NodePrivate,
        name: &str,
        type_code: u32,
        _flags: OpenFlags,
    ) -> VfsResult<IoCookie> {
        let id = node_id(node)?;
        let mut state = self.state.lock();
        let entity = state
            .entities
            .get_mut(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        entity
            .attrs
            .insert(name.to_string(), Attr { type_code, data: Vec::new() });
        Ok(Arc::new(AttrCookie { name: name.to_string() }) as IoCookie)
    }

    fn open_attr(&self, node: &NodePrivate, name: &str, _flags: OpenFlags) -> VfsResult<IoCookie> {
        let id = node_id(node)?;
        let state = self.state.lock();
        let entity = state
            .entities
            .get(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        if !entity.attrs.contains_key(name) {
            return Err(vfs_error(ErrorKind::NotFound, "no such attribute"));
        }
        Ok(Arc::new(AttrCookie { name: name.to_string() }) as IoCookie)
    }

    fn read_attr(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        pos: u64,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        let id = node_id(node)?;
        let name = &attr_cookie(cookie)?.name;
        let state = self.state.lock();
        let attr = state
            .entities
            .get(&id)
            .and_then(|e| e.attrs.get(name))
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such attribute"))?;
        let pos = pos.min(attr.data.len() as u64) as usize;
        let available = &attr.data[pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn write_attr(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        pos: u64,
        buf: &[u8],
    ) -> VfsResult<usize> {
        let id = node_id(node)?;
        let name = attr_cookie(cookie)?.name.clone();
        let mut state = self.state.lock();
        let attr = state
            .entities
            .get_mut(&id)
            .and_then(|e| e.attrs.get_mut(&name))
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such attribute"))?;
        let pos = pos as usize;
        let end = pos + buf.len();
        if attr.data.len() < end {
            attr.data.resize(end, 0);
        }
        attr.data[pos..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn read_attr_stat(&self, node: &NodePrivate, cookie: &IoCookie) -> VfsResult<AttrInfo> {
        let id = node_id(node)?;
        let name = &attr_cookie(cookie)?.name;
        let state = self.state.lock();
        let attr = state
            .entities
            .get(&id)
            .and_then(|e| e.attrs.get(name))
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such attribute"))?;
        Ok(AttrInfo { size: attr.data.len() as u64, type_code: attr.type_code })
    }

    fn write_attr_stat(
        &self,
        node: &NodePrivate,
        cookie: &IoCookie,
        info: &AttrInfo,
    ) -> VfsResult<()> {
        let id = node_id(node)?;
        let name = attr_cookie(cookie)?.name.clone();
        let mut state = self.state.lock();
        let attr = state
            .entities
            .get_mut(&id)
            .and_then(|e| e.attrs.get_mut(&name))
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such attribute"))?;
        // The type code is fixed at creation; only the size is writable.
        attr.data.resize(info.size as usize, 0);
        Ok(())
    }

    fn remove_attr(&self, node: &NodePrivate, name: &str) -> VfsResult<()> {
        let id = node_id(node)?;
        let mut state = self.state.lock();
        let entity = state
            .entities
            .get_mut(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        entity
            .attrs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such attribute"))
    }

    fn rename_attr(&self, node: &NodePrivate, from_name: &str, to_name: &str) -> VfsResult<()> {
        let id = node_id(node)?;
        let mut state = self.state.lock();
        let entity = state
            .entities
            .get_mut(&id)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such node"))?;
        let attr = entity
            .attrs
            .remove(from_name)
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such attribute"))?;
        entity.attrs.insert(to_name.to_string(), attr);
        Ok(())
    }

    // --- indexes ---

    fn open_index_dir(&self) -> VfsResult<IoCookie> {
        Ok(ListCookie::new(self.index_entries()) as IoCookie)
    }

    fn read_index_dir(&self, cookie: &IoCookie) -> VfsResult<Option<DirEntry>> {
        Ok(list_cookie(cookie)?.next())
    }

    fn rewind_index_dir(&self, cookie: &IoCookie) -> VfsResult<()> {
        list_cookie(cookie)?.reset(self.index_entries());
        Ok(())
    }

    fn create_index(&self, name: &str, type_code: u32) -> VfsResult<()> {
        let mut state = self.state.lock();
        if state.indexes.contains_key(name) {
            return Err(vfs_error(ErrorKind::AlreadyExists, "index already exists"));
        }
        state.indexes.insert(name.to_string(), type_code);
        Ok(())
    }

    fn remove_index(&self, name: &str) -> VfsResult<()> {
        self.state
            .lock()
            .indexes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such index"))
    }

    fn read_index_stat(&self, name: &str) -> VfsResult<AttrInfo> {
        self.state
            .lock()
            .indexes
            .get(name)
            .map(|type_code| AttrInfo { size: 0, type_code: *type_code })
            .ok_or_else(|| vfs_error(ErrorKind::NotFound, "no such index"))
    }

    // --- queries ---

    fn open_query(&self, query: &str, _flags: u32) -> VfsResult<IoCookie> {
        Ok(ListCookie::new(self.query_entries(query)?) as IoCookie)
    }

    fn read_query(&self, cookie: &IoCookie) -> VfsResult<Option<DirEntry>> {
        Ok(list_cookie(cookie)?.next())
    }

    fn rewind_query(&self, cookie: &IoCookie) -> VfsResult<()> {
        let entries = list_cookie(cookie)?;
        entries.pos.store(0, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_query_parsing() {
        assert_eq!(parse_name_query("name == \"report\"").unwrap(), "report");
        assert_eq!(parse_name_query("name=draft").unwrap(), "draft");
        assert!(parse_name_query("size > 4").is_err());
    }
}
