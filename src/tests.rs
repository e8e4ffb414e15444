//! End-to-end tests driving the whole layer through the in-memory test
//! driver: lifecycle reference counting, resolution, mount orchestration,
//! descriptor dispatch and advisory locking.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::io_context::IoContext;
use crate::testfs::{TestFs, IOCTL_FILL};
use crate::types::{
    AttrInfo, GlobalNodeId, LockOwner, MemoryPressure, MountFlags, MountId, NodeId, NodeKind,
    OpenFlags, SeekFrom, Stat, StatMask, UnmountFlags, VfsOptions,
};
use crate::vfs::Vfs;

fn setup() -> (Arc<Vfs>, Arc<IoContext>, Arc<TestFs>, MountId) {
    setup_with(VfsOptions::default())
}

fn setup_with(options: VfsOptions) -> (Arc<Vfs>, Arc<IoContext>, Arc<TestFs>, MountId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let vfs = Vfs::with_options(options);
    let driver = TestFs::new();
    vfs.register_driver(driver.clone()).unwrap();
    let mount_id = vfs
        .mount("/", "testfs", None, None, MountFlags::empty())
        .unwrap();
    let ctx = vfs.create_io_context();
    (vfs, ctx, driver, mount_id)
}

fn write_file(vfs: &Vfs, ctx: &Arc<IoContext>, path: &str, content: &[u8]) {
    let fd = vfs
        .open(ctx, path, OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE, 0o644)
        .unwrap();
    vfs.write(ctx, fd, content).unwrap();
    vfs.close(ctx, fd).unwrap();
}

#[test]
fn repeated_get_shares_one_entry() {
    let (vfs, ctx, driver, mount_id) = setup();
    write_file(&vfs, &ctx, "/f", b"x");
    let id = NodeId(vfs.read_stat(&ctx, "/f", true).unwrap().node);
    let volume = driver.volume().unwrap();
    // Evict the cached entry so the first acquisition goes to the driver.
    vfs.low_memory(MemoryPressure::Critical);
    let gets_before = volume.get_node_calls();

    let first = vfs.get_node(mount_id, id).unwrap();
    let second = vfs.get_node(mount_id, id).unwrap();
    assert_eq!(first.vnode().ref_count(), 2);
    assert!(first.same_node(second.vnode()));
    // Only the first acquisition went through the driver.
    assert_eq!(volume.get_node_calls(), gets_before + 1);

    let gid = GlobalNodeId { mount: mount_id, node: id };
    let puts_before = volume.put_node_calls();
    drop(first);
    drop(second);
    // Both references released: parked on the unused list, not freed.
    assert!(vfs.nodes().contains(gid));
    assert_eq!(volume.put_node_calls(), puts_before);
    assert!(vfs.unused_node_count() >= 1);
}

#[test]
fn dot_dot_and_direct_paths_agree() {
    let (vfs, ctx, _driver, _) = setup();
    vfs.create_dir(&ctx, "/a", 0o755).unwrap();
    vfs.create_dir(&ctx, "/a/b", 0o755).unwrap();
    vfs.create_dir(&ctx, "/a/c", 0o755).unwrap();

    let indirect = vfs.node_for_path(&ctx, "/a/b/../c").unwrap();
    let direct = vfs.node_for_path(&ctx, "/a/c").unwrap();
    assert_eq!(indirect.id(), direct.id());
}

#[test]
fn mounting_over_a_mount_root_fails_busy() {
    let (vfs, ctx, _driver, _) = setup();
    vfs.create_dir(&ctx, "/mnt", 0o755).unwrap();
    vfs.mount("/mnt", "testfs", None, None, MountFlags::empty())
        .unwrap();
    let err = vfs
        .mount("/mnt", "testfs", None, None, MountFlags::empty())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);
}

#[test]
fn conflicting_nonblocking_lock_would_block() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/locked", b"0123456789abcdef");
    let fd = vfs.open(&ctx, "/locked", OpenFlags::READ, 0).unwrap();

    vfs.lock(&ctx, fd, LockOwner::Process(1), Some((0, 10)), false, false)
        .unwrap();
    let err = vfs
        .lock(&ctx, fd, LockOwner::Process(2), Some((5, 15)), false, false)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::WouldBlock);

    // Disjoint range and same owner are both fine.
    vfs.lock(&ctx, fd, LockOwner::Process(2), Some((10, 15)), false, false)
        .unwrap();
    vfs.lock(&ctx, fd, LockOwner::Process(1), Some((5, 10)), false, false)
        .unwrap();
}

#[test]
fn shared_locks_overlap_across_owners() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/shared", b"data");
    let fd = vfs.open(&ctx, "/shared", OpenFlags::READ, 0).unwrap();
    vfs.lock(&ctx, fd, LockOwner::Process(1), Some((0, 10)), true, false)
        .unwrap();
    vfs.lock(&ctx, fd, LockOwner::Process(2), Some((5, 15)), true, false)
        .unwrap();
    let blocker = vfs
        .test_lock(&ctx, fd, LockOwner::Process(3), Some((0, 4)), false)
        .unwrap();
    assert!(blocker.is_some());
}

#[test]
fn blocked_lock_wakes_on_release() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/w", b"data");
    let fd = vfs.open(&ctx, "/w", OpenFlags::READ, 0).unwrap();
    vfs.lock(&ctx, fd, LockOwner::Process(1), None, false, false)
        .unwrap();

    let waiter = {
        let vfs = Arc::clone(&vfs);
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || vfs.lock(&ctx, fd, LockOwner::Process(2), None, false, true))
    };
    thread::sleep(Duration::from_millis(50));
    vfs.unlock(&ctx, fd, LockOwner::Process(1), None).unwrap();
    waiter.join().unwrap().unwrap();
}

#[test]
fn bounded_lock_wait_times_out() {
    let options = VfsOptions {
        lock_wait_timeout: Some(Duration::from_millis(30)),
        ..VfsOptions::default()
    };
    let (vfs, ctx, _driver, _) = setup_with(options);
    write_file(&vfs, &ctx, "/t", b"data");
    let fd = vfs.open(&ctx, "/t", OpenFlags::READ, 0).unwrap();
    vfs.lock(&ctx, fd, LockOwner::Process(1), None, false, false)
        .unwrap();
    let err = vfs
        .lock(&ctx, fd, LockOwner::Process(2), None, false, true)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Interrupted);
}

#[test]
fn file_io_round_trip_and_stat_stamping() {
    let (vfs, ctx, _driver, mount_id) = setup();
    let fd = vfs
        .open(&ctx, "/data", OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE, 0o644)
        .unwrap();
    assert_eq!(vfs.write(&ctx, fd, b"hello world").unwrap(), 11);
    assert_eq!(vfs.seek(&ctx, fd, SeekFrom::Start(6)).unwrap(), 6);
    let mut buf = [0u8; 16];
    let n = vfs.read(&ctx, fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"world");

    let stat = vfs.fstat(&ctx, fd).unwrap();
    assert_eq!(stat.size, 11);
    assert_eq!(stat.kind, NodeKind::File);
    // Identifier stamping: the driver reported zeros.
    assert_eq!(stat.device, mount_id.0);
    assert_ne!(stat.node, 0);
    vfs.close(&ctx, fd).unwrap();
}

#[test]
fn append_writes_at_end_regardless_of_position() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/log", b"one");
    let fd = vfs
        .open(&ctx, "/log", OpenFlags::WRITE | OpenFlags::APPEND, 0)
        .unwrap();
    vfs.seek(&ctx, fd, SeekFrom::Start(0)).unwrap();
    vfs.write(&ctx, fd, b"two").unwrap();
    vfs.close(&ctx, fd).unwrap();
    assert_eq!(vfs.read_stat(&ctx, "/log", true).unwrap().size, 6);
}

#[test]
fn ioctl_dispatches_to_driver() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/dev", b"");
    let fd = vfs.open(&ctx, "/dev", OpenFlags::READ, 0).unwrap();
    let mut arg = [0u8; 4];
    vfs.ioctl(&ctx, fd, IOCTL_FILL, &mut arg).unwrap();
    assert_eq!(arg, [0x5a; 4]);
    let err = vfs.ioctl(&ctx, fd, 0xdead, &mut arg).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}

#[test]
fn symlinks_resolve_and_loops_are_bounded() {
    let (vfs, ctx, _driver, _) = setup();
    vfs.create_dir(&ctx, "/a", 0o755).unwrap();
    write_file(&vfs, &ctx, "/a/target", b"payload");
    vfs.create_symlink(&ctx, "/link", "/a/target", 0o777).unwrap();
    vfs.create_symlink(&ctx, "/rel", "a/target", 0o777).unwrap();

    assert_eq!(vfs.read_stat(&ctx, "/link", true).unwrap().size, 7);
    assert_eq!(vfs.read_stat(&ctx, "/rel", true).unwrap().size, 7);
    // Untraversed, the leaf is the link itself.
    let stat = vfs.read_stat(&ctx, "/link", false).unwrap();
    assert_eq!(stat.kind, NodeKind::SymbolicLink);
    assert_eq!(vfs.read_symlink(&ctx, "/link").unwrap(), "/a/target");

    vfs.create_symlink(&ctx, "/x", "/y", 0o777).unwrap();
    vfs.create_symlink(&ctx, "/y", "/x", 0o777).unwrap();
    let err = vfs.read_stat(&ctx, "/x", true).unwrap_err();
    assert_eq!(err.kind, ErrorKind::LinkLimit);
}

#[test]
fn path_reconstruction_inverts_resolution() {
    let (vfs, ctx, _driver, _) = setup();
    vfs.create_dir(&ctx, "/a", 0o755).unwrap();
    vfs.create_dir(&ctx, "/a/b", 0o755).unwrap();
    let node = vfs.node_for_path(&ctx, "/a/b").unwrap();
    // testfs has no get_node_name hook, so this exercises the parent scan.
    assert_eq!(vfs.path_for_node(&node).unwrap(), "/a/b");

    // Files cannot answer a ".." lookup; reconstruction goes through the
    // recorded parent directory instead.
    write_file(&vfs, &ctx, "/a/b/leaf", b"x");
    let file = vfs.node_for_path(&ctx, "/a/b/leaf").unwrap();
    assert_eq!(vfs.path_for_node(&file).unwrap(), "/a/b/leaf");

    vfs.set_cwd(&ctx, "/a/b").unwrap();
    assert_eq!(vfs.get_cwd(&ctx).unwrap(), "/a/b");
    // Relative resolution now starts at the working directory.
    write_file(&vfs, &ctx, "file", b"1");
    assert!(vfs.read_stat(&ctx, "/a/b/file", true).is_ok());
}

#[test]
fn mount_crossing_works_in_both_directions() {
    let (vfs, ctx, _driver, root_mount) = setup();
    vfs.create_dir(&ctx, "/mnt", 0o755).unwrap();
    let sub_mount = vfs
        .mount("/mnt", "testfs", None, None, MountFlags::empty())
        .unwrap();

    // Downward: the path lands on the mounted volume.
    write_file(&vfs, &ctx, "/mnt/inner", b"abc");
    let node = vfs.node_for_path(&ctx, "/mnt/inner").unwrap();
    assert_eq!(node.mount_id(), sub_mount);

    // Upward: ".." at the volume root escapes to the covered directory's
    // parent, and reconstruction hops the cover link.
    let up = vfs.node_for_path(&ctx, "/mnt/..").unwrap();
    assert_eq!(up.mount_id(), root_mount);
    assert_eq!(vfs.path_for_node(&node).unwrap(), "/mnt/inner");

    let root_of_sub = vfs.node_for_path(&ctx, "/mnt").unwrap();
    assert_eq!(vfs.path_for_node(&root_of_sub).unwrap(), "/mnt");
}

#[test]
fn unmount_busy_until_descriptors_close() {
    let (vfs, ctx, driver, _) = setup();
    vfs.create_dir(&ctx, "/mnt", 0o755).unwrap();
    vfs.mount("/mnt", "testfs", None, None, MountFlags::empty())
        .unwrap();
    let volume = driver.volume().unwrap();

    let fd = vfs
        .open(&ctx, "/mnt/busy", OpenFlags::CREATE | OpenFlags::WRITE, 0o644)
        .unwrap();
    let err = vfs.unmount("/mnt", UnmountFlags::empty()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);
    assert_eq!(vfs.mount_count(), 2);

    vfs.close(&ctx, fd).unwrap();
    vfs.unmount("/mnt", UnmountFlags::empty()).unwrap();
    assert_eq!(vfs.mount_count(), 1);
    // Every node acquisition was balanced by a driver release.
    assert_eq!(
        volume.get_node_calls(),
        volume.put_node_calls() + volume.removed_node_calls()
    );
    // The covered directory is reachable again.
    assert!(vfs.read_stat(&ctx, "/mnt", true).is_ok());
}

#[test]
fn forced_unmount_disconnects_descriptors() {
    let (vfs, ctx, _driver, _) = setup();
    vfs.create_dir(&ctx, "/mnt", 0o755).unwrap();
    vfs.mount("/mnt", "testfs", None, None, MountFlags::empty())
        .unwrap();
    write_file(&vfs, &ctx, "/mnt/f", b"data");
    let fd = vfs.open(&ctx, "/mnt/f", OpenFlags::READ, 0).unwrap();

    vfs.unmount("/mnt", UnmountFlags::FORCE).unwrap();
    assert_eq!(vfs.mount_count(), 1);

    let mut buf = [0u8; 4];
    let err = vfs.read(&ctx, fd, &mut buf).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Stale);
    let err = vfs.fstat(&ctx, fd).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Stale);
    // Closing a disconnected descriptor just releases the slot.
    vfs.close(&ctx, fd).unwrap();
}

#[test]
fn root_unmount_requires_context_exit() {
    let (vfs, ctx, driver, _) = setup();
    write_file(&vfs, &ctx, "/f", b"1");
    let volume = driver.volume().unwrap();

    // The context's working directory pins the root node.
    let err = vfs.unmount("/", UnmountFlags::empty()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);

    vfs.exit_io_context(&ctx);
    vfs.unmount("/", UnmountFlags::empty()).unwrap();
    assert_eq!(vfs.mount_count(), 0);
    assert_eq!(
        volume.get_node_calls(),
        volume.put_node_calls() + volume.removed_node_calls()
    );
}

#[test]
fn unused_list_is_bounded_and_reclaimable() {
    let options = VfsOptions { max_unused_nodes: 4, ..VfsOptions::default() };
    let (vfs, ctx, driver, _) = setup_with(options);
    for i in 0..10 {
        write_file(&vfs, &ctx, &format!("/f{i}"), b"x");
    }
    for i in 0..10 {
        vfs.read_stat(&ctx, &format!("/f{i}"), true).unwrap();
    }
    assert!(vfs.unused_node_count() <= 4);
    let volume = driver.volume().unwrap();
    assert!(volume.put_node_calls() > 0);

    let freed = vfs.low_memory(MemoryPressure::Critical);
    assert!(freed > 0);
    assert_eq!(vfs.unused_node_count(), 0);
    // Everything is still re-acquirable through the driver.
    assert!(vfs.read_stat(&ctx, "/f0", true).is_ok());
}

#[test]
fn partial_low_memory_pressure_frees_a_share() {
    let options = VfsOptions { max_unused_nodes: 16, ..VfsOptions::default() };
    let (vfs, ctx, _driver, _) = setup_with(options);
    for i in 0..8 {
        write_file(&vfs, &ctx, &format!("/f{i}"), b"x");
        vfs.read_stat(&ctx, &format!("/f{i}"), true).unwrap();
    }
    let before = vfs.unused_node_count();
    let freed = vfs.low_memory(MemoryPressure::Low);
    assert_eq!(freed, before.div_ceil(4));
}

#[test]
fn unlink_while_open_defers_node_removal() {
    let (vfs, ctx, driver, _) = setup();
    let fd = vfs
        .open(&ctx, "/doomed", OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE, 0o644)
        .unwrap();
    vfs.write(&ctx, fd, b"still readable").unwrap();
    let volume = driver.volume().unwrap();
    let entities_before = volume.entity_count();

    vfs.unlink(&ctx, "/doomed").unwrap();
    assert_eq!(
        vfs.read_stat(&ctx, "/doomed", true).unwrap_err().kind,
        ErrorKind::NotFound
    );
    // The entity survives while the descriptor holds its node.
    assert_eq!(volume.entity_count(), entities_before);
    vfs.seek(&ctx, fd, SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(vfs.read(&ctx, fd, &mut buf).unwrap(), 14);

    vfs.close(&ctx, fd).unwrap();
    assert_eq!(volume.removed_node_calls(), 1);
    assert_eq!(volume.entity_count(), entities_before - 1);
}

#[test]
fn hard_links_share_a_node() {
    let (vfs, ctx, _driver, _) = setup();
    vfs.create_dir(&ctx, "/a", 0o755).unwrap();
    write_file(&vfs, &ctx, "/orig", b"shared");
    vfs.link(&ctx, "/orig", "/a/alias").unwrap();

    let orig = vfs.read_stat(&ctx, "/orig", true).unwrap();
    let alias = vfs.read_stat(&ctx, "/a/alias", true).unwrap();
    assert_eq!(orig.node, alias.node);
    assert_eq!(alias.link_count, 2);

    vfs.unlink(&ctx, "/orig").unwrap();
    assert_eq!(vfs.read_stat(&ctx, "/a/alias", true).unwrap().size, 6);

    let err = vfs.link(&ctx, "/a", "/dirlink").unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
}

#[test]
fn rename_moves_between_directories() {
    let (vfs, ctx, _driver, _) = setup();
    vfs.create_dir(&ctx, "/a", 0o755).unwrap();
    write_file(&vfs, &ctx, "/old", b"contents");
    vfs.rename(&ctx, "/old", "/a/new").unwrap();
    assert_eq!(
        vfs.read_stat(&ctx, "/old", true).unwrap_err().kind,
        ErrorKind::NotFound
    );
    assert_eq!(vfs.read_stat(&ctx, "/a/new", true).unwrap().size, 8);
    assert_eq!(vfs.path_for_node(&vfs.node_for_path(&ctx, "/a/new").unwrap()).unwrap(), "/a/new");
}

#[test]
fn directory_listing_and_type_mismatch() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/one", b"1");
    write_file(&vfs, &ctx, "/two", b"2");

    let dirfd = vfs.open_dir(&ctx, "/").unwrap();
    let mut names = Vec::new();
    while let Some(entry) = vfs.read_dir(&ctx, dirfd).unwrap() {
        names.push(entry.name);
    }
    assert!(names.contains(&String::from(".")));
    assert!(names.contains(&String::from("one")));
    assert!(names.contains(&String::from("two")));

    vfs.rewind_dir(&ctx, dirfd).unwrap();
    assert!(vfs.read_dir(&ctx, dirfd).unwrap().is_some());

    // Wrong-type dispatch fails without touching the driver.
    let mut buf = [0u8; 4];
    assert_eq!(
        vfs.read(&ctx, dirfd, &mut buf).unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
    let filefd = vfs.open(&ctx, "/one", OpenFlags::READ, 0).unwrap();
    assert_eq!(
        vfs.read_dir(&ctx, filefd).unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
}

#[test]
fn create_exclusive_and_truncate() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/f", b"0123456789");
    let err = vfs
        .open(&ctx, "/f", OpenFlags::CREATE | OpenFlags::EXCLUSIVE | OpenFlags::WRITE, 0o644)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyExists);

    let fd = vfs
        .open(&ctx, "/f", OpenFlags::WRITE | OpenFlags::TRUNCATE, 0)
        .unwrap();
    vfs.close(&ctx, fd).unwrap();
    assert_eq!(vfs.read_stat(&ctx, "/f", true).unwrap().size, 0);
}

#[test]
fn descriptor_table_exhaustion_rolls_back_creation() {
    let options = VfsOptions { descriptor_table_size: 2, ..VfsOptions::default() };
    let (vfs, ctx, _driver, _) = setup_with(options);
    let a = vfs.open(&ctx, "/a", OpenFlags::CREATE | OpenFlags::WRITE, 0o644).unwrap();
    let b = vfs.open(&ctx, "/b", OpenFlags::CREATE | OpenFlags::WRITE, 0o644).unwrap();
    let err = vfs
        .open(&ctx, "/c", OpenFlags::CREATE | OpenFlags::WRITE, 0o644)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::DescriptorTableFull);
    // The failed creation left no leaf behind.
    assert_eq!(
        vfs.read_stat(&ctx, "/c", true).unwrap_err().kind,
        ErrorKind::NotFound
    );
    vfs.close(&ctx, a).unwrap();
    vfs.close(&ctx, b).unwrap();
    assert!(vfs.open(&ctx, "/c", OpenFlags::CREATE | OpenFlags::WRITE, 0o644).is_ok());
}

#[test]
fn cloexec_descriptors_close_on_exec() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/f", b"1");
    let keep = vfs.open(&ctx, "/f", OpenFlags::READ, 0).unwrap();
    let lose = vfs
        .open(&ctx, "/f", OpenFlags::READ | OpenFlags::CLOEXEC, 0)
        .unwrap();
    assert!(ctx.is_cloexec(lose).unwrap());
    assert!(!ctx.is_cloexec(keep).unwrap());

    vfs.exec_cleanup(&ctx);
    assert_eq!(vfs.fstat(&ctx, lose).unwrap_err().kind, ErrorKind::BadDescriptor);
    assert!(vfs.fstat(&ctx, keep).is_ok());
}

#[test]
fn dup_survives_close_of_original() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/f", b"abc");
    let fd = vfs.open(&ctx, "/f", OpenFlags::READ, 0).unwrap();
    let dup = vfs.dup(&ctx, fd).unwrap();

    vfs.close(&ctx, fd).unwrap();
    let mut buf = [0u8; 8];
    let n = vfs.read(&ctx, dup, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"abc");

    vfs.close(&ctx, dup).unwrap();
    assert_eq!(
        vfs.read(&ctx, dup, &mut buf).unwrap_err().kind,
        ErrorKind::BadDescriptor
    );
}

#[test]
fn dup_shares_the_file_position() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/f", b"abcdef");
    let fd = vfs.open(&ctx, "/f", OpenFlags::READ, 0).unwrap();
    let dup = vfs.dup(&ctx, fd).unwrap();
    let mut buf = [0u8; 3];
    vfs.read(&ctx, fd, &mut buf).unwrap();
    let n = vfs.read(&ctx, dup, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"def");
}

#[test]
fn descriptor_relative_and_null_paths() {
    let (vfs, ctx, _driver, _) = setup();
    vfs.create_dir(&ctx, "/a", 0o755).unwrap();
    vfs.create_dir(&ctx, "/a/b", 0o755).unwrap();
    write_file(&vfs, &ctx, "/a/b/f", b"rel");
    write_file(&vfs, &ctx, "/top", b"absolute");
    let dirfd = vfs.open_dir(&ctx, "/a").unwrap();

    // A relative path resolves against the descriptor's directory.
    assert_eq!(
        vfs.read_stat_at(&ctx, Some(dirfd), Some("b/f"), true).unwrap().size,
        3
    );
    let fd = vfs
        .open_at(&ctx, Some(dirfd), Some("b/f"), OpenFlags::READ, 0)
        .unwrap();
    let mut buf = [0u8; 8];
    let n = vfs.read(&ctx, fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"rel");
    vfs.close(&ctx, fd).unwrap();

    // An absolute path ignores the descriptor.
    assert_eq!(
        vfs.read_stat_at(&ctx, Some(dirfd), Some("/top"), true).unwrap().size,
        8
    );

    // No path at all operates on the open node itself.
    let stat = vfs.read_stat_at(&ctx, Some(dirfd), None, true).unwrap();
    assert_eq!(stat.kind, NodeKind::Directory);

    // Creation and unlinking work through the pair as well.
    let fd = vfs
        .open_at(
            &ctx,
            Some(dirfd),
            Some("b/new"),
            OpenFlags::CREATE | OpenFlags::WRITE,
            0o644,
        )
        .unwrap();
    vfs.close(&ctx, fd).unwrap();
    assert!(vfs.read_stat(&ctx, "/a/b/new", true).is_ok());
    vfs.unlink_at(&ctx, Some(dirfd), "b/new").unwrap();
    assert_eq!(
        vfs.read_stat(&ctx, "/a/b/new", true).unwrap_err().kind,
        ErrorKind::NotFound
    );

    // Neither a descriptor nor a path is an error.
    assert_eq!(
        vfs.read_stat_at(&ctx, None, None, true).unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
}

#[test]
fn acquiring_an_unpublished_node_waits_for_publication() {
    let (vfs, _ctx, _driver, mount_id) = setup();
    let id = NodeId(4242);
    let node = vfs
        .register_node(mount_id, id, Arc::new(()), NodeKind::File)
        .unwrap();

    let waiter = {
        let vfs = Arc::clone(&vfs);
        thread::spawn(move || vfs.get_node(mount_id, id))
    };
    thread::sleep(Duration::from_millis(30));
    vfs.publish_node(&node);
    let acquired = waiter.join().unwrap().unwrap();
    assert!(acquired.same_node(node.vnode()));
    assert_eq!(node.vnode().ref_count(), 2);
}

#[test]
fn busy_node_wait_is_bounded() {
    let options = VfsOptions {
        busy_retry_limit: 2,
        busy_wait_slice: Duration::from_millis(5),
        ..VfsOptions::default()
    };
    let (vfs, _ctx, _driver, mount_id) = setup_with(options);
    let id = NodeId(4243);
    let node = vfs
        .register_node(mount_id, id, Arc::new(()), NodeKind::File)
        .unwrap();

    // Never published, so the bounded wait has to give up.
    let err = vfs.get_node(mount_id, id).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);

    vfs.publish_node(&node);
    assert!(vfs.get_node(mount_id, id).is_ok());
}

#[test]
fn write_attr_stat_resizes_the_value() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/doc", b"body");
    let fd = vfs.open(&ctx, "/doc", OpenFlags::READ, 0).unwrap();
    let attr = vfs
        .create_attr(&ctx, fd, "note", 0x4e4f5445, OpenFlags::READ | OpenFlags::WRITE)
        .unwrap();
    vfs.write(&ctx, attr, b"payload").unwrap();

    vfs.write_attr_stat(&ctx, attr, &AttrInfo { size: 3, type_code: 0 })
        .unwrap();
    let info = vfs.read_attr_stat(&ctx, attr).unwrap();
    assert_eq!(info.size, 3);
    // The type code is fixed at creation.
    assert_eq!(info.type_code, 0x4e4f5445);

    vfs.seek(&ctx, attr, SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 8];
    let n = vfs.read(&ctx, attr, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"pay");
}

#[test]
fn attributes_round_trip() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/doc", b"body");
    let fd = vfs.open(&ctx, "/doc", OpenFlags::READ, 0).unwrap();

    let attr = vfs
        .create_attr(&ctx, fd, "author", 0x54455854, OpenFlags::READ | OpenFlags::WRITE)
        .unwrap();
    vfs.write(&ctx, attr, b"someone").unwrap();
    let info = vfs.read_attr_stat(&ctx, attr).unwrap();
    assert_eq!(info.size, 7);
    assert_eq!(info.type_code, 0x54455854);
    vfs.close(&ctx, attr).unwrap();

    let attr = vfs.open_attr(&ctx, fd, "author", OpenFlags::READ).unwrap();
    let mut buf = [0u8; 16];
    let n = vfs.read(&ctx, attr, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"someone");
    vfs.close(&ctx, attr).unwrap();

    let listing = vfs.open_attr_dir(&ctx, fd).unwrap();
    let entry = vfs.read_dir(&ctx, listing).unwrap().unwrap();
    assert_eq!(entry.name, "author");
    assert!(vfs.read_dir(&ctx, listing).unwrap().is_none());
    vfs.close(&ctx, listing).unwrap();

    vfs.rename_attr(&ctx, fd, "author", "writer").unwrap();
    vfs.remove_attr(&ctx, fd, "writer").unwrap();
    assert_eq!(
        vfs.open_attr(&ctx, fd, "writer", OpenFlags::READ).unwrap_err().kind,
        ErrorKind::NotFound
    );
}

#[test]
fn indexes_and_queries() {
    let (vfs, ctx, _driver, mount_id) = setup();
    vfs.create_dir(&ctx, "/sub", 0o755).unwrap();
    write_file(&vfs, &ctx, "/report", b"1");
    write_file(&vfs, &ctx, "/sub/report", b"2");
    write_file(&vfs, &ctx, "/other", b"3");

    vfs.create_index(mount_id, "name", 0x43535452).unwrap();
    let idx = vfs.open_index_dir(&ctx, mount_id).unwrap();
    assert_eq!(vfs.read_dir(&ctx, idx).unwrap().unwrap().name, "name");
    assert!(vfs.read_dir(&ctx, idx).unwrap().is_none());
    vfs.close(&ctx, idx).unwrap();
    assert_eq!(vfs.read_index_stat(mount_id, "name").unwrap().type_code, 0x43535452);

    let q = vfs
        .open_query(&ctx, mount_id, "name == \"report\"", 0)
        .unwrap();
    let mut hits = 0;
    while let Some(entry) = vfs.read_dir(&ctx, q).unwrap() {
        assert_eq!(entry.name, "report");
        hits += 1;
    }
    assert_eq!(hits, 2);
    // Query descriptors have no node to stat.
    assert_eq!(vfs.fstat(&ctx, q).unwrap_err().kind, ErrorKind::InvalidArgument);
    vfs.close(&ctx, q).unwrap();

    vfs.remove_index(mount_id, "name").unwrap();
    assert_eq!(
        vfs.read_index_stat(mount_id, "name").unwrap_err().kind,
        ErrorKind::NotFound
    );
}

#[test]
fn read_only_mount_rejects_mutation() {
    let (vfs, ctx, _driver, _) = setup();
    vfs.create_dir(&ctx, "/ro", 0o755).unwrap();
    vfs.mount("/ro", "testfs", None, None, MountFlags::READ_ONLY)
        .unwrap();
    assert_eq!(
        vfs.open(&ctx, "/ro/f", OpenFlags::CREATE | OpenFlags::WRITE, 0o644)
            .unwrap_err()
            .kind,
        ErrorKind::ReadOnly
    );
    assert_eq!(
        vfs.create_dir(&ctx, "/ro/d", 0o755).unwrap_err().kind,
        ErrorKind::ReadOnly
    );
}

#[test]
fn failed_mount_leaves_no_record() {
    let (vfs, ctx, _driver, _) = setup();
    vfs.create_dir(&ctx, "/mnt", 0o755).unwrap();
    let err = vfs
        .mount("/mnt", "testfs", None, Some("fail"), MountFlags::empty())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Io);
    assert_eq!(vfs.mount_count(), 1);
    assert!(vfs.read_stat(&ctx, "/mnt", true).is_ok());
}

#[test]
fn nodes_published_during_mount_are_reused() {
    let (vfs, ctx, driver, _) = setup();
    vfs.create_dir(&ctx, "/pre", 0o755).unwrap();
    vfs.mount("/pre", "testfs", None, Some("publish-root"), MountFlags::empty())
        .unwrap();
    let volume = driver.volume().unwrap();
    // The root was registered and published by the mount hook; acquiring it
    // never went through get_node.
    vfs.node_for_path(&ctx, "/pre").unwrap();
    assert_eq!(volume.get_node_calls(), 0);
}

#[test]
fn mount_enumeration_walks_in_id_order() {
    let (vfs, ctx, _driver, root_mount) = setup();
    vfs.create_dir(&ctx, "/m1", 0o755).unwrap();
    vfs.create_dir(&ctx, "/m2", 0o755).unwrap();
    let m1 = vfs.mount("/m1", "testfs", None, None, MountFlags::empty()).unwrap();
    let m2 = vfs.mount("/m2", "testfs", None, None, MountFlags::empty()).unwrap();

    let mut seen = Vec::new();
    let mut cursor = None;
    while let Some(info) = vfs.next_mount_info(cursor) {
        cursor = Some(info.id);
        seen.push(info);
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].id, root_mount);
    assert!(seen[0].covers.is_none());
    assert_eq!(seen[1].id, m1);
    assert_eq!(seen[2].id, m2);
    assert!(seen[1].covers.is_some());
}

#[test]
fn empty_and_invalid_paths() {
    let (vfs, ctx, _driver, _) = setup();
    assert_eq!(
        vfs.read_stat(&ctx, "", true).unwrap_err().kind,
        ErrorKind::NotFound
    );
    let long = "x".repeat(300);
    assert_eq!(
        vfs.read_stat(&ctx, &long, true).unwrap_err().kind,
        ErrorKind::NameTooLong
    );
    write_file(&vfs, &ctx, "/f", b"1");
    assert_eq!(
        vfs.read_stat(&ctx, "/f/deeper", true).unwrap_err().kind,
        ErrorKind::NotADirectory
    );
    assert_eq!(
        vfs.unlink(&ctx, "/..").unwrap_err().kind,
        ErrorKind::InvalidPath
    );
}

#[test]
fn resolution_before_root_mount_is_internal() {
    let _ = env_logger::builder().is_test(true).try_init();
    let vfs = Vfs::new();
    let ctx = vfs.create_io_context();
    assert_eq!(
        vfs.read_stat(&ctx, "/anything", true).unwrap_err().kind,
        ErrorKind::Internal
    );
    let driver = TestFs::new();
    vfs.register_driver(driver).unwrap();
    assert_eq!(
        vfs.mount("/sub", "testfs", None, None, MountFlags::empty())
            .unwrap_err()
            .kind,
        ErrorKind::InvalidPath
    );
}

#[test]
fn write_stat_resizes_and_chmods() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/f", b"0123456789");
    let stat = Stat { size: 4, mode: 0o600, ..Stat::default() };
    vfs.write_stat(&ctx, "/f", &stat, StatMask::SIZE | StatMask::MODE)
        .unwrap();
    let after = vfs.read_stat(&ctx, "/f", true).unwrap();
    assert_eq!(after.size, 4);
    assert_eq!(after.mode, 0o600);
}

#[test]
fn session_lock_release_drops_every_range() {
    let (vfs, ctx, _driver, _) = setup();
    write_file(&vfs, &ctx, "/s", b"data");
    let fd = vfs.open(&ctx, "/s", OpenFlags::READ, 0).unwrap();
    let session = LockOwner::Session(9);
    vfs.lock(&ctx, fd, session, None, false, false).unwrap();
    vfs.lock(&ctx, fd, session, Some((0, 2)), true, false).unwrap();
    assert_eq!(
        vfs.lock(&ctx, fd, LockOwner::Process(1), Some((0, 1)), false, false)
            .unwrap_err()
            .kind,
        ErrorKind::WouldBlock
    );
    vfs.unlock(&ctx, fd, session, None).unwrap();
    let node = vfs.node_for_path(&ctx, "/s").unwrap();
    assert_eq!(crate::advisory::held_count(node.vnode()), 0);
    vfs.lock(&ctx, fd, LockOwner::Process(1), Some((0, 1)), false, false)
        .unwrap();
    assert_eq!(crate::advisory::held_count(node.vnode()), 1);
}
