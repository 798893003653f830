#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::os::unix::fs::symlink;
use std::sync::Arc;

use common::{Call, FaultyIo, Harness, names};
use hycache::error::TierError;
use hycache::fs::{AccessMask, FsOptions, MkdirPolicy};
use hycache::io::TierIo as _;
use hycache::mirror::{MirrorKind, MirrorOperation};
use hycache::tier::{CONTROL_DIR_NAME, VirtualPath};
use hycache::tiering::{PriorityQueueEntry, TieringAction};

#[test]
fn mkdir_on_empty_fast_tier_creates_and_mirrors() {
    let h = Harness::new();
    std::fs::create_dir(h.tiers.fast().join("a")).unwrap();

    h.fs.mkdir(&"a/b".into(), 0o755).unwrap();

    assert!(h.tiers.fast().join("a/b").is_dir());
    assert_eq!(
        h.mirrored(),
        vec![MirrorOperation::new(
            MirrorKind::CreateDir { mode: 0o755 },
            h.tiers.slow().join("a/b")
        )]
    );
}

#[test]
fn mkdir_with_leading_slash_resolves_the_same() {
    let h = Harness::new();

    h.fs.mkdir(&"/top".into(), 0o700).unwrap();

    assert!(h.tiers.fast().join("top").is_dir());
    assert_eq!(h.mirrored()[0].target, h.tiers.slow().join("top"));
}

#[test]
fn mkdir_on_existing_directory_with_other_mode_chmods_and_mirrors() {
    let h = Harness::new();
    std::fs::create_dir_all(h.tiers.fast().join("a/b")).unwrap();
    hycache::io::HostIo
        .chmod(&h.tiers.fast().join("a/b"), 0o700)
        .unwrap();

    h.fs.mkdir(&"a/b".into(), 0o755).unwrap();

    assert_eq!(h.tiers.fast_mode("a/b"), 0o755);
    assert_eq!(
        h.mirrored(),
        vec![MirrorOperation::new(
            MirrorKind::ChangeMode { mode: 0o755 },
            h.tiers.slow().join("a/b")
        )]
    );
}

#[test]
fn mkdir_on_existing_directory_with_same_mode_is_a_no_op_by_default() {
    let h = Harness::new();
    h.fs.mkdir(&"d".into(), 0o700).unwrap();
    let before = h.mirrored();

    h.fs.mkdir(&"d".into(), 0o700).unwrap();

    assert_eq!(h.mirrored(), before, "a redundant mkdir must not be mirrored");
}

#[test]
fn mkdir_recreate_policy_surfaces_already_exists() {
    let h = Harness::with_options(FsOptions {
        mkdir_policy: MkdirPolicy::Recreate,
        ..FsOptions::default()
    });
    h.fs.mkdir(&"d".into(), 0o700).unwrap();

    let err = h.fs.mkdir(&"d".into(), 0o700).unwrap_err();

    assert!(matches!(err, TierError::AlreadyExists), "{err:?}");
    assert_eq!(h.mirrored().len(), 1);
}

#[test]
fn mkdir_over_a_regular_file_fails() {
    let h = Harness::new();
    std::fs::write(h.tiers.fast().join("f"), b"x").unwrap();

    let err = h.fs.mkdir(&"f".into(), 0o755).unwrap_err();

    assert!(matches!(err, TierError::AlreadyExists), "{err:?}");
    assert!(h.mirrored().is_empty());
}

#[test]
fn mkdir_under_missing_parent_fails_without_mirroring() {
    let h = Harness::new();

    let err = h.fs.mkdir(&"missing/child".into(), 0o755).unwrap_err();

    assert!(matches!(err, TierError::NotFound), "{err:?}");
    assert!(h.mirrored().is_empty());
}

#[test]
fn failed_fast_tier_mkdir_leaves_mirror_queue_untouched() {
    let io = FaultyIo::new().always_fail(Call::Mkdir, libc::ENOSPC);
    let h = Harness::with_io(Arc::new(io), FsOptions::default());

    let err = h.fs.mkdir(&"d".into(), 0o755).unwrap_err();

    assert_eq!(i32::from(err), libc::ENOSPC);
    assert!(h.mirror.is_empty());
}

#[test]
fn failed_fast_tier_chmod_leaves_mirror_queue_untouched() {
    let io = FaultyIo::new().always_fail(Call::Chmod, libc::EPERM);
    let h = Harness::with_io(Arc::new(io), FsOptions::default());
    std::fs::create_dir(h.tiers.fast().join("d")).unwrap();
    hycache::io::HostIo
        .chmod(&h.tiers.fast().join("d"), 0o700)
        .unwrap();

    let err = h.fs.mkdir(&"d".into(), 0o755).unwrap_err();

    assert!(matches!(err, TierError::Io(_)), "{err:?}");
    assert_eq!(i32::from(err), libc::EPERM);
    assert!(h.mirror.is_empty());
}

#[test]
fn rmdir_of_plain_directory_is_not_mirrored() {
    let h = Harness::new();
    std::fs::create_dir_all(h.tiers.fast().join("a/b")).unwrap();

    h.fs.rmdir(&"a/b".into()).unwrap();

    assert!(!h.tiers.fast().join("a/b").exists());
    assert!(h.mirrored().is_empty());
}

#[test]
fn rmdir_of_symlinked_directory_removes_link_and_mirrors() {
    let h = Harness::new();
    std::fs::create_dir_all(h.tiers.slow().join("a/b")).unwrap();
    std::fs::create_dir(h.tiers.fast().join("a")).unwrap();
    symlink(h.tiers.slow().join("a/b"), h.tiers.fast().join("a/b")).unwrap();

    h.fs.rmdir(&"a/b".into()).unwrap();

    assert!(h.tiers.fast().join("a/b").symlink_metadata().is_err());
    assert!(
        h.tiers.slow().join("a/b").is_dir(),
        "the slow tier only changes once the mirror runs"
    );
    assert_eq!(
        h.mirrored(),
        vec![MirrorOperation::new(
            MirrorKind::RemoveDir,
            h.tiers.slow().join("a/b")
        )]
    );
}

#[test]
fn rmdir_of_symlink_to_file_is_not_a_directory() {
    let h = Harness::new();
    std::fs::write(h.tiers.slow().join("f"), b"x").unwrap();
    symlink(h.tiers.slow().join("f"), h.tiers.fast().join("f")).unwrap();

    let err = h.fs.rmdir(&"f".into()).unwrap_err();

    assert!(matches!(err, TierError::NotADirectory), "{err:?}");
    assert!(h.tiers.fast().join("f").symlink_metadata().is_ok());
    assert!(h.mirrored().is_empty());
}

#[test]
fn rmdir_of_missing_path_is_not_found() {
    let h = Harness::new();
    let err = h.fs.rmdir(&"nope".into()).unwrap_err();
    assert_eq!(i32::from(err), libc::ENOENT);
}

#[test]
fn rmdir_of_non_empty_directory_fails() {
    let h = Harness::new();
    std::fs::create_dir_all(h.tiers.fast().join("d/inner")).unwrap();

    let err = h.fs.rmdir(&"d".into()).unwrap_err();

    assert_eq!(i32::from(err), libc::ENOTEMPTY);
    assert!(h.tiers.fast().join("d").is_dir());
}

#[test]
fn readdir_lists_dots_first_and_hides_control_entries_at_every_depth() {
    let h = Harness::new();
    let fast = h.tiers.fast();
    std::fs::create_dir_all(fast.join("a/b")).unwrap();
    std::fs::create_dir_all(fast.join("a/.____stash")).unwrap();
    std::fs::create_dir_all(fast.join("a/b/.____deep")).unwrap();
    std::fs::write(fast.join("a/b/visible"), b"").unwrap();
    std::fs::write(fast.join(".hidden"), b"").unwrap();

    let root = h.fs.readdir(&VirtualPath::root()).unwrap();
    assert_eq!(root[0], ".");
    assert_eq!(root[1], "..");
    // The control directory exists on disk once the filesystem is open.
    assert!(fast.join(CONTROL_DIR_NAME).is_dir());
    assert_eq!(names(&root), vec![".hidden", "a"]);

    assert_eq!(names(&h.fs.readdir(&"a".into()).unwrap()), vec!["b"]);
    assert_eq!(
        names(&h.fs.readdir(&"a/b".into()).unwrap()),
        vec!["visible"]
    );
}

#[test]
fn readdir_of_missing_directory_fails() {
    let h = Harness::new();
    let err = h.fs.readdir(&"missing".into()).unwrap_err();
    assert!(matches!(err, TierError::NotFound), "{err:?}");
}

#[test]
fn getattr_does_not_follow_symlinks() {
    let h = Harness::new();
    std::fs::create_dir(h.tiers.slow().join("d")).unwrap();
    symlink(h.tiers.slow().join("d"), h.tiers.fast().join("d")).unwrap();

    let stat = h.fs.getattr(&"d".into()).unwrap();

    assert!(stat.is_symlink());
    assert!(!stat.is_dir());
}

#[test]
fn getattr_reports_size_and_owner() {
    let h = Harness::new();
    std::fs::write(h.tiers.fast().join("f"), b"hello").unwrap();

    let stat = h.fs.getattr(&"/f".into()).unwrap();

    assert_eq!(stat.size, 5);
    assert_eq!(stat.nlink, 1);
    assert_eq!(stat.uid, nix::unistd::Uid::effective().as_raw());
}

#[test]
fn lookup_joins_the_name_onto_the_parent() {
    let h = Harness::new();
    std::fs::create_dir_all(h.tiers.fast().join("a/b")).unwrap();

    let (path, stat) = h.fs.lookup(&"a".into(), "b").unwrap();

    assert_eq!(path.as_str(), "a/b");
    assert!(stat.is_dir());
    assert!(matches!(
        h.fs.lookup(&"a".into(), "zzz"),
        Err(TierError::NotFound)
    ));
}

#[test]
fn access_failures_are_permission_denied() {
    let h = Harness::new();
    std::fs::write(h.tiers.fast().join("f"), b"").unwrap();

    h.fs.access(&"f".into(), AccessMask::empty()).unwrap();
    h.fs.access(&"f".into(), AccessMask::READ).unwrap();

    let err = h.fs.access(&"missing".into(), AccessMask::empty()).unwrap_err();
    assert!(matches!(err, TierError::PermissionDenied), "{err:?}");
}

#[test]
fn mknod_creates_on_fast_tier_only() {
    let h = Harness::new();

    h.fs.mknod(&"pipe".into(), u32::from(libc::S_IFIFO) | 0o600, 0)
        .unwrap();

    let stat = h.fs.getattr(&"pipe".into()).unwrap();
    assert_eq!(
        stat.mode & u32::from(libc::S_IFMT),
        u32::from(libc::S_IFIFO)
    );
    assert!(!h.tiers.slow().join("pipe").exists());
    assert!(h.mirrored().is_empty());
}

#[test]
fn statfs_reports_the_fast_tier() {
    let h = Harness::new();

    let stats = h.fs.statfs(&VirtualPath::root()).unwrap();

    assert!(stats.block_size > 0);
    assert!(stats.max_filename_length > 0);
    assert!(stats.total_blocks >= stats.free_blocks);
}

#[test]
fn statfs_failure_maps_to_errno() {
    let io = FaultyIo::new().always_fail(Call::Statvfs, libc::EIO);
    let h = Harness::with_io(Arc::new(io), FsOptions::default());

    let err = h.fs.statfs(&VirtualPath::root()).unwrap_err();
    assert_eq!(i32::from(err), libc::EIO);
}

#[test]
fn mirror_operations_keep_call_order() {
    let h = Harness::new();

    h.fs.mkdir(&"x".into(), 0o700).unwrap();
    h.fs.mkdir(&"x".into(), 0o750).unwrap();

    let kinds: Vec<MirrorKind> = h.mirrored().into_iter().map(|op| op.kind).collect();
    assert_eq!(
        kinds,
        vec![
            MirrorKind::CreateDir { mode: 0o700 },
            MirrorKind::ChangeMode { mode: 0o750 }
        ]
    );
}

#[test]
fn shutdown_persists_tiering_queue_and_closes_mirror() {
    let h = Harness::with_options(FsOptions {
        flush_policy: hycache::tiering::FlushPolicy::Deferred,
        ..FsOptions::default()
    });
    h.fs.tiering()
        .acquire()
        .push(PriorityQueueEntry::new(1, "a", TieringAction::Promote))
        .unwrap();

    h.fs.shutdown();

    assert!(h.mirror.is_closed());
    assert!(!h.fs.tiering().acquire().is_dirty());
    let snapshot = h
        .tiers
        .fast()
        .join(CONTROL_DIR_NAME)
        .join(hycache::tiering::SNAPSHOT_FILE_NAME);
    let text = std::fs::read_to_string(snapshot).unwrap();
    assert!(text.contains("promote"), "{text}");
}

#[test]
fn corrupt_snapshot_aborts_open() {
    let tiers = common::Tiers::new();
    let control = tiers.fast().join(CONTROL_DIR_NAME);
    std::fs::create_dir(&control).unwrap();
    std::fs::write(
        control.join(hycache::tiering::SNAPSHOT_FILE_NAME),
        b"{ not json",
    )
    .unwrap();

    let result = hycache::fs::HycacheFs::open(
        tiers.resolver(),
        Arc::new(hycache::io::HostIo),
        Arc::new(hycache::mirror::MirrorQueue::new()),
        FsOptions::default(),
    );

    assert!(matches!(result, Err(TierError::Recovery(_))));
}
