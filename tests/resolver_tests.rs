#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::os::unix::fs::{PermissionsExt as _, symlink};

use common::Tiers;
use hycache::io::HostIo;
use hycache::tier::{TierFacts, VirtualPath};

#[test]
fn resolve_joins_both_roots() {
    let tiers = Tiers::new();
    let resolver = tiers.resolver();

    let paths = resolver.resolve(&"/a/b".into());
    assert_eq!(paths.fast, tiers.fast().join("a/b"));
    assert_eq!(paths.slow, tiers.slow().join("a/b"));

    let root = resolver.resolve(&VirtualPath::root());
    assert_eq!(root.fast, tiers.fast());
    assert_eq!(root.slow, tiers.slow());
}

#[test]
fn resolve_does_not_touch_the_disk() {
    let resolver = hycache::tier::TierResolver::new("/definitely/not/here", "/nor/here");
    let paths = resolver.resolve(&"x".into());
    assert_eq!(paths.fast.to_str().unwrap(), "/definitely/not/here/x");
    assert_eq!(paths.slow.to_str().unwrap(), "/nor/here/x");
}

#[test]
fn facts_of_plain_directory_and_file() {
    let tiers = Tiers::new();
    std::fs::create_dir(tiers.fast().join("d")).unwrap();
    std::fs::set_permissions(
        tiers.fast().join("d"),
        std::fs::Permissions::from_mode(0o750),
    )
    .unwrap();
    std::fs::write(tiers.fast().join("f"), b"data").unwrap();
    let resolver = tiers.resolver();

    assert_eq!(
        resolver.facts(&HostIo, &"d".into()),
        TierFacts {
            is_symlink: false,
            is_directory: true,
            mode: Some(0o750),
        }
    );
    let file = resolver.facts(&HostIo, &"/f".into());
    assert!(!file.is_symlink);
    assert!(!file.is_directory);
    assert!(file.exists());
}

#[test]
fn facts_follow_symlinks_into_the_slow_tier() {
    let tiers = Tiers::new();
    std::fs::create_dir(tiers.slow().join("cold")).unwrap();
    std::fs::set_permissions(
        tiers.slow().join("cold"),
        std::fs::Permissions::from_mode(0o711),
    )
    .unwrap();
    std::fs::write(tiers.slow().join("cold.bin"), b"x").unwrap();
    symlink(tiers.slow().join("cold"), tiers.fast().join("cold")).unwrap();
    symlink(tiers.slow().join("cold.bin"), tiers.fast().join("cold.bin")).unwrap();
    let resolver = tiers.resolver();

    assert_eq!(
        resolver.facts(&HostIo, &"cold".into()),
        TierFacts {
            is_symlink: true,
            is_directory: true,
            mode: Some(0o711),
        }
    );
    let file = resolver.facts(&HostIo, &"cold.bin".into());
    assert!(file.is_symlink);
    assert!(!file.is_directory);
}

#[test]
fn facts_never_consult_the_slow_tier() {
    let tiers = Tiers::new();
    std::fs::create_dir(tiers.slow().join("only-slow")).unwrap();

    let facts = tiers.resolver().facts(&HostIo, &"only-slow".into());
    assert!(!facts.exists());
}
