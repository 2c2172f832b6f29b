//! Symlinks: inline and spilled targets.

mod common;

use common::{cred, FsEnv};
use volufs::param::{SYMLNK_INLINE_MAX, SYMLNK_MAX};
use volufs::Error;

#[test]
fn short_target_roundtrip() {
    let env = FsEnv::new();
    let root = env.root();
    let attr = env
        .fs()
        .symlink_op(root, b"lnk", b"/some/where/else", cred())
        .unwrap();
    assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFLNK);
    assert_eq!(attr.size, 16);
    let target = env.fs().readlink_op(attr.ino).unwrap();
    assert_eq!(target, b"/some/where/else");
}

#[test]
fn target_length_edges() {
    let env = FsEnv::new();
    let root = env.root();
    for (i, len) in [1, SYMLNK_INLINE_MAX - 1, SYMLNK_INLINE_MAX, SYMLNK_INLINE_MAX + 1, SYMLNK_MAX]
        .iter()
        .enumerate()
    {
        let name = format!("l{}", i);
        let target = vec![b't'; *len];
        let attr = env.fs().symlink_op(root, name.as_bytes(), &target, cred()).unwrap();
        let back = env.fs().readlink_op(attr.ino).unwrap();
        assert_eq!(back.len(), *len);
        assert_eq!(back, target);
    }
}

#[test]
fn oversized_target_rejected() {
    let env = FsEnv::new();
    let root = env.root();
    let target = vec![b't'; SYMLNK_MAX + 1];
    let err = env.fs().symlink_op(root, b"big", &target, cred()).unwrap_err();
    assert!(matches!(err, Error::NameTooLong));
    assert!(env.lookup(root, "big").is_none());
}

#[test]
fn readlink_of_regular_file_fails() {
    let env = FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "plain");
    env.release(fh);
    let err = env.fs().readlink_op(ino).unwrap_err();
    assert!(matches!(err, Error::Invalid));
}

#[test]
fn unlink_releases_spilled_target() {
    let env = FsEnv::new();
    let root = env.root();
    let free0 = env.statfs().nbk_free;
    let target = vec![b'p'; SYMLNK_MAX];
    let _ = env.fs().symlink_op(root, b"spilled", &target, cred()).unwrap();
    assert!(env.statfs().nbk_free < free0);
    env.unlink(root, "spilled");
    assert_eq!(env.statfs().nbk_free, free0);
}
