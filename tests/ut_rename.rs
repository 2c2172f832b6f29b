//! Rename: simple moves, replacement, cross-directory moves, exchange.

mod common;

use common::{cred, randbuf, FsEnv};
use volufs::Error;

#[test]
fn rename_within_directory() {
    let env = FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "old");
    env.release(fh);
    env.fs().rename_op(root, b"old", root, b"new", 0, cred()).unwrap();
    assert!(env.lookup(root, "old").is_none());
    assert_eq!(env.lookup(root, "new").unwrap().ino, ino);
}

#[test]
fn rename_across_directories() {
    let env = FsEnv::new();
    let root = env.root();
    let d1 = env.mkdir(root, "d1");
    let d2 = env.mkdir(root, "d2");
    let (ino, fh) = env.create(d1, "f");
    let buf = randbuf(10000, 1);
    env.write_read(ino, &buf, 0);
    env.release(fh);
    env.fs().rename_op(d1, b"f", d2, b"f2", 0, cred()).unwrap();
    assert!(env.lookup(d1, "f").is_none());
    let moved = env.lookup(d2, "f2").unwrap();
    assert_eq!(moved.ino, ino);
    let back = env.fs().read_op(ino, 0, buf.len()).unwrap();
    assert_eq!(back, buf);
}

#[test]
fn rename_directory_updates_nlink_and_dotdot() {
    let env = FsEnv::new();
    let root = env.root();
    let d1 = env.mkdir(root, "d1");
    let d2 = env.mkdir(root, "d2");
    let sub = env.mkdir(d1, "sub");
    let d1_nlink = env.getattr(d1).nlink;
    let d2_nlink = env.getattr(d2).nlink;
    env.fs().rename_op(d1, b"sub", d2, b"sub", 0, cred()).unwrap();
    assert_eq!(env.getattr(d1).nlink, d1_nlink - 1);
    assert_eq!(env.getattr(d2).nlink, d2_nlink + 1);
    let dotdot = env.fs().lookup_op(sub, b"..", cred()).unwrap();
    assert_eq!(dotdot.ino, d2);
}

#[test]
fn rename_replaces_file() {
    let env = FsEnv::new();
    let root = env.root();
    let (a, fha) = env.create(root, "a");
    let (_b, fhb) = env.create(root, "b");
    env.release(fha);
    env.release(fhb);
    let files_free = env.statfs().nfiles_free;
    env.fs().rename_op(root, b"a", root, b"b", 0, cred()).unwrap();
    assert!(env.lookup(root, "a").is_none());
    assert_eq!(env.lookup(root, "b").unwrap().ino, a);
    // The replaced inode was reclaimed.
    assert_eq!(env.statfs().nfiles_free, files_free + 1);
}

#[test]
fn rename_noreplace_fails_on_existing() {
    let env = FsEnv::new();
    let root = env.root();
    let (_, fha) = env.create(root, "a");
    let (_, fhb) = env.create(root, "b");
    env.release(fha);
    env.release(fhb);
    let err = env
        .fs()
        .rename_op(root, b"a", root, b"b", libc::RENAME_NOREPLACE, cred())
        .unwrap_err();
    assert!(matches!(err, Error::Exists));
}

#[test]
fn rename_replace_nonempty_directory_fails() {
    let env = FsEnv::new();
    let root = env.root();
    let d1 = env.mkdir(root, "d1");
    let d2 = env.mkdir(root, "d2");
    let (_, fh) = env.create(d2, "child");
    env.release(fh);
    let err = env.fs().rename_op(root, b"d1", root, b"d2", 0, cred()).unwrap_err();
    assert!(matches!(err, Error::NotEmpty));
    let _ = d1;
}

#[test]
fn rename_file_over_directory_fails() {
    let env = FsEnv::new();
    let root = env.root();
    let (_, fh) = env.create(root, "f");
    env.release(fh);
    let _ = env.mkdir(root, "d");
    let err = env.fs().rename_op(root, b"f", root, b"d", 0, cred()).unwrap_err();
    assert!(matches!(err, Error::IsDir));
}

#[test]
fn rename_into_own_subtree_fails() {
    let env = FsEnv::new();
    let root = env.root();
    let d1 = env.mkdir(root, "d1");
    let d2 = env.mkdir(d1, "d2");
    let err = env.fs().rename_op(root, b"d1", d2, b"d1", 0, cred()).unwrap_err();
    assert!(matches!(err, Error::Invalid));
}

#[test]
fn exchange_swaps_inos() {
    let env = FsEnv::new();
    let root = env.root();
    let (a, fha) = env.create(root, "a");
    let (b, fhb) = env.create(root, "b");
    env.release(fha);
    env.release(fhb);
    env.fs()
        .rename_op(root, b"a", root, b"b", libc::RENAME_EXCHANGE, cred())
        .unwrap();
    assert_eq!(env.lookup(root, "a").unwrap().ino, b);
    assert_eq!(env.lookup(root, "b").unwrap().ino, a);
}

#[test]
fn exchange_requires_both_entries() {
    let env = FsEnv::new();
    let root = env.root();
    let (_, fh) = env.create(root, "only");
    env.release(fh);
    let err = env
        .fs()
        .rename_op(root, b"only", root, b"ghost", libc::RENAME_EXCHANGE, cred())
        .unwrap_err();
    assert!(matches!(err, Error::NotFound));
}

#[test]
fn exchange_across_directories() {
    let env = FsEnv::new();
    let root = env.root();
    let d1 = env.mkdir(root, "d1");
    let d2 = env.mkdir(root, "d2");
    let sub = env.mkdir(d1, "x");
    let (f, fh) = env.create(d2, "x");
    env.release(fh);
    let d1_nlink = env.getattr(d1).nlink;
    let d2_nlink = env.getattr(d2).nlink;
    env.fs()
        .rename_op(d1, b"x", d2, b"x", libc::RENAME_EXCHANGE, cred())
        .unwrap();
    assert_eq!(env.lookup(d1, "x").unwrap().ino, f);
    assert_eq!(env.lookup(d2, "x").unwrap().ino, sub);
    // The directory moved from d1 to d2; `..` counts follow.
    assert_eq!(env.getattr(d1).nlink, d1_nlink - 1);
    assert_eq!(env.getattr(d2).nlink, d2_nlink + 1);
    let dotdot = env.fs().lookup_op(sub, b"..", cred()).unwrap();
    assert_eq!(dotdot.ino, d2);
}

#[test]
fn rename_same_name_is_noop() {
    let env = FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "same");
    env.release(fh);
    env.fs().rename_op(root, b"same", root, b"same", 0, cred()).unwrap();
    assert_eq!(env.lookup(root, "same").unwrap().ino, ino);
}
