//! Namespace basics: create, lookup, unlink, mkdir, rmdir.

mod common;

use common::{cred, FsEnv};
use volufs::param::NAME_MAX;
use volufs::Error;

#[test]
fn create_lookup_unlink() {
    let env = FsEnv::new();
    let root = env.root();
    assert!(env.lookup(root, "f1").is_none());
    let (ino, fh) = env.create(root, "f1");
    let attr = env.lookup(root, "f1").expect("created entry");
    assert_eq!(attr.ino, ino);
    assert_eq!(attr.nlink, 1);
    assert_eq!(attr.size, 0);
    env.release(fh);
    env.unlink(root, "f1");
    assert!(env.lookup(root, "f1").is_none());
}

#[test]
fn create_existing_fails() {
    let env = FsEnv::new();
    let root = env.root();
    let (_, fh) = env.create(root, "dup");
    env.release(fh);
    let err = env.fs().create_op(root, b"dup", 0o644, 0, cred()).unwrap_err();
    assert!(matches!(err, Error::Exists));
}

#[test]
fn mkdir_rmdir() {
    let env = FsEnv::new();
    let root = env.root();
    let root_nlink = env.getattr(root).nlink;
    let dino = env.mkdir(root, "d1");
    let attr = env.getattr(dino);
    assert_eq!(attr.nlink, 2);
    assert_eq!(env.getattr(root).nlink, root_nlink + 1);
    env.rmdir(root, "d1");
    assert!(env.lookup(root, "d1").is_none());
    assert_eq!(env.getattr(root).nlink, root_nlink);
}

#[test]
fn rmdir_of_nonempty_fails() {
    let env = FsEnv::new();
    let root = env.root();
    let dino = env.mkdir(root, "d");
    let (_, fh) = env.create(dino, "child");
    env.release(fh);
    let err = env.fs().rmdir_op(root, b"d", cred()).unwrap_err();
    assert!(matches!(err, Error::NotEmpty));
    env.unlink(dino, "child");
    env.rmdir(root, "d");
}

#[test]
fn unlink_of_directory_fails() {
    let env = FsEnv::new();
    let root = env.root();
    let _ = env.mkdir(root, "d");
    let err = env.fs().unlink_op(root, b"d", cred()).unwrap_err();
    assert!(matches!(err, Error::IsDir));
}

#[test]
fn rmdir_of_file_fails() {
    let env = FsEnv::new();
    let root = env.root();
    let (_, fh) = env.create(root, "f");
    env.release(fh);
    let err = env.fs().rmdir_op(root, b"f", cred()).unwrap_err();
    assert!(matches!(err, Error::NotDir));
}

#[test]
fn name_length_bounds() {
    let env = FsEnv::new();
    let root = env.root();
    for len in [1usize, NAME_MAX - 1, NAME_MAX] {
        let name = "x".repeat(len);
        let (_, fh) = env.create(root, &name);
        env.release(fh);
        assert!(env.lookup(root, &name).is_some());
        env.unlink(root, &name);
    }
    let too_long = "x".repeat(NAME_MAX + 1);
    let err = env.fs().create_op(root, too_long.as_bytes(), 0o644, 0, cred()).unwrap_err();
    assert!(matches!(err, Error::NameTooLong));
}

#[test]
fn dot_and_dotdot_resolve() {
    let env = FsEnv::new();
    let root = env.root();
    let dino = env.mkdir(root, "sub");
    let dot = env.fs().lookup_op(dino, b".", cred()).unwrap();
    assert_eq!(dot.ino, dino);
    let dotdot = env.fs().lookup_op(dino, b"..", cred()).unwrap();
    assert_eq!(dotdot.ino, root);
}

#[test]
fn mkdir_restores_free_files_count() {
    let env = FsEnv::new();
    let root = env.root();
    let before = env.statfs();
    let dino = env.mkdir(root, "d");
    let (_, fh) = env.create(dino, "f");
    env.release(fh);
    assert!(env.statfs().nfiles_free < before.nfiles_free);
    env.unlink(dino, "f");
    env.rmdir(root, "d");
    let after = env.statfs();
    assert_eq!(after.nfiles_free, before.nfiles_free);
}

#[test]
fn deep_tree() {
    let env = FsEnv::new();
    let mut parent = env.root();
    for depth in 0..32 {
        parent = env.mkdir(parent, &format!("level{}", depth));
    }
    let (ino, fh) = env.create(parent, "leaf");
    env.release(fh);
    assert_eq!(env.lookup(parent, "leaf").unwrap().ino, ino);
}

#[test]
fn many_names_in_one_directory() {
    let env = FsEnv::new();
    let root = env.root();
    let dino = env.mkdir(root, "big");
    let count = 2000;
    for i in 0..count {
        let (_, fh) = env.create(dino, &format!("file-{:05}", i));
        env.release(fh);
    }
    assert_eq!(env.getattr(dino).size, 0);
    for i in 0..count {
        assert!(env.lookup(dino, &format!("file-{:05}", i)).is_some());
    }
    for i in 0..count {
        env.unlink(dino, &format!("file-{:05}", i));
    }
    env.rmdir(root, "big");
}
