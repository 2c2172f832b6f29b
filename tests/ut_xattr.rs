//! Extended attributes: set/get/list/remove, flags, value sizes.

mod common;

use common::{randbuf, FsEnv};
use volufs::fs::xattr::XattrSet;
use volufs::param::XATTR_VALUE_MAX;
use volufs::Error;

fn file_env() -> (FsEnv, u64) {
    let env = FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "x");
    env.release(fh);
    (env, ino)
}

#[test]
fn set_get_remove() {
    let (env, ino) = file_env();
    env.fs()
        .setxattr_op(ino, b"user.key", b"value", XattrSet::Any)
        .unwrap();
    let v = env.fs().getxattr_op(ino, b"user.key").unwrap();
    assert_eq!(v, b"value");
    env.fs().removexattr_op(ino, b"user.key").unwrap();
    assert!(matches!(
        env.fs().getxattr_op(ino, b"user.key"),
        Err(Error::NoAttr)
    ));
}

#[test]
fn create_and_replace_flags() {
    let (env, ino) = file_env();
    env.fs().setxattr_op(ino, b"user.a", b"1", XattrSet::Create).unwrap();
    assert!(matches!(
        env.fs().setxattr_op(ino, b"user.a", b"2", XattrSet::Create),
        Err(Error::Exists)
    ));
    env.fs().setxattr_op(ino, b"user.a", b"2", XattrSet::Replace).unwrap();
    assert_eq!(env.fs().getxattr_op(ino, b"user.a").unwrap(), b"2");
    assert!(matches!(
        env.fs().setxattr_op(ino, b"user.b", b"3", XattrSet::Replace),
        Err(Error::NotFound)
    ));
}

#[test]
fn value_size_edges() {
    let (env, ino) = file_env();
    for (i, len) in [0usize, 1, 4096, XATTR_VALUE_MAX].iter().enumerate() {
        let name = format!("user.v{}", i);
        let value = randbuf(*len, *len as u64 + 1);
        env.fs()
            .setxattr_op(ino, name.as_bytes(), &value, XattrSet::Any)
            .unwrap();
        let back = env.fs().getxattr_op(ino, name.as_bytes()).unwrap();
        assert_eq!(back.len(), *len);
        assert_eq!(back, value);
    }
    let oversized = randbuf(XATTR_VALUE_MAX + 1, 77);
    assert!(matches!(
        env.fs().setxattr_op(ino, b"user.huge", &oversized, XattrSet::Any),
        Err(Error::ArgTooBig)
    ));
}

#[test]
fn list_names() {
    let (env, ino) = file_env();
    env.fs().setxattr_op(ino, b"user.one", b"1", XattrSet::Any).unwrap();
    env.fs().setxattr_op(ino, b"user.two", b"22", XattrSet::Any).unwrap();
    let big = randbuf(9000, 5);
    env.fs().setxattr_op(ino, b"user.three", &big, XattrSet::Any).unwrap();
    let mut names = env.fs().listxattr_op(ino).unwrap();
    names.sort();
    assert_eq!(names, vec![
        b"user.one".to_vec(),
        b"user.three".to_vec(),
        b"user.two".to_vec(),
    ]);
}

#[test]
fn replace_moves_between_inline_and_chain() {
    let (env, ino) = file_env();
    let small = b"tiny".to_vec();
    let large = randbuf(20000, 9);
    env.fs().setxattr_op(ino, b"user.k", &small, XattrSet::Any).unwrap();
    env.fs().setxattr_op(ino, b"user.k", &large, XattrSet::Any).unwrap();
    assert_eq!(env.fs().getxattr_op(ino, b"user.k").unwrap(), large);
    env.fs().setxattr_op(ino, b"user.k", &small, XattrSet::Any).unwrap();
    assert_eq!(env.fs().getxattr_op(ino, b"user.k").unwrap(), small);
    let names = env.fs().listxattr_op(ino).unwrap();
    assert_eq!(names.len(), 1);
}

#[test]
fn large_values_release_blocks_on_remove() {
    let (env, ino) = file_env();
    let free0 = env.statfs().nbk_free;
    let large = randbuf(XATTR_VALUE_MAX, 13);
    env.fs().setxattr_op(ino, b"user.big", &large, XattrSet::Any).unwrap();
    assert!(env.statfs().nbk_free < free0);
    env.fs().removexattr_op(ino, b"user.big").unwrap();
    assert_eq!(env.statfs().nbk_free, free0);
}

#[test]
fn xattrs_update_ctime_only() {
    let (env, ino) = file_env();
    let before = env.getattr(ino);
    std::thread::sleep(std::time::Duration::from_millis(20));
    env.fs().setxattr_op(ino, b"user.t", b"v", XattrSet::Any).unwrap();
    let after = env.getattr(ino);
    assert_eq!(after.mtime, before.mtime);
    assert!(after.ctime > before.ctime);
}

#[test]
fn xattrs_die_with_inode() {
    let (env, ino) = file_env();
    let free0 = env.statfs().nbk_free;
    let large = randbuf(30000, 21);
    env.fs().setxattr_op(ino, b"user.gone", &large, XattrSet::Any).unwrap();
    env.unlink(env.root(), "x");
    let _ = ino;
    // Inode block plus every xattr node returned to the free pool.
    assert_eq!(env.statfs().nbk_free, free0 + 1);
}
