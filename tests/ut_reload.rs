//! Persistence: unmount followed by remount is the identity on the
//! observable namespace.

mod common;

use common::{cred, randbuf, FsEnv, BK, MEGA};

#[test]
fn data_survives_reload() {
    let mut env = FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "keep");
    let buf = randbuf(10 * MEGA as usize, 42);
    let n = env.fs().write_op(ino, 0, &buf).unwrap();
    assert_eq!(n, buf.len());
    env.fs().sync_now(None).unwrap();
    env.release(fh);

    env.reload();
    let root = env.root();
    let ino2 = env.lookup(root, "keep").unwrap().ino;
    assert_eq!(ino2, ino);
    let back = env.fs().read_op(ino2, 0, buf.len()).unwrap();
    assert_eq!(back, buf, "bit-for-bit identity after remount");
}

#[test]
fn namespace_survives_reload() {
    let mut env = FsEnv::new();
    let root = env.root();
    let d1 = env.mkdir(root, "d1");
    let d2 = env.mkdir(d1, "d2");
    let (f, fh) = env.create(d2, "f");
    env.write_read(f, b"payload", 0);
    env.release(fh);
    let _ = env.fs().symlink_op(d1, b"lnk", b"d2/f", cred()).unwrap();
    env.fs()
        .setxattr_op(f, b"user.mark", b"kept", volufs::fs::xattr::XattrSet::Any)
        .unwrap();

    env.reload();
    let root = env.root();
    let d1b = env.lookup(root, "d1").unwrap().ino;
    assert_eq!(d1b, d1);
    let d2b = env.lookup(d1b, "d2").unwrap().ino;
    assert_eq!(d2b, d2);
    let fb = env.lookup(d2b, "f").unwrap();
    assert_eq!(fb.ino, f);
    assert_eq!(fb.size, 7);
    let back = env.fs().read_op(f, 0, 7).unwrap();
    assert_eq!(back, b"payload");
    let target = env.fs().readlink_op(env.lookup(d1b, "lnk").unwrap().ino).unwrap();
    assert_eq!(target, b"d2/f");
    let mark = env.fs().getxattr_op(f, b"user.mark").unwrap();
    assert_eq!(mark, b"kept");
}

#[test]
fn sparse_layout_survives_reload() {
    let mut env = FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "sparse");
    let buf = randbuf(BK as usize, 3);
    env.write_read(ino, &buf, 100 * BK);
    env.release(fh);

    env.reload();
    let attr = env.lookup(env.root(), "sparse").unwrap();
    assert_eq!(attr.size, 101 * BK);
    assert_eq!(env.lseek_data(ino, 0), 100 * BK);
    env.read_zeros(ino, 0, BK as usize);
    let back = env.fs().read_op(ino, 100 * BK, BK as usize).unwrap();
    assert_eq!(back, buf);
}

#[test]
fn counters_survive_reload() {
    let mut env = FsEnv::new();
    let root = env.root();
    let (_, fh) = env.create(root, "c");
    env.release(fh);
    let before = env.statfs();
    env.reload();
    let after = env.statfs();
    assert_eq!(after.nbk_total, before.nbk_total);
    assert_eq!(after.nbk_free, before.nbk_free);
    assert_eq!(after.nfiles_free, before.nfiles_free);
}

#[test]
fn reloaded_volume_checks_clean() {
    let mut env = FsEnv::new();
    let root = env.root();
    let d = env.mkdir(root, "dir");
    let (f, fh) = env.create(d, "file");
    env.write_read(f, &randbuf(3 * BK as usize, 7), BK);
    env.release(fh);
    let path = env.path.clone();
    // Unmount cleanly, then verify offline.
    let fsys = env.fsys.take().unwrap();
    fsys.unmount().unwrap();
    drop(fsys);
    let report =
        volufs::check::check_volume(&path, Box::new(volufs::codec::PlainCodec)).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.inodes, 3);
}
