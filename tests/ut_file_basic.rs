//! Regular-file data paths: write, read, overwrite, sparse regions.

mod common;

use common::{randbuf, FsEnv, BK, GIGA, MEGA, TERA};
use volufs::param::FILESIZE_MAX;
use volufs::Error;

fn simple_env() -> (FsEnv, u64, u64) {
    let env = FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "data");
    (env, ino, fh)
}

#[test]
fn write_read_at_block_boundaries() {
    let (env, ino, fh) = simple_env();
    for off in [0, 1, BK - 1, BK, BK + 1, 2 * BK - 1] {
        let buf = randbuf(1711, off + 1);
        env.write_read(ino, &buf, off);
    }
    env.release(fh);
}

#[test]
fn write_read_at_level_boundaries() {
    let (env, ino, fh) = simple_env();
    // Radix fan-out is 256, so each level covers 256x the previous one.
    for level_span in [BK, 256 * BK, 256 * 256 * BK] {
        for off in [level_span - 1, level_span, level_span + 1] {
            let buf = randbuf(257, off);
            env.write_read(ino, &buf, off);
        }
    }
    env.release(fh);
}

#[test]
fn write_read_far_offsets() {
    let (env, ino, fh) = simple_env();
    for off in [MEGA + 1, GIGA - 3, TERA + 5] {
        let buf = randbuf(4096, off);
        env.write_read(ino, &buf, off);
    }
    env.release(fh);
}

#[test]
fn spanning_write() {
    let (env, ino, fh) = simple_env();
    let buf = randbuf(3 * BK as usize + 17, 7);
    env.write_read(ino, &buf, BK - 9);
    assert_eq!(env.getattr(ino).size, BK - 9 + buf.len() as u64);
    env.release(fh);
}

#[test]
fn overwrite_keeps_neighbors() {
    let (env, ino, fh) = simple_env();
    let base = randbuf(3 * BK as usize, 1);
    env.write_read(ino, &base, 0);
    let patch = randbuf(100, 2);
    let n = env.fs().write_op(ino, BK + 50, &patch).unwrap();
    assert_eq!(n, patch.len());
    let back = env.fs().read_op(ino, 0, base.len()).unwrap();
    assert_eq!(&back[..BK as usize + 50], &base[..BK as usize + 50]);
    assert_eq!(&back[BK as usize + 50..BK as usize + 150], &patch[..]);
    assert_eq!(&back[BK as usize + 150..], &base[BK as usize + 150..]);
    env.release(fh);
}

#[test]
fn holes_read_as_zeros() {
    let (env, ino, fh) = simple_env();
    let buf = randbuf(BK as usize, 3);
    env.write_read(ino, &buf, 10 * BK);
    env.read_zeros(ino, 0, BK as usize);
    env.read_zeros(ino, 5 * BK, BK as usize);
    // Sparse file: one leaf plus its index path.
    let attr = env.getattr(ino);
    assert_eq!(attr.size, 11 * BK);
    assert!(attr.blocks > 0);
    env.release(fh);
}

#[test]
fn read_beyond_eof_is_empty() {
    let (env, ino, fh) = simple_env();
    let buf = randbuf(100, 4);
    env.write_read(ino, &buf, 0);
    let back = env.fs().read_op(ino, 100, 50).unwrap();
    assert!(back.is_empty());
    let back = env.fs().read_op(ino, 4096, 50).unwrap();
    assert!(back.is_empty());
    env.release(fh);
}

#[test]
fn short_read_at_eof() {
    let (env, ino, fh) = simple_env();
    let buf = randbuf(100, 5);
    env.write_read(ino, &buf, 0);
    let back = env.fs().read_op(ino, 90, 50).unwrap();
    assert_eq!(back, &buf[90..]);
    env.release(fh);
}

#[test]
fn sparse_tera_file() {
    let (env, ino, fh) = simple_env();
    env.truncate(ino, 4 * TERA);
    assert_eq!(env.getattr(ino).size, 4 * TERA);
    env.write_read(ino, b"X", 3 * TERA);
    let attr = env.getattr(ino);
    // One data leaf plus the interior path; far below the file span.
    assert!(attr.blocks <= 8 * (BK / 512));
    assert_eq!(env.lseek_data(ino, 0), common::off_baligned(3 * TERA));
    assert_eq!(env.lseek_hole(ino, 3 * TERA), 3 * TERA + BK);
    env.release(fh);
}

#[test]
fn write_beyond_filesize_max_fails() {
    let (env, ino, fh) = simple_env();
    let err = env.fs().write_op(ino, FILESIZE_MAX, b"x").unwrap_err();
    assert!(matches!(err, Error::FileTooBig));
    let err = env.fs().write_op(ino, FILESIZE_MAX - 1, b"xy").unwrap_err();
    assert!(matches!(err, Error::FileTooBig));
    env.release(fh);
}

#[test]
fn empty_write_is_noop() {
    let (env, ino, fh) = simple_env();
    let n = env.fs().write_op(ino, 0, &[]).unwrap();
    assert_eq!(n, 0);
    assert_eq!(env.getattr(ino).size, 0);
    env.release(fh);
}

#[test]
fn block_accounting_tracks_leaves() {
    let (env, ino, fh) = simple_env();
    let before = env.statfs().nbk_free;
    let buf = randbuf(4 * BK as usize, 6);
    env.write_read(ino, &buf, 0);
    let after = env.statfs().nbk_free;
    assert!(before - after >= 4);
    let attr = env.getattr(ino);
    assert!(attr.blocks >= 4 * (BK / 512));
    env.release(fh);
}
