//! SEEK_DATA / SEEK_HOLE and fiemap extent reporting.

mod common;

use common::{off_baligned, randbuf, FsEnv, BK, GIGA, MEGA, TERA};
use volufs::Error;

fn file_env() -> (FsEnv, u64, u64) {
    let env = FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "s");
    (env, ino, fh)
}

fn lseek_simple_at(off: u64) {
    let (env, ino, fh) = file_env();
    let step = 2 * BK;
    env.truncate(ino, off + step + 1);
    let size = env.getattr(ino).size;
    // All-hole file: data search lands at the end.
    assert_eq!(env.lseek_data(ino, 0), size);
    env.write_read(ino, b"d", off);
    assert_eq!(env.lseek_data(ino, 0), off_baligned(off));
    assert_eq!(
        off_baligned(env.lseek_data(ino, if off > 0 { off - 1 } else { 0 })),
        off_baligned(off)
    );
    assert_eq!(env.lseek_data(ino, off + step), size);
    env.truncate(ino, off + 2);
    assert_eq!(env.lseek_hole(ino, off), off + 2);
    env.release(fh);
}

#[test]
fn lseek_simple() {
    for off in [0, 1, MEGA + 1, GIGA - 3, TERA + 5] {
        lseek_simple_at(off);
    }
}

#[test]
fn lseek_alternating_holes() {
    let (env, ino, fh) = file_env();
    let cnt = 10u64;
    let buf = randbuf(BK as usize, 11);
    for i in 1..=cnt {
        let off = 2 * BK * i;
        env.write_read(ino, &buf, off);
        // Data written at the end: the hole after it is EOF.
        assert_eq!(env.lseek_hole(ino, off), env.getattr(ino).size);
    }
    for i in 1..=cnt {
        let off = 2 * BK * i;
        assert_eq!(env.lseek_data(ino, off), off);
        assert_eq!(env.lseek_hole(ino, off), off + BK);
    }
    env.release(fh);
}

#[test]
fn lseek_beyond_eof_fails() {
    let (env, ino, fh) = file_env();
    env.write_read(ino, b"abc", 0);
    let err = env.fs().lseek_op(ino, 3, libc::SEEK_DATA as u32).unwrap_err();
    assert!(matches!(err, Error::NoData));
    let err = env.fs().lseek_op(ino, 100, libc::SEEK_HOLE as u32).unwrap_err();
    assert!(matches!(err, Error::NoData));
    env.release(fh);
}

#[test]
fn unwritten_extents_count_as_data() {
    let (env, ino, fh) = file_env();
    env.truncate(ino, 16 * BK);
    env.fs()
        .fallocate_op(ino, libc::FALLOC_FL_KEEP_SIZE, 4 * BK, 2 * BK)
        .unwrap();
    assert_eq!(env.lseek_data(ino, 0), 4 * BK);
    assert_eq!(env.lseek_hole(ino, 4 * BK), 6 * BK);
    env.release(fh);
}

#[test]
fn fiemap_coalesces_contiguous_leaves() {
    let (env, ino, fh) = file_env();
    let buf = randbuf(4 * BK as usize, 12);
    env.write_read(ino, &buf, 0);
    let extents = env.fs().fiemap_op(ino, 0, 4 * BK).unwrap();
    assert!(!extents.is_empty());
    let total: u64 = extents.iter().map(|e| e.length).sum();
    assert_eq!(total, 4 * BK);
    assert_eq!(extents[0].logical, 0);
    // Consecutive allocations of a fresh file are physically adjacent,
    // so they must fold into few extents.
    assert!(extents.len() <= 2, "extents: {:?}", extents);
    env.release(fh);
}

#[test]
fn fiemap_skips_holes() {
    let (env, ino, fh) = file_env();
    let buf = randbuf(BK as usize, 13);
    env.write_read(ino, &buf, 0);
    env.write_read(ino, &buf, 5 * BK);
    let extents = env.fs().fiemap_op(ino, 0, 6 * BK).unwrap();
    assert_eq!(extents.len(), 2);
    assert_eq!(extents[0].logical, 0);
    assert_eq!(extents[0].length, BK);
    assert_eq!(extents[1].logical, 5 * BK);
    assert_eq!(extents[1].length, BK);
    env.release(fh);
}

#[test]
fn fiemap_window() {
    let (env, ino, fh) = file_env();
    let buf = randbuf(8 * BK as usize, 14);
    env.write_read(ino, &buf, 0);
    let extents = env.fs().fiemap_op(ino, 2 * BK, 2 * BK).unwrap();
    let total: u64 = extents.iter().map(|e| e.length).sum();
    assert!(total >= 2 * BK);
    assert!(extents[0].logical >= 2 * BK);
    env.release(fh);
}
