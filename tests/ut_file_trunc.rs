//! Truncate semantics: shrink, extend, tail zeroing, space release.

mod common;

use common::{randbuf, FsEnv, BK, MEGA};

fn file_env() -> (FsEnv, u64, u64) {
    let env = FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "t");
    (env, ino, fh)
}

#[test]
fn shrink_then_read_zeros() {
    let (env, ino, fh) = file_env();
    let buf = randbuf(2 * BK as usize, 1);
    env.write_read(ino, &buf, 0);
    env.truncate(ino, BK / 2);
    assert_eq!(env.getattr(ino).size, BK / 2);
    // Extend again: the old tail must not resurface.
    env.truncate(ino, 2 * BK);
    env.read_zeros(ino, BK / 2, (BK / 2) as usize);
    let back = env.fs().read_op(ino, 0, (BK / 2) as usize).unwrap();
    assert_eq!(back, &buf[..(BK / 2) as usize]);
    env.release(fh);
}

#[test]
fn truncate_to_zero_releases_blocks() {
    let (env, ino, fh) = file_env();
    let free0 = env.statfs().nbk_free;
    let buf = randbuf(8 * BK as usize, 2);
    env.write_read(ino, &buf, 0);
    assert!(env.statfs().nbk_free < free0);
    env.truncate(ino, 0);
    assert_eq!(env.getattr(ino).size, 0);
    assert_eq!(env.getattr(ino).blocks, 0);
    assert_eq!(env.statfs().nbk_free, free0);
    env.release(fh);
}

#[test]
fn extend_makes_holes() {
    let (env, ino, fh) = file_env();
    let blocks0 = env.getattr(ino).blocks;
    env.truncate(ino, 100 * MEGA);
    let attr = env.getattr(ino);
    assert_eq!(attr.size, 100 * MEGA);
    assert_eq!(attr.blocks, blocks0);
    env.read_zeros(ino, 99 * MEGA, 4096);
    env.release(fh);
}

#[test]
fn partial_tail_is_zeroed() {
    let (env, ino, fh) = file_env();
    let buf = randbuf(BK as usize, 3);
    env.write_read(ino, &buf, 0);
    let cut = 1000u64;
    env.truncate(ino, cut);
    env.truncate(ino, BK);
    let back = env.fs().read_op(ino, 0, BK as usize).unwrap();
    assert_eq!(&back[..cut as usize], &buf[..cut as usize]);
    assert!(back[cut as usize..].iter().all(|b| *b == 0));
    env.release(fh);
}

#[test]
fn write_after_truncate_roundtrips() {
    let (env, ino, fh) = file_env();
    for round in 0..8 {
        let buf = randbuf((BK as usize) * (round % 3 + 1), round as u64);
        env.write_read(ino, &buf, (round as u64) * 3 * BK);
        env.truncate(ino, (round as u64) * BK);
    }
    env.release(fh);
}

#[test]
fn shrink_deep_tree() {
    let (env, ino, fh) = file_env();
    // Far offset forces a tall tree; shrinking must dismantle it.
    let buf = randbuf(BK as usize, 9);
    env.write_read(ino, &buf, 700 * MEGA);
    let free_mid = env.statfs().nbk_free;
    env.truncate(ino, 0);
    assert!(env.statfs().nbk_free > free_mid);
    assert_eq!(env.getattr(ino).blocks, 0);
    env.release(fh);
}
