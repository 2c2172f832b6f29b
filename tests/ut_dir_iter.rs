//! Readdir iteration: cursors, completeness, stability.

mod common;

use std::collections::HashSet;

use common::FsEnv;

/// Walks the directory stream to the end using each entry's cursor.
fn readdir_all(env: &FsEnv, ino: u64, chunk: usize) -> Vec<(String, u64)> {
    let mut out = Vec::new();
    let mut cursor = 0u64;
    loop {
        let batch = env.fs().readdir_op(ino, cursor, chunk).unwrap();
        if batch.is_empty() {
            break;
        }
        for de in &batch {
            out.push((String::from_utf8_lossy(&de.name).into_owned(), de.ino));
        }
        cursor = batch.last().unwrap().next;
    }
    out
}

#[test]
fn empty_directory_lists_dot_entries() {
    let env = FsEnv::new();
    let root = env.root();
    let dino = env.mkdir(root, "empty");
    let entries = readdir_all(&env, dino, 16);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, ".");
    assert_eq!(entries[0].1, dino);
    assert_eq!(entries[1].0, "..");
    assert_eq!(entries[1].1, root);
}

#[test]
fn all_entries_emitted_once() {
    let env = FsEnv::new();
    let root = env.root();
    let dino = env.mkdir(root, "many");
    let count = 500;
    for i in 0..count {
        let (_, fh) = env.create(dino, &format!("e{:04}", i));
        env.release(fh);
    }
    for chunk in [1usize, 7, 64, 1024] {
        let entries = readdir_all(&env, dino, chunk);
        let names: HashSet<&String> = entries.iter().map(|(n, _)| n).collect();
        assert_eq!(entries.len(), count + 2, "chunk {}", chunk);
        assert_eq!(names.len(), count + 2, "duplicates with chunk {}", chunk);
        for i in 0..count {
            assert!(names.contains(&format!("e{:04}", i)));
        }
    }
}

#[test]
fn emitted_entries_survive_removal_of_others() {
    let env = FsEnv::new();
    let root = env.root();
    let dino = env.mkdir(root, "mix");
    let count = 100;
    for i in 0..count {
        let (_, fh) = env.create(dino, &format!("m{:03}", i));
        env.release(fh);
    }
    // Read half the stream, remove already-emitted entries, continue.
    let first = env.fs().readdir_op(dino, 0, count / 2).unwrap();
    let cursor = first.last().unwrap().next;
    let mut removed = 0;
    for de in &first {
        if de.name != b"." && de.name != b".." {
            env.unlink(dino, &String::from_utf8_lossy(&de.name));
            removed += 1;
        }
    }
    let mut rest = Vec::new();
    let mut c = cursor;
    loop {
        let batch = env.fs().readdir_op(dino, c, 64).unwrap();
        if batch.is_empty() {
            break;
        }
        rest.extend(batch.iter().map(|de| de.name.clone()));
        c = batch.last().unwrap().next;
    }
    // Entries not yet emitted are all still there, exactly once.
    let seen: HashSet<Vec<u8>> = rest.iter().cloned().collect();
    assert_eq!(seen.len(), rest.len());
    assert_eq!(rest.len(), count - removed, "remaining stream must cover the untouched half");
}

#[test]
fn readdir_of_file_fails() {
    let env = FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "f");
    env.release(fh);
    assert!(env.fs().readdir_op(ino, 0, 10).is_err());
}

#[test]
fn pseudo_root_is_hidden_but_resolvable() {
    let env = FsEnv::new();
    let root = env.root();
    let entries = readdir_all(&env, root, 64);
    assert!(entries.iter().all(|(name, _)| name != ".volufs"));
    let attr = env.lookup(root, ".volufs").unwrap();
    assert_eq!(attr.ino, volufs::fs::pseudo_root_ino());
}
