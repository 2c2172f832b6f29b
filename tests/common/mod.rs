//! Shared fixture for the filesystem-level test suites: a temp volume,
//! a mounted context and op-level helpers in the shape the suites use
//! them.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use volufs::cache::Cache;
use volufs::codec::PlainCodec;
use volufs::fs::inode::Cred;
use volufs::fs::{Attr, Fsys};
use volufs::param::{AG_SIZE, BK_SIZE};
use volufs::pstor::Pstor;
use volufs::volume::Volume;

pub const BK: u64 = BK_SIZE as u64;
pub const MEGA: u64 = 1 << 20;
pub const GIGA: u64 = 1 << 30;
pub const TERA: u64 = 1 << 40;

pub struct FsEnv {
    pub fsys: Option<Arc<Fsys>>,
    pub path: PathBuf,
}

pub fn cred() -> Cred {
    Cred { uid: 0, gid: 0 }
}

fn mount_at(path: &PathBuf) -> Arc<Fsys> {
    let vol = Volume::open(path, Box::new(PlainCodec)).expect("open volume");
    let cache = Arc::new(Cache::new(4096));
    let pstor = Arc::new(Pstor::new(vol, cache));
    Fsys::mount(pstor).expect("mount")
}

impl FsEnv {
    pub fn new() -> FsEnv {
        FsEnv::with_ags(4)
    }

    pub fn with_ags(nag: u64) -> FsEnv {
        let mut path = std::env::temp_dir();
        path.push(format!("volufs-ut-{}", uuid::Uuid::new_v4()));
        let _ = volufs::mkfs::mkfs(&path, nag * AG_SIZE, Box::new(PlainCodec)).expect("mkfs");
        FsEnv { fsys: Some(mount_at(&path)), path }
    }

    pub fn fs(&self) -> &Arc<Fsys> {
        self.fsys.as_ref().expect("mounted")
    }

    pub fn root(&self) -> u64 {
        self.fs().root_ino()
    }

    /// Unmount and mount again; observable state must survive.
    pub fn reload(&mut self) {
        let fsys = self.fsys.take().expect("mounted");
        fsys.unmount().expect("unmount");
        drop(fsys);
        self.fsys = Some(mount_at(&self.path));
    }

    // ------------------------------------------------------------------
    // Op helpers

    pub fn mkdir(&self, parent: u64, name: &str) -> u64 {
        self.fs()
            .mkdir_op(parent, name.as_bytes(), 0o755, cred())
            .expect("mkdir")
            .ino
    }

    pub fn create(&self, parent: u64, name: &str) -> (u64, u64) {
        let (attr, fh) = self
            .fs()
            .create_op(parent, name.as_bytes(), 0o644, 0, cred())
            .expect("create");
        (attr.ino, fh)
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Option<Attr> {
        match self.fs().lookup_op(parent, name.as_bytes(), cred()) {
            Ok(attr) => Some(attr),
            Err(volufs::Error::NotFound) => None,
            Err(err) => panic!("lookup: {}", err),
        }
    }

    pub fn getattr(&self, ino: u64) -> Attr {
        self.fs().getattr_op(ino).expect("getattr")
    }

    pub fn write_read(&self, ino: u64, buf: &[u8], off: u64) {
        let n = self.fs().write_op(ino, off, buf).expect("write");
        assert_eq!(n, buf.len());
        let back = self.fs().read_op(ino, off, buf.len()).expect("read");
        assert_eq!(back, buf, "read-back mismatch at offset {}", off);
    }

    pub fn read_zeros(&self, ino: u64, off: u64, len: usize) {
        let back = self.fs().read_op(ino, off, len).expect("read");
        assert!(back.iter().all(|b| *b == 0), "expected zeros at {}", off);
    }

    pub fn truncate(&self, ino: u64, size: u64) {
        use volufs::fs::{SetAttr, SetAttrSet};
        let sa = SetAttr {
            set: SetAttrSet::SIZE,
            mode: 0,
            uid: 0,
            gid: 0,
            size,
            atime: (0, 0),
            mtime: (0, 0),
        };
        let _ = self.fs().setattr_op(ino, &sa, cred()).expect("truncate");
    }

    pub fn unlink(&self, parent: u64, name: &str) {
        self.fs().unlink_op(parent, name.as_bytes(), cred()).expect("unlink");
    }

    pub fn rmdir(&self, parent: u64, name: &str) {
        self.fs().rmdir_op(parent, name.as_bytes(), cred()).expect("rmdir");
    }

    pub fn release(&self, fh: u64) {
        self.fs().release_op(fh).expect("release");
    }

    pub fn statfs(&self) -> volufs::fs::FsStat {
        self.fs().statfs().expect("statfs")
    }

    pub fn lseek_data(&self, ino: u64, off: u64) -> u64 {
        self.fs().lseek_op(ino, off, libc::SEEK_DATA as u32).expect("seek data")
    }

    pub fn lseek_hole(&self, ino: u64, off: u64) -> u64 {
        self.fs().lseek_op(ino, off, libc::SEEK_HOLE as u32).expect("seek hole")
    }
}

impl Drop for FsEnv {
    fn drop(&mut self) {
        if let Some(fsys) = self.fsys.take() {
            let _ = fsys.unmount();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Deterministic pseudo-random payload for read-back checks.
pub fn randbuf(len: usize, seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut x = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    while out.len() < len {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        out.extend_from_slice(&x.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// Offset rounded down to the containing block.
pub fn off_baligned(off: u64) -> u64 {
    off - off % BK
}
