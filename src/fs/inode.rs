//! Inodes.
//!
//! An inode describes a single unnamed file: type, ownership, link
//! count, timestamps, and the roots of its directory table, file-map
//! and xattr chain. The on-disk inode occupies one whole block, so the
//! short symlink target and the inline xattr area live inside it.
//!
//! Life cycle: an inode is created by the operation that names it
//! (create, mkdir, symlink, link target of mknod), destroyed when its
//! link count reaches zero — immediately if nothing holds it open,
//! otherwise deferred to the last close or the adaptor's final forget.

use std::sync::Arc;

use bitflags::bitflags;
use log::debug;

use crate::cache::Centry;
use crate::error::{Error, Result};
use crate::layout::{DInode, DTimes};
use crate::param::{BK_SIZE, LINK_MAX, SYMLNK_INLINE_MAX, SYMLNK_MAX};
use crate::vaddr::{ino_of, is_pseudo_ino, Kind};

use super::{unix_now, Fsys};

bitflags! {
    /// Which attributes a setattr request carries.
    pub struct SetAttrSet: u32 {
        const MODE      = 1 << 0;
        const UID       = 1 << 1;
        const GID       = 1 << 2;
        const SIZE      = 1 << 3;
        const ATIME     = 1 << 4;
        const MTIME     = 1 << 5;
        const ATIME_NOW = 1 << 6;
        const MTIME_NOW = 1 << 7;
    }
}

/// Decoded setattr request.
#[derive(Debug, Clone, Copy)]
pub struct SetAttr {
    pub set: SetAttrSet,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: (u64, u64),
    pub mtime: (u64, u64),
}

/// Request credentials, carried on every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
}

impl Cred {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// POSIX attribute snapshot handed back to the adaptor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Attr {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    /// 512-byte units, as stat reports them.
    pub blocks: u64,
    pub blksize: u32,
    pub atime: (u64, u64),
    pub mtime: (u64, u64),
    pub ctime: (u64, u64),
    pub btime: (u64, u64),
}

pub fn mode_is_dir(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFDIR
}

pub fn mode_is_reg(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFREG
}

pub fn mode_is_symlink(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFLNK
}

/// Attribute snapshot of an on-disk inode.
pub fn attr_of(d: &DInode) -> Attr {
    Attr {
        ino: d.ino,
        mode: d.mode,
        nlink: d.nlink,
        uid: d.uid,
        gid: d.gid,
        rdev: d.rdev,
        size: d.size,
        blocks: d.nblocks * (BK_SIZE as u64 / 512),
        blksize: BK_SIZE as u32,
        atime: (d.times.atime_sec, d.times.atime_nsec),
        mtime: (d.times.mtime_sec, d.times.mtime_nsec),
        ctime: (d.times.ctime_sec, d.times.ctime_nsec),
        btime: (d.times.btime_sec, d.times.btime_nsec),
    }
}

pub fn touch_ctime(d: &mut DInode) {
    let (sec, nsec) = unix_now();
    d.times.ctime_sec = sec;
    d.times.ctime_nsec = nsec;
}

pub fn touch_mtime_ctime(d: &mut DInode) {
    let (sec, nsec) = unix_now();
    d.times.mtime_sec = sec;
    d.times.mtime_nsec = nsec;
    d.times.ctime_sec = sec;
    d.times.ctime_nsec = nsec;
}

fn times_now() -> DTimes {
    let (sec, nsec) = unix_now();
    DTimes {
        atime_sec: sec,
        atime_nsec: nsec,
        mtime_sec: sec,
        mtime_nsec: nsec,
        ctime_sec: sec,
        ctime_nsec: nsec,
        btime_sec: sec,
        btime_nsec: nsec,
    }
}

impl Fsys {
    /// Creates a fresh inode node of the given mode under `parent`.
    pub fn inode_new(
        &self,
        mode: u32,
        cred: Cred,
        parent: u64,
        rdev: u64,
    ) -> Result<Arc<Centry>> {
        let va = self.alloc_va(Kind::Inode, 0)?;
        let ino = ino_of(va);
        let mut d: DInode = zerocopy::FromBytes::new_zeroed();
        d.ino = ino;
        d.parent = parent;
        d.mode = mode;
        d.nlink = if mode_is_dir(mode) { 2 } else { 1 };
        d.uid = cred.uid;
        d.gid = cred.gid;
        d.rdev = rdev;
        d.times = times_now();
        if mode_is_dir(mode) {
            // Per-directory hash seed; adversarial name sets cannot be
            // precomputed against it.
            let raw = uuid::Uuid::new_v4();
            let mut seed = [0u8; 8];
            seed.copy_from_slice(&raw.as_bytes()[..8]);
            d.dir_seed = u64::from_le_bytes(seed);
        }
        let entry = self.cache().insert_new(va, crate::node::Node::Inode(Box::new(d)));
        entry.set_owner(ino);
        entry.mark_dirty();
        debug!("new inode {} mode {:o}", ino, mode);
        Ok(entry)
    }

    pub fn getattr_op(&self, ino: u64) -> Result<Attr> {
        if is_pseudo_ino(ino) {
            return crate::server::pseudo::getattr(self, ino);
        }
        let e = self.require_inode(ino)?;
        self.with_inode(&e, attr_of)
    }

    pub fn setattr_op(&self, ino: u64, sa: &SetAttr, cred: Cred) -> Result<Attr> {
        if is_pseudo_ino(ino) {
            return Err(Error::NotSupported);
        }
        let e = self.require_inode(ino)?;
        let (owner_uid, mode) = self.with_inode(&e, |d| (d.uid, d.mode))?;
        if sa.set.intersects(SetAttrSet::MODE | SetAttrSet::UID | SetAttrSet::GID)
            && !cred.is_root()
            && cred.uid != owner_uid
        {
            return Err(Error::NotOwner);
        }
        if sa.set.contains(SetAttrSet::SIZE) {
            if mode_is_dir(mode) {
                return Err(Error::IsDir);
            }
            if !mode_is_reg(mode) {
                return Err(Error::Invalid);
            }
            self.ftruncate(&e, sa.size)?;
        }
        self.with_inode_mut(&e, |d| {
            if sa.set.contains(SetAttrSet::MODE) {
                d.mode = (d.mode & libc::S_IFMT) | (sa.mode & !libc::S_IFMT);
            }
            if sa.set.contains(SetAttrSet::UID) {
                d.uid = sa.uid;
            }
            if sa.set.contains(SetAttrSet::GID) {
                d.gid = sa.gid;
            }
            if sa.set.contains(SetAttrSet::ATIME) {
                d.times.atime_sec = sa.atime.0;
                d.times.atime_nsec = sa.atime.1;
            }
            if sa.set.contains(SetAttrSet::MTIME) {
                d.times.mtime_sec = sa.mtime.0;
                d.times.mtime_nsec = sa.mtime.1;
            }
            if sa.set.intersects(SetAttrSet::ATIME_NOW | SetAttrSet::MTIME_NOW) {
                let (sec, nsec) = unix_now();
                if sa.set.contains(SetAttrSet::ATIME_NOW) {
                    d.times.atime_sec = sec;
                    d.times.atime_nsec = nsec;
                }
                if sa.set.contains(SetAttrSet::MTIME_NOW) {
                    d.times.mtime_sec = sec;
                    d.times.mtime_nsec = nsec;
                }
            }
            touch_ctime(d);
            attr_of(d)
        })
    }

    pub fn open_op(&self, ino: u64, flags: u32) -> Result<u64> {
        if is_pseudo_ino(ino) {
            let _ = crate::server::pseudo::getattr(self, ino)?;
            return self.handle_open(ino, flags, None);
        }
        let e = self.require_inode(ino)?;
        let mode = self.with_inode(&e, |d| d.mode)?;
        if mode_is_dir(mode) && (flags & libc::O_ACCMODE as u32) != libc::O_RDONLY as u32 {
            return Err(Error::IsDir);
        }
        if flags & libc::O_TRUNC as u32 != 0 && mode_is_reg(mode) {
            self.ftruncate(&e, 0)?;
        }
        self.handle_open(ino, flags, Some(e))
    }

    pub fn release_op(&self, fh: u64) -> Result<()> {
        if let Some(orphan) = self.handle_release(fh)? {
            self.reap_push(orphan);
        }
        Ok(())
    }

    pub fn forget_op(&self, ino: u64, nlookup: u64) -> Result<()> {
        if is_pseudo_ino(ino) {
            return Ok(());
        }
        if self.nlookup_forget(ino, nlookup) && !self.is_open(ino) {
            if let Some(e) = self.cache().lookup(crate::vaddr::va_of_ino(ino)) {
                let nlink = self.with_inode(&e, |d| d.nlink)?;
                if nlink == 0 {
                    self.reap_push(ino);
                }
            }
        }
        Ok(())
    }

    /// Reclaims everything an inode owns, then the inode block itself.
    pub fn destroy_inode(&self, e: &Centry) -> Result<()> {
        let (ino, mode, sym_leaf) =
            self.with_inode(e, |d| (d.ino, d.mode, d.sym_leaf))?;
        debug!("destroy inode {}", ino);
        if mode_is_reg(mode) {
            self.ftruncate(e, 0)?;
        }
        if mode_is_dir(mode) {
            self.dir_drop_all(e)?;
        }
        self.xattr_drop_all(e)?;
        if mode_is_symlink(mode) && !sym_leaf.is_hole() {
            if let Some(va) = crate::vaddr::Vaddr::from_u64(sym_leaf.ptr) {
                self.free_va(va)?;
            }
        }
        self.drop_node(e)
    }

    /// Bumps the link count, guarding the configured ceiling.
    pub fn nlink_bump(&self, e: &Centry) -> Result<()> {
        let nlink = self.with_inode(e, |d| d.nlink)?;
        if nlink >= LINK_MAX {
            return Err(Error::MLink);
        }
        self.with_inode_mut(e, |d| {
            d.nlink += 1;
            touch_ctime(d);
        })
    }

    pub fn nlink_drop(&self, e: &Centry) -> Result<u32> {
        self.with_inode_mut(e, |d| {
            debug_assert!(d.nlink > 0);
            d.nlink -= 1;
            touch_ctime(d);
            d.nlink
        })
    }

    // ------------------------------------------------------------------
    // Symlinks

    /// Stores a symlink target: inline when short, in one leaf block
    /// otherwise.
    pub fn symlink_set_target(&self, e: &Centry, target: &[u8]) -> Result<()> {
        if target.is_empty() || target.len() > SYMLNK_MAX {
            return Err(Error::NameTooLong);
        }
        if target.len() <= SYMLNK_INLINE_MAX {
            return self.with_inode_mut(e, |d| {
                d.sym_len = target.len() as u32;
                d.sym_inline[..target.len()].copy_from_slice(target);
                d.size = target.len() as u64;
            });
        }
        let ino = self.with_inode(e, |d| d.ino)?;
        let mut payload = crate::codec::new_bkbuf();
        payload[..target.len()].copy_from_slice(target);
        let crc = crate::crc::crc32(&payload[..]);
        let leaf = self.new_node(Kind::Leaf, ino, crate::node::Node::Leaf(payload))?;
        self.with_inode_mut(e, |d| {
            d.sym_len = target.len() as u32;
            d.sym_leaf = crate::layout::DChild { ptr: leaf.va.to_u64(), crc, flags: 0 };
            d.size = target.len() as u64;
            d.nblocks += 1;
        })
    }

    pub fn readlink_op(&self, ino: u64) -> Result<Vec<u8>> {
        let e = self.require_inode(ino)?;
        let (mode, len, inline, leaf_slot) = self.with_inode(&e, |d| {
            (d.mode, d.sym_len as usize, d.sym_inline, d.sym_leaf)
        })?;
        if !mode_is_symlink(mode) {
            return Err(Error::Invalid);
        }
        if len <= SYMLNK_INLINE_MAX {
            return Ok(inline[..len].to_vec());
        }
        let va = crate::vaddr::Vaddr::from_u64(leaf_slot.ptr)
            .ok_or(Error::CorruptData(e.va))?;
        let leaf = self.require(va)?;
        let guard = leaf.node();
        match guard.as_ref() {
            Some(crate::node::Node::Leaf(bk)) => Ok(bk[..len].to_vec()),
            _ => Err(Error::WrongKind(va)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_predicates() {
        assert!(mode_is_dir(libc::S_IFDIR | 0o755));
        assert!(mode_is_reg(libc::S_IFREG | 0o644));
        assert!(mode_is_symlink(libc::S_IFLNK | 0o777));
        assert!(!mode_is_dir(libc::S_IFREG | 0o644));
    }

    #[test]
    fn attr_blocks_in_512_units() {
        let mut d: DInode = zerocopy::FromBytes::new_zeroed();
        d.nblocks = 3;
        let attr = attr_of(&d);
        assert_eq!(attr.blocks, 3 * (BK_SIZE as u64 / 512));
        assert_eq!(attr.blksize, BK_SIZE as u32);
    }
}
