//! Directories.
//!
//! A directory is an inode holding a table of hash buckets; each bucket
//! heads a chain of DNODEs whose heaps store variable-length entry
//! records, ext2-style. Removal tombstones a record in place so that
//! readdir cursors stay stable; a chain-tail node that empties is
//! unlinked and freed. The name hash is FNV-1a mixed with a
//! per-directory seed persisted in the inode, so adversarial name sets
//! cannot be precomputed to collapse a directory onto one bucket.

use std::sync::Arc;

use log::debug;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::Centry;
use crate::error::{Error, Result};
use crate::layout::{DDirent, DDnode, DIRENT_HDR_SIZE};
use crate::node::Node;
use crate::param::{DIR_NBUCKETS, DNODE_HEAP_SIZE, NAME_MAX};
use crate::vaddr::{is_pseudo_ino, Kind, Vaddr};

use super::inode::{
    attr_of, mode_is_dir, mode_is_symlink, touch_ctime, touch_mtime_ctime, Attr, Cred,
};
use super::{Fsys, PSEUDO_ROOT_NAME};

/// Cursor bit marking positions past the synthetic "." and ".."
/// entries.
const CURSOR_REAL: u64 = 1 << 63;

/// One readdir entry handed to the adaptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirentOut {
    pub name: Vec<u8>,
    pub ino: u64,
    pub dtype: u8,
    /// Cursor addressing the entry after this one.
    pub next: u64,
}

/// Seeded FNV-1a over the entry name.
pub fn name_hash(seed: u64, name: &[u8]) -> u64 {
    let mut h = 0xCBF2_9CE4_8422_2325u64 ^ seed;
    for b in name {
        h ^= *b as u64;
        h = h.wrapping_mul(0x1_0000_01B3);
    }
    h
}

fn bucket_of(hash: u64) -> usize {
    (hash % DIR_NBUCKETS as u64) as usize
}

fn rec_len_for(name_len: usize) -> u16 {
    ((DIRENT_HDR_SIZE + name_len + 7) & !7) as u16
}

pub fn dtype_of_mode(mode: u32) -> u8 {
    if mode_is_dir(mode) {
        libc::DT_DIR
    } else if mode_is_symlink(mode) {
        libc::DT_LNK
    } else {
        libc::DT_REG
    }
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
        return Err(Error::Invalid);
    }
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

/// Reads the record at `off`, returning its header and name.
fn dirent_at(d: &DDnode, off: usize) -> Option<(DDirent, &[u8])> {
    let end = d.heap_end as usize;
    if off + DIRENT_HDR_SIZE > end {
        return None;
    }
    let hdr = DDirent::read_from_prefix(&d.heap[off..])?;
    let rec_len = hdr.rec_len as usize;
    if rec_len < DIRENT_HDR_SIZE || off + rec_len > end {
        return None;
    }
    let name_end = off + DIRENT_HDR_SIZE + hdr.name_len as usize;
    if name_end > off + rec_len {
        return None;
    }
    let name = &d.heap[off + DIRENT_HDR_SIZE..name_end];
    Some((hdr, name))
}

/// Where a new record can go inside one dnode.
enum Space {
    Reuse(usize),
    Append(usize),
    None,
}

fn find_space(d: &DDnode, need: u16) -> Space {
    let mut off = 0usize;
    while let Some((hdr, _)) = dirent_at(d, off) {
        if hdr.ino == 0 && hdr.rec_len >= need {
            return Space::Reuse(off);
        }
        off += hdr.rec_len as usize;
    }
    if d.heap_end as usize + need as usize <= DNODE_HEAP_SIZE {
        Space::Append(d.heap_end as usize)
    } else {
        Space::None
    }
}

fn put_dirent(d: &mut DDnode, off: usize, rec_len: u16, ino: u64, hash: u64, dtype: u8, name: &[u8]) {
    let hdr = DDirent {
        ino,
        hash,
        rec_len,
        name_len: name.len() as u8,
        dtype,
        pad0: 0,
    };
    d.heap[off..off + DIRENT_HDR_SIZE].copy_from_slice(hdr.as_bytes());
    d.heap[off + DIRENT_HDR_SIZE..off + DIRENT_HDR_SIZE + name.len()].copy_from_slice(name);
    d.nentries += 1;
}

impl Fsys {
    fn with_dnode<R>(&self, e: &Centry, f: impl FnOnce(&DDnode) -> R) -> Result<R> {
        let guard = e.node();
        match guard.as_ref() {
            Some(Node::Dnode(d)) => Ok(f(d)),
            _ => Err(Error::WrongKind(e.va)),
        }
    }

    fn with_dnode_mut<R>(&self, e: &Centry, f: impl FnOnce(&mut DDnode) -> R) -> Result<R> {
        let out = {
            let mut guard = e.node_mut();
            match guard.as_mut() {
                Some(Node::Dnode(d)) => f(d),
                _ => return Err(Error::WrongKind(e.va)),
            }
        };
        let _ = e.bump_generation();
        e.mark_dirty();
        Ok(out)
    }

    fn require_dir(&self, ino: u64) -> Result<Arc<Centry>> {
        let e = self.require_inode(ino)?;
        if !self.with_inode(&e, |d| mode_is_dir(d.mode))? {
            return Err(Error::NotDir);
        }
        Ok(e)
    }

    fn dnode_new(&self, dir_ino: u64, bucket: usize) -> Result<Arc<Centry>> {
        let mut d: DDnode = FromBytes::new_zeroed();
        d.bucket = bucket as u32;
        let e = self.new_node(Kind::Dnode, dir_ino, Node::Dnode(Box::new(d)))?;
        let ie = self.require_inode(dir_ino)?;
        self.with_inode_mut(&ie, |i| i.nblocks += 1)?;
        Ok(e)
    }

    /// Finds `name` in the directory; `(ino, dtype)` on a hit.
    pub fn dir_lookup(&self, die: &Centry, name: &[u8]) -> Result<Option<(u64, u8)>> {
        let (seed, buckets) = self.with_inode(die, |d| (d.dir_seed, d.dir_buckets))?;
        let hash = name_hash(seed, name);
        let mut link = buckets[bucket_of(hash)];
        while link != 0 {
            let va = Vaddr::from_u64(link).ok_or(Error::CorruptData(die.va))?;
            let de = self.require(va)?;
            let found = self.with_dnode(&de, |d| {
                let mut off = 0usize;
                while let Some((hdr, rec_name)) = dirent_at(d, off) {
                    if hdr.ino != 0 && hdr.hash == hash && rec_name == name {
                        return Some((hdr.ino, hdr.dtype));
                    }
                    off += hdr.rec_len as usize;
                }
                None
            })?;
            if found.is_some() {
                return Ok(found);
            }
            link = self.with_dnode(&de, |d| d.next)?;
        }
        Ok(None)
    }

    /// Adds an entry, extending the bucket chain when every node of it
    /// is full.
    fn dir_insert(&self, die: &Centry, name: &[u8], ino: u64, dtype: u8) -> Result<()> {
        let (dir_ino, seed) = self.with_inode(die, |d| (d.ino, d.dir_seed))?;
        let hash = name_hash(seed, name);
        let bucket = bucket_of(hash);
        let need = rec_len_for(name.len());

        let head = self.with_inode(die, |d| d.dir_buckets[bucket])?;
        let mut link = head;
        let mut tail: Option<Arc<Centry>> = None;
        while link != 0 {
            let va = Vaddr::from_u64(link).ok_or(Error::CorruptData(die.va))?;
            let de = self.require(va)?;
            let space = self.with_dnode(&de, |d| match find_space(d, need) {
                Space::Reuse(off) => Some((off, false)),
                Space::Append(off) => Some((off, true)),
                Space::None => None,
            })?;
            if let Some((off, append)) = space {
                self.with_dnode_mut(&de, |d| {
                    let rec_len = if append {
                        d.heap_end += need as u32;
                        need
                    } else {
                        // Reused tombstone keeps its length.
                        dirent_at(d, off).map(|(h, _)| h.rec_len).unwrap_or(need)
                    };
                    put_dirent(d, off, rec_len, ino, hash, dtype, name);
                })?;
                self.with_inode_mut(die, |d| {
                    d.dir_nentries += 1;
                    touch_mtime_ctime(d);
                })?;
                return Ok(());
            }
            link = self.with_dnode(&de, |d| d.next)?;
            if link == 0 {
                tail = Some(de);
            }
        }

        // Chain exhausted (or empty): hang a fresh node at the tail.
        let de = self.dnode_new(dir_ino, bucket)?;
        self.with_dnode_mut(&de, |d| {
            d.heap_end = need as u32;
            put_dirent(d, 0, need, ino, hash, dtype, name);
        })?;
        match tail {
            Some(prev) => self.with_dnode_mut(&prev, |d| d.next = de.va.to_u64())?,
            None => self.with_inode_mut(die, |d| d.dir_buckets[bucket] = de.va.to_u64())?,
        }
        self.with_inode_mut(die, |d| {
            d.dir_nentries += 1;
            touch_mtime_ctime(d);
        })
    }

    /// Tombstones an entry; frees the dnode when it empties at the
    /// chain tail.
    fn dir_remove(&self, die: &Centry, name: &[u8]) -> Result<(u64, u8)> {
        let (seed, buckets) = self.with_inode(die, |d| (d.dir_seed, d.dir_buckets))?;
        let hash = name_hash(seed, name);
        let bucket = bucket_of(hash);
        let mut link = buckets[bucket];
        while link != 0 {
            let va = Vaddr::from_u64(link).ok_or(Error::CorruptData(die.va))?;
            let de = self.require(va)?;
            let hit = self.with_dnode(&de, |d| {
                let mut off = 0usize;
                while let Some((hdr, rec_name)) = dirent_at(d, off) {
                    if hdr.ino != 0 && hdr.hash == hash && rec_name == name {
                        return Some((off, hdr.ino, hdr.dtype));
                    }
                    off += hdr.rec_len as usize;
                }
                None
            })?;
            if let Some((off, ino, dtype)) = hit {
                let nentries = self.with_dnode_mut(&de, |d| {
                    if let Some((found, _)) = dirent_at(d, off) {
                        let mut hdr = found;
                        hdr.ino = 0;
                        d.heap[off..off + DIRENT_HDR_SIZE].copy_from_slice(hdr.as_bytes());
                        d.nentries -= 1;
                    }
                    d.nentries
                })?;
                if nentries == 0 {
                    self.dir_prune_bucket(die, bucket)?;
                }
                self.with_inode_mut(die, |d| {
                    d.dir_nentries -= 1;
                    touch_mtime_ctime(d);
                })?;
                return Ok((ino, dtype));
            }
            link = self.with_dnode(&de, |d| d.next)?;
        }
        Err(Error::NotFound)
    }

    /// Frees trailing empty nodes of one bucket chain. Only tails are
    /// reclaimed so that readdir cursors into live nodes stay valid;
    /// freeing cascades when an empty node becomes the new tail.
    fn dir_prune_bucket(&self, die: &Centry, bucket: usize) -> Result<()> {
        loop {
            let head = self.with_inode(die, |d| d.dir_buckets[bucket])?;
            if head == 0 {
                return Ok(());
            }
            let mut prev: Option<Arc<Centry>> = None;
            let mut cur = head;
            let tail = loop {
                let va = Vaddr::from_u64(cur).ok_or(Error::CorruptData(die.va))?;
                let de = self.require(va)?;
                let next = self.with_dnode(&de, |d| d.next)?;
                if next == 0 {
                    break de;
                }
                prev = Some(de);
                cur = next;
            };
            if self.with_dnode(&tail, |d| d.nentries)? != 0 {
                return Ok(());
            }
            match &prev {
                Some(pe) => self.with_dnode_mut(pe, |d| d.next = 0)?,
                None => self.with_inode_mut(die, |d| d.dir_buckets[bucket] = 0)?,
            }
            self.free_va(tail.va)?;
            self.with_inode_mut(die, |d| d.nblocks -= 1)?;
        }
    }

    /// Rewrites the target of an existing entry in place (rename
    /// exchange).
    fn dir_retarget(&self, die: &Centry, name: &[u8], ino: u64, dtype: u8) -> Result<u64> {
        let (seed, buckets) = self.with_inode(die, |d| (d.dir_seed, d.dir_buckets))?;
        let hash = name_hash(seed, name);
        let mut link = buckets[bucket_of(hash)];
        while link != 0 {
            let va = Vaddr::from_u64(link).ok_or(Error::CorruptData(die.va))?;
            let de = self.require(va)?;
            let hit = self.with_dnode_mut(&de, |d| {
                let mut off = 0usize;
                while let Some((hdr, rec_name)) = dirent_at(d, off) {
                    if hdr.ino != 0 && hdr.hash == hash && rec_name == name {
                        let mut new_hdr = hdr;
                        new_hdr.ino = ino;
                        new_hdr.dtype = dtype;
                        d.heap[off..off + DIRENT_HDR_SIZE]
                            .copy_from_slice(new_hdr.as_bytes());
                        return Some(hdr.ino);
                    }
                    off += hdr.rec_len as usize;
                }
                None
            })?;
            if let Some(old) = hit {
                return Ok(old);
            }
            link = self.with_dnode(&de, |d| d.next)?;
        }
        Err(Error::NotFound)
    }

    /// Frees every dnode of the directory, entries or not. Used by
    /// inode destruction after the namespace emptied.
    pub fn dir_drop_all(&self, die: &Centry) -> Result<()> {
        let buckets = self.with_inode(die, |d| d.dir_buckets)?;
        for head in buckets.iter() {
            let mut link = *head;
            while link != 0 {
                let va = Vaddr::from_u64(link).ok_or(Error::CorruptData(die.va))?;
                let de = self.require(va)?;
                link = self.with_dnode(&de, |d| d.next)?;
                self.free_va(va)?;
            }
        }
        self.with_inode_mut(die, |d| d.dir_buckets = [0; DIR_NBUCKETS])
    }

    // ------------------------------------------------------------------
    // Namespace operations

    pub fn lookup_op(&self, parent: u64, name: &[u8], _cred: Cred) -> Result<Attr> {
        if is_pseudo_ino(parent) {
            return crate::server::pseudo::lookup(self, parent, name);
        }
        check_name(name)?;
        let die = self.require_dir(parent)?;
        if name == b"." {
            return self.with_inode(&die, attr_of);
        }
        if name == b".." {
            let pp = self.with_inode(&die, |d| d.parent)?;
            let pe = self.require_inode(if pp == 0 { parent } else { pp })?;
            return self.with_inode(&pe, attr_of);
        }
        if parent == self.root_ino() && name == PSEUDO_ROOT_NAME.as_bytes() {
            return crate::server::pseudo::getattr(self, super::pseudo_root_ino());
        }
        let (ino, _) = self.dir_lookup(&die, name)?.ok_or(Error::NotFound)?;
        let e = self.require_inode(ino)?;
        let attr = self.with_inode(&e, attr_of)?;
        self.nlookup_bump(ino);
        Ok(attr)
    }

    pub fn create_op(
        &self,
        parent: u64,
        name: &[u8],
        mode: u32,
        flags: u32,
        cred: Cred,
    ) -> Result<(Attr, u64)> {
        check_name(name)?;
        let die = self.require_dir(parent)?;
        if self.dir_lookup(&die, name)?.is_some() {
            return Err(Error::Exists);
        }
        let mode = (mode & !libc::S_IFMT) | libc::S_IFREG;
        let e = self.inode_new(mode, cred, parent, 0)?;
        let ino = self.with_inode(&e, |d| d.ino)?;
        if let Err(err) = self.dir_insert(&die, name, ino, libc::DT_REG) {
            let _ = self.destroy_inode(&e);
            return Err(err);
        }
        let attr = self.with_inode(&e, attr_of)?;
        self.nlookup_bump(ino);
        let fh = self.handle_open(ino, flags, Some(e))?;
        debug!("create {:?} ino {}", String::from_utf8_lossy(name), ino);
        Ok((attr, fh))
    }

    pub fn mkdir_op(&self, parent: u64, name: &[u8], mode: u32, cred: Cred) -> Result<Attr> {
        check_name(name)?;
        let die = self.require_dir(parent)?;
        if self.dir_lookup(&die, name)?.is_some() {
            return Err(Error::Exists);
        }
        // The parent gains a `..` reference; guard its ceiling first.
        self.nlink_bump(&die)?;
        let mode = (mode & !libc::S_IFMT) | libc::S_IFDIR;
        let e = match self.inode_new(mode, cred, parent, 0) {
            Ok(e) => e,
            Err(err) => {
                let _ = self.nlink_drop(&die);
                return Err(err);
            }
        };
        let ino = self.with_inode(&e, |d| d.ino)?;
        if let Err(err) = self.dir_insert(&die, name, ino, libc::DT_DIR) {
            let _ = self.nlink_drop(&die);
            let _ = self.destroy_inode(&e);
            return Err(err);
        }
        self.nlookup_bump(ino);
        self.with_inode(&e, attr_of)
    }

    pub fn symlink_op(&self, parent: u64, name: &[u8], target: &[u8], cred: Cred) -> Result<Attr> {
        check_name(name)?;
        let die = self.require_dir(parent)?;
        if self.dir_lookup(&die, name)?.is_some() {
            return Err(Error::Exists);
        }
        let e = self.inode_new(libc::S_IFLNK | 0o777, cred, parent, 0)?;
        if let Err(err) = self
            .symlink_set_target(&e, target)
            .and_then(|_| {
                let ino = self.with_inode(&e, |d| d.ino)?;
                self.dir_insert(&die, name, ino, libc::DT_LNK)
            })
        {
            let _ = self.destroy_inode(&e);
            return Err(err);
        }
        let ino = self.with_inode(&e, |d| d.ino)?;
        self.nlookup_bump(ino);
        self.with_inode(&e, attr_of)
    }

    pub fn link_op(&self, ino: u64, parent: u64, name: &[u8], _cred: Cred) -> Result<Attr> {
        check_name(name)?;
        let die = self.require_dir(parent)?;
        let e = self.require_inode(ino)?;
        if self.with_inode(&e, |d| mode_is_dir(d.mode))? {
            return Err(Error::NotOwner);
        }
        if self.dir_lookup(&die, name)?.is_some() {
            return Err(Error::Exists);
        }
        self.nlink_bump(&e)?;
        let dtype = self.with_inode(&e, |d| dtype_of_mode(d.mode))?;
        if let Err(err) = self.dir_insert(&die, name, ino, dtype) {
            let _ = self.nlink_drop(&e);
            return Err(err);
        }
        self.nlookup_bump(ino);
        self.with_inode(&e, attr_of)
    }

    pub fn unlink_op(&self, parent: u64, name: &[u8], _cred: Cred) -> Result<()> {
        check_name(name)?;
        let die = self.require_dir(parent)?;
        let (ino, _) = self.dir_lookup(&die, name)?.ok_or(Error::NotFound)?;
        let e = self.require_inode(ino)?;
        if self.with_inode(&e, |d| mode_is_dir(d.mode))? {
            return Err(Error::IsDir);
        }
        let _ = self.dir_remove(&die, name)?;
        let nlink = self.nlink_drop(&e)?;
        if nlink == 0 {
            self.retire_ino(ino);
        }
        debug!("unlink {:?} ino {}", String::from_utf8_lossy(name), ino);
        Ok(())
    }

    pub fn rmdir_op(&self, parent: u64, name: &[u8], _cred: Cred) -> Result<()> {
        check_name(name)?;
        if name == b"." || name == b".." {
            return Err(Error::Invalid);
        }
        let die = self.require_dir(parent)?;
        let (ino, _) = self.dir_lookup(&die, name)?.ok_or(Error::NotFound)?;
        let e = self.require_dir(ino)?;
        if self.with_inode(&e, |d| d.dir_nentries)? != 0 {
            return Err(Error::NotEmpty);
        }
        let _ = self.dir_remove(&die, name)?;
        let _ = self.nlink_drop(&die)?;
        self.with_inode_mut(&e, |d| d.nlink = 0)?;
        self.retire_ino(ino);
        Ok(())
    }

    /// True when `ino` lies on the parent chain of `below`.
    fn dir_is_ancestor(&self, ino: u64, below: u64) -> Result<bool> {
        let mut cur = below;
        let mut depth = 0;
        while cur != self.root_ino() && cur != 0 {
            if cur == ino {
                return Ok(true);
            }
            let e = self.require_inode(cur)?;
            cur = self.with_inode(&e, |d| d.parent)?;
            depth += 1;
            if depth > 4096 {
                return Err(Error::Loop);
            }
        }
        Ok(cur == ino)
    }

    pub fn rename_op(
        &self,
        parent: u64,
        name: &[u8],
        newparent: u64,
        newname: &[u8],
        flags: u32,
        _cred: Cred,
    ) -> Result<()> {
        check_name(name)?;
        check_name(newname)?;
        let exchange = flags & libc::RENAME_EXCHANGE != 0;
        let noreplace = flags & libc::RENAME_NOREPLACE != 0;
        if exchange && noreplace {
            return Err(Error::Invalid);
        }
        let sdie = self.require_dir(parent)?;
        let ddie = self.require_dir(newparent)?;
        let (src_ino, src_dtype) = self.dir_lookup(&sdie, name)?.ok_or(Error::NotFound)?;
        let dst = self.dir_lookup(&ddie, newname)?;
        if parent == newparent && name == newname {
            return Ok(());
        }
        let se = self.require_inode(src_ino)?;
        let src_is_dir = self.with_inode(&se, |d| mode_is_dir(d.mode))?;
        if src_is_dir && parent != newparent {
            if self.dir_is_ancestor(src_ino, newparent)? {
                return Err(Error::Invalid);
            }
        }

        if exchange {
            let (dst_ino, dst_dtype) = dst.ok_or(Error::NotFound)?;
            let de = self.require_inode(dst_ino)?;
            let dst_is_dir = self.with_inode(&de, |d| mode_is_dir(d.mode))?;
            if dst_is_dir && parent != newparent {
                if self.dir_is_ancestor(dst_ino, parent)? {
                    return Err(Error::Invalid);
                }
            }
            let _ = self.dir_retarget(&sdie, name, dst_ino, dst_dtype)?;
            let _ = self.dir_retarget(&ddie, newname, src_ino, src_dtype)?;
            if parent != newparent {
                self.with_inode_mut(&se, |d| d.parent = newparent)?;
                self.with_inode_mut(&de, |d| d.parent = parent)?;
                // `..` references move with the exchanged directories.
                let delta = dst_is_dir as i64 - src_is_dir as i64;
                if delta != 0 {
                    self.with_inode_mut(&sdie, |d| {
                        d.nlink = (d.nlink as i64 + delta) as u32
                    })?;
                    self.with_inode_mut(&ddie, |d| {
                        d.nlink = (d.nlink as i64 - delta) as u32
                    })?;
                }
            }
            self.with_inode_mut(&se, touch_ctime)?;
            self.with_inode_mut(&de, touch_ctime)?;
            return Ok(());
        }

        if let Some((dst_ino, _)) = dst {
            if noreplace {
                return Err(Error::Exists);
            }
            // Two links to one inode: rename is a no-op.
            if dst_ino == src_ino {
                return Ok(());
            }
            let de = self.require_inode(dst_ino)?;
            let dst_is_dir = self.with_inode(&de, |d| mode_is_dir(d.mode))?;
            if src_is_dir && !dst_is_dir {
                return Err(Error::NotDir);
            }
            if !src_is_dir && dst_is_dir {
                return Err(Error::IsDir);
            }
            if dst_is_dir {
                if self.with_inode(&de, |d| d.dir_nentries)? != 0 {
                    return Err(Error::NotEmpty);
                }
                let _ = self.dir_remove(&ddie, newname)?;
                let _ = self.nlink_drop(&ddie)?;
                self.with_inode_mut(&de, |d| d.nlink = 0)?;
                self.retire_ino(dst_ino);
            } else {
                let _ = self.dir_remove(&ddie, newname)?;
                let nlink = self.nlink_drop(&de)?;
                if nlink == 0 {
                    self.retire_ino(dst_ino);
                }
            }
        }

        let _ = self.dir_remove(&sdie, name)?;
        self.dir_insert(&ddie, newname, src_ino, src_dtype)?;
        if src_is_dir && parent != newparent {
            let _ = self.nlink_drop(&sdie)?;
            self.nlink_bump(&ddie)?;
            self.with_inode_mut(&se, |d| d.parent = newparent)?;
        }
        self.with_inode_mut(&se, touch_ctime)?;
        debug!(
            "rename {:?} -> {:?} ino {}",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(newname),
            src_ino
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Readdir

    /// Emits up to `limit` entries starting at `cursor`. Cursors address
    /// heap positions, so entries already emitted survive concurrent
    /// removals of their neighbors.
    pub fn readdir_op(&self, ino: u64, cursor: u64, limit: usize) -> Result<Vec<DirentOut>> {
        if is_pseudo_ino(ino) {
            return crate::server::pseudo::readdir(self, ino, cursor, limit);
        }
        let die = self.require_dir(ino)?;
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        if cursor == 0 {
            out.push(DirentOut { name: b".".to_vec(), ino, dtype: libc::DT_DIR, next: 1 });
        }
        if cursor <= 1 && out.len() < limit {
            let pp = self.with_inode(&die, |d| d.parent)?;
            out.push(DirentOut {
                name: b"..".to_vec(),
                ino: if pp == 0 { ino } else { pp },
                dtype: libc::DT_DIR,
                next: CURSOR_REAL,
            });
        }

        let (mut bucket, mut chain, mut off) = decode_cursor(cursor);
        let buckets = self.with_inode(&die, |d| d.dir_buckets)?;
        'outer: while bucket < DIR_NBUCKETS && out.len() < limit {
            let mut link = buckets[bucket];
            let mut ci = 0usize;
            while link != 0 {
                let va = Vaddr::from_u64(link).ok_or(Error::CorruptData(die.va))?;
                let de = self.require(va)?;
                if ci == chain {
                    let full = self.with_dnode(&de, |d| {
                        let mut pos = off;
                        while let Some((hdr, name)) = dirent_at(d, pos) {
                            let next_pos = pos + hdr.rec_len as usize;
                            if hdr.ino != 0 {
                                if out.len() >= limit {
                                    return true;
                                }
                                out.push(DirentOut {
                                    name: name.to_vec(),
                                    ino: hdr.ino,
                                    dtype: hdr.dtype,
                                    next: encode_cursor(bucket, ci, next_pos),
                                });
                            }
                            pos = next_pos;
                        }
                        false
                    })?;
                    if full {
                        break 'outer;
                    }
                    chain += 1;
                    off = 0;
                }
                ci += 1;
                link = self.with_dnode(&de, |d| d.next)?;
            }
            bucket += 1;
            chain = 0;
            off = 0;
        }
        Ok(out)
    }
}

fn encode_cursor(bucket: usize, chain: usize, off: usize) -> u64 {
    CURSOR_REAL | ((bucket as u64) << 40) | ((chain as u64) << 24) | off as u64
}

fn decode_cursor(cursor: u64) -> (usize, usize, usize) {
    if cursor & CURSOR_REAL == 0 {
        return (0, 0, 0);
    }
    let bucket = ((cursor >> 40) & 0xFFFF) as usize;
    let chain = ((cursor >> 24) & 0xFFFF) as usize;
    let off = (cursor & 0xFF_FFFF) as usize;
    (bucket, chain, off)
}
