//! File-maps: sparse block maps from file offsets to data leaves.
//!
//! Each regular inode roots a radix tree with fan-out 256. Height 0 is
//! an empty map, height 1 a single leaf hanging straight off the inode,
//! height h >= 2 an interior FNODE whose children have height h-1 down
//! to the leaf level at height 1. A NULL child is a hole: reads yield
//! zeros without allocating, writes allocate the missing path. An
//! UNWRITTEN child is allocated but carries no bytes yet; it reads as
//! zeros and counts as data for seek purposes.
//!
//! Leaves are raw blocks; their payload checksum lives in the parent's
//! child slot and is verified once per cache residency. A mismatch
//! quarantines the leaf and fails the single request; the filesystem
//! stays live.

use std::sync::Arc;

use itertools::Itertools;
use log::debug;

use crate::cache::Centry;
use crate::codec::new_bkbuf;
use crate::crc::crc32;
use crate::error::{Error, Result};
use crate::layout::{DChild, DFnode, CHILD_UNWRITTEN};
use crate::node::Node;
use crate::param::{BK_SIZE, FANOUT, FILESIZE_MAX, HEIGHT_MAX};
use crate::vaddr::{Kind, Vaddr};

use super::inode::{mode_is_reg, touch_ctime, touch_mtime_ctime};
use super::Fsys;

const BK: u64 = BK_SIZE as u64;

/// Leaves addressable by a tree of the given height.
fn capacity(height: u32) -> u64 {
    match height {
        0 => 0,
        1 => 1,
        h => (FANOUT as u64).pow(h - 1).min(FILESIZE_MAX / BK),
    }
}

/// Child index at an interior node of `height` for a leaf index.
fn digit(leaf_idx: u64, height: u32) -> usize {
    debug_assert!(height >= 2);
    ((leaf_idx >> (8 * (height - 2))) & 0xFF) as usize
}

/// Leaves spanned by one child of an interior node of `height`.
fn child_span(height: u32) -> u64 {
    debug_assert!(height >= 2);
    (FANOUT as u64).pow(height - 2)
}

/// Where a leaf's child slot lives: the inode root slot or a slot of
/// an interior node.
struct SlotRef {
    parent: Option<Arc<Centry>>,
    idx: usize,
}

/// One fiemap extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FmExtent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
}

impl Fsys {
    fn with_fnode<R>(&self, e: &Centry, f: impl FnOnce(&DFnode) -> R) -> Result<R> {
        let guard = e.node();
        match guard.as_ref() {
            Some(Node::Fnode(d)) => Ok(f(d)),
            _ => Err(Error::WrongKind(e.va)),
        }
    }

    fn with_fnode_mut<R>(&self, e: &Centry, f: impl FnOnce(&mut DFnode) -> R) -> Result<R> {
        let out = {
            let mut guard = e.node_mut();
            match guard.as_mut() {
                Some(Node::Fnode(d)) => f(d),
                _ => return Err(Error::WrongKind(e.va)),
            }
        };
        let _ = e.bump_generation();
        e.mark_dirty();
        Ok(out)
    }

    fn with_leaf<R>(&self, e: &Centry, f: impl FnOnce(&[u8; BK_SIZE]) -> R) -> Result<R> {
        let guard = e.node();
        match guard.as_ref() {
            Some(Node::Leaf(bk)) => Ok(f(bk)),
            _ => Err(Error::WrongKind(e.va)),
        }
    }

    fn with_leaf_mut<R>(&self, e: &Centry, f: impl FnOnce(&mut [u8; BK_SIZE]) -> R) -> Result<R> {
        let out = {
            let mut guard = e.node_mut();
            match guard.as_mut() {
                Some(Node::Leaf(bk)) => f(bk),
                _ => return Err(Error::WrongKind(e.va)),
            }
        };
        let _ = e.bump_generation();
        e.mark_dirty();
        Ok(out)
    }

    fn read_slot(&self, ie: &Centry, s: &SlotRef) -> Result<DChild> {
        match &s.parent {
            None => self.with_inode(ie, |d| d.fm_root),
            Some(fe) => self.with_fnode(fe, |f| f.child[s.idx]),
        }
    }

    fn write_slot(&self, ie: &Centry, s: &SlotRef, c: DChild) -> Result<()> {
        match &s.parent {
            None => self.with_inode_mut(ie, |d| d.fm_root = c),
            Some(fe) => self.with_fnode_mut(fe, |f| {
                let old = f.child[s.idx];
                if old.is_hole() && !c.is_hole() {
                    f.nchildren += 1;
                } else if !old.is_hole() && c.is_hole() {
                    f.nchildren -= 1;
                }
                f.child[s.idx] = c;
            }),
        }
    }

    /// Creates an empty interior node of `height` owned by `ino`.
    fn fnode_new(&self, ino: u64, height: u32) -> Result<Arc<Centry>> {
        let mut d: DFnode = zerocopy::FromBytes::new_zeroed();
        d.height = height;
        let e = self.new_node(Kind::Fnode, ino, Node::Fnode(Box::new(d)))?;
        self.with_inode_mut_nblocks(ino, 1)?;
        Ok(e)
    }

    /// nblocks adjustment via the already-staged inode of `ino`.
    fn with_inode_mut_nblocks(&self, ino: u64, delta: i64) -> Result<()> {
        let ie = self.require_inode(ino)?;
        self.with_inode_mut(&ie, |d| {
            d.nblocks = (d.nblocks as i64 + delta) as u64;
        })
    }

    /// Grows the tree until `nleaves` fit, re-rooting as needed.
    fn fm_grow(&self, ie: &Centry, nleaves: u64) -> Result<()> {
        if nleaves > FILESIZE_MAX / BK {
            return Err(Error::FileTooBig);
        }
        loop {
            let (h, root) = self.with_inode(ie, |d| (d.fm_height, d.fm_root))?;
            if nleaves <= capacity(h) {
                return Ok(());
            }
            let ino = self.with_inode(ie, |d| d.ino)?;
            match h {
                0 => {
                    // Nothing allocated yet; jump straight to the height
                    // that fits.
                    let mut need = 1;
                    while capacity(need) < nleaves {
                        need += 1;
                    }
                    if need > HEIGHT_MAX {
                        return Err(Error::FileTooBig);
                    }
                    self.with_inode_mut(ie, |d| d.fm_height = need)?;
                }
                h => {
                    if h + 1 > HEIGHT_MAX {
                        return Err(Error::FileTooBig);
                    }
                    // New root adopts the old root as its first child.
                    let fe = self.fnode_new(ino, h + 1)?;
                    if !root.is_hole() {
                        self.with_fnode_mut(&fe, |f| {
                            f.child[0] = root;
                            f.nchildren = 1;
                        })?;
                    }
                    self.with_inode_mut(ie, |d| {
                        d.fm_height = h + 1;
                        d.fm_root = DChild { ptr: fe.va.to_u64(), crc: 0, flags: 0 };
                    })?;
                }
            }
        }
    }

    /// Resolves the slot holding the pointer for `leaf_idx`.
    ///
    /// With `create` set, missing interior nodes are allocated and the
    /// tree grows to cover the index; otherwise `None` reports a hole
    /// somewhere along the path.
    fn fm_walk(&self, ie: &Centry, leaf_idx: u64, create: bool) -> Result<Option<SlotRef>> {
        let (mut h, _) = self.with_inode(ie, |d| (d.fm_height, d.fm_root))?;
        if leaf_idx >= capacity(h) {
            if !create {
                return Ok(None);
            }
            self.fm_grow(ie, leaf_idx + 1)?;
            h = self.with_inode(ie, |d| d.fm_height)?;
        }
        if h == 1 {
            return Ok(Some(SlotRef { parent: None, idx: 0 }));
        }
        let ino = self.with_inode(ie, |d| d.ino)?;

        // Descend from the root slot to the height-2 node that holds
        // the leaf pointer.
        let mut slot = SlotRef { parent: None, idx: 0 };
        let mut level = h;
        loop {
            let c = self.read_slot(ie, &slot)?;
            let fe = if c.is_hole() {
                if !create {
                    return Ok(None);
                }
                let fe = self.fnode_new(ino, level)?;
                self.write_slot(ie, &slot, DChild { ptr: fe.va.to_u64(), crc: 0, flags: 0 })?;
                fe
            } else {
                let va = Vaddr::from_u64(c.ptr).ok_or(Error::CorruptData(ie.va))?;
                self.require(va)?
            };
            let idx = digit(leaf_idx, level);
            if level == 2 {
                return Ok(Some(SlotRef { parent: Some(fe), idx }));
            }
            slot = SlotRef { parent: Some(fe), idx };
            level -= 1;
        }
    }

    /// Stages a data leaf for reading, verifying its checksum on first
    /// touch. A mismatch quarantines the leaf.
    fn leaf_for_read(&self, ie: &Centry, c: DChild) -> Result<Arc<Centry>> {
        let va = Vaddr::from_u64(c.ptr).ok_or(Error::CorruptData(ie.va))?;
        let le = self.require(va)?;
        if le.is_quarantined() {
            return Err(Error::CorruptData(va));
        }
        if !le.is_verified() {
            let ok = self.with_leaf(&le, |bk| crc32(bk) == c.crc)?;
            if !ok {
                le.quarantine();
                return Err(Error::CorruptData(va));
            }
            le.mark_verified();
        }
        Ok(le)
    }

    /// Stages a data leaf for writing at `slot`. Holes and unwritten
    /// children materialize as zeroed payloads without volume reads.
    fn leaf_for_write(&self, ie: &Centry, ino: u64, s: &SlotRef) -> Result<Arc<Centry>> {
        let c = self.read_slot(ie, s)?;
        if c.is_hole() {
            let le = self.new_node(Kind::Leaf, ino, Node::Leaf(new_bkbuf()))?;
            self.with_inode_mut_nblocks(ino, 1)?;
            // The slot checksum is provisional; the caller reseals it
            // after mutating the payload.
            self.write_slot(ie, s, DChild { ptr: le.va.to_u64(), crc: 0, flags: 0 })?;
            return Ok(le);
        }
        let va = Vaddr::from_u64(c.ptr).ok_or(Error::CorruptData(ie.va))?;
        if c.is_unwritten() {
            // Allocated but never written: the on-volume bytes are
            // undefined, so start from zeros instead of loading.
            let entry = match self.cache().lookup(va) {
                Some(e) if e.is_ready() => {
                    self.with_leaf_mut(&e, |bk| bk.fill(0))?;
                    e
                }
                _ => {
                    let _ = self.cache().remove(va);
                    let e = self.cache().insert_new(va, Node::Leaf(new_bkbuf()));
                    e.set_owner(ino);
                    e.mark_dirty();
                    e
                }
            };
            return Ok(entry);
        }
        self.leaf_for_read(ie, c)
    }

    /// Recomputes the slot checksum after a leaf mutation.
    fn reseal_leaf(&self, ie: &Centry, s: &SlotRef, le: &Centry) -> Result<()> {
        let crc = self.with_leaf(le, |bk| crc32(bk))?;
        self.write_slot(ie, s, DChild { ptr: le.va.to_u64(), crc, flags: 0 })
    }

    // ------------------------------------------------------------------
    // Read / write

    pub fn read_op(&self, ino: u64, off: u64, len: usize) -> Result<Vec<u8>> {
        let ie = self.require_inode(ino)?;
        let (mode, size) = self.with_inode(&ie, |d| (d.mode, d.size))?;
        if !mode_is_reg(mode) {
            return Err(if super::inode::mode_is_dir(mode) { Error::IsDir } else { Error::Invalid });
        }
        if off >= size {
            return Ok(Vec::new());
        }
        let len = len.min((size - off) as usize);
        let mut out = vec![0u8; len];
        let mut done = 0usize;
        while done < len {
            let pos = off + done as u64;
            let idx = pos / BK;
            let inoff = (pos % BK) as usize;
            let n = (BK_SIZE - inoff).min(len - done);
            if let Some(slot) = self.fm_walk(&ie, idx, false)? {
                let c = self.read_slot(&ie, &slot)?;
                if !c.is_hole() && !c.is_unwritten() {
                    let le = self.leaf_for_read(&ie, c)?;
                    self.with_leaf(&le, |bk| {
                        out[done..done + n].copy_from_slice(&bk[inoff..inoff + n]);
                    })?;
                }
            }
            done += n;
        }
        Ok(out)
    }

    /// Writes `data` at `off`. A mid-write allocation failure truncates
    /// the result at the last fully written byte; the caller surfaces
    /// the short count, or `OutOfSpace` when nothing was written.
    pub fn write_op(&self, ino: u64, off: u64, data: &[u8]) -> Result<usize> {
        let ie = self.require_inode(ino)?;
        let mode = self.with_inode(&ie, |d| d.mode)?;
        if !mode_is_reg(mode) {
            return Err(if super::inode::mode_is_dir(mode) { Error::IsDir } else { Error::Invalid });
        }
        if off.checked_add(data.len() as u64).map_or(true, |end| end > FILESIZE_MAX) {
            return Err(Error::FileTooBig);
        }
        let mut done = 0usize;
        while done < data.len() {
            let pos = off + done as u64;
            let idx = pos / BK;
            let inoff = (pos % BK) as usize;
            let n = (BK_SIZE - inoff).min(data.len() - done);
            let res: Result<()> = (|| {
                let slot = self.fm_walk(&ie, idx, true)?.ok_or(Error::Invalid)?;
                let le = self.leaf_for_write(&ie, ino, &slot)?;
                self.with_leaf_mut(&le, |bk| {
                    bk[inoff..inoff + n].copy_from_slice(&data[done..done + n]);
                })?;
                self.reseal_leaf(&ie, &slot, &le)
            })();
            match res {
                Ok(()) => done += n,
                Err(Error::OutOfSpace) | Err(Error::OutOfInodes) => break,
                Err(err) => return Err(err),
            }
        }
        if done == 0 && !data.is_empty() {
            return Err(Error::OutOfSpace);
        }
        self.with_inode_mut(&ie, |d| {
            let end = off + done as u64;
            if end > d.size {
                d.size = end;
            }
            touch_mtime_ctime(d);
        })?;
        Ok(done)
    }

    // ------------------------------------------------------------------
    // Truncate

    /// Frees every child subtree whose leaves lie entirely at or beyond
    /// `keep` leaves; returns blocks freed and whether the node emptied.
    fn fm_prune(
        &self,
        fe: &Arc<Centry>,
        height: u32,
        base: u64,
        keep: u64,
    ) -> Result<(u64, bool)> {
        let span = child_span(height);
        let mut freed = 0u64;
        for i in 0..FANOUT {
            let child_base = base + (i as u64) * span;
            let c = self.with_fnode(fe, |f| f.child[i])?;
            if c.is_hole() {
                continue;
            }
            if child_base >= keep {
                freed += self.fm_free_subtree(c, height - 1)?;
                self.with_fnode_mut(fe, |f| {
                    f.child[i] = DChild::hole();
                    f.nchildren -= 1;
                })?;
            } else if child_base + span > keep && height > 2 {
                let va = Vaddr::from_u64(c.ptr).ok_or(Error::CorruptData(fe.va))?;
                let ce = self.require(va)?;
                let (sub, empty) = self.fm_prune(&ce, height - 1, child_base, keep)?;
                freed += sub;
                if empty {
                    self.free_va(va)?;
                    freed += 1;
                    self.with_fnode_mut(fe, |f| {
                        f.child[i] = DChild::hole();
                        f.nchildren -= 1;
                    })?;
                }
            }
        }
        let empty = self.with_fnode(fe, |f| f.nchildren == 0)?;
        Ok((freed, empty))
    }

    /// Frees an entire subtree below a child pointer of `height`.
    fn fm_free_subtree(&self, c: DChild, height: u32) -> Result<u64> {
        let va = Vaddr::from_u64(c.ptr).ok_or(Error::BadMagic)?;
        if height == 1 {
            self.free_va(va)?;
            return Ok(1);
        }
        let fe = self.require(va)?;
        let mut freed = 0u64;
        for i in 0..FANOUT {
            let cc = self.with_fnode(&fe, |f| f.child[i])?;
            if !cc.is_hole() {
                freed += self.fm_free_subtree(cc, height - 1)?;
            }
        }
        self.free_va(va)?;
        Ok(freed + 1)
    }

    /// Shrinks or extends a regular file to `new_size`.
    pub fn ftruncate(&self, ie: &Centry, new_size: u64) -> Result<()> {
        if new_size > FILESIZE_MAX {
            return Err(Error::FileTooBig);
        }
        let (ino, old_size, h, root) =
            self.with_inode(ie, |d| (d.ino, d.size, d.fm_height, d.fm_root))?;
        if new_size >= old_size {
            // Extending creates a hole; only the size moves.
            return self.with_inode_mut(ie, |d| {
                d.size = new_size;
                touch_mtime_ctime(d);
            });
        }
        let keep = (new_size + BK - 1) / BK;
        let mut freed = 0u64;
        if h == 1 && keep == 0 && !root.is_hole() {
            freed += self.fm_free_subtree(root, 1)?;
            self.with_inode_mut(ie, |d| d.fm_root = DChild::hole())?;
        } else if h >= 2 && !root.is_hole() {
            let va = Vaddr::from_u64(root.ptr).ok_or(Error::CorruptData(ie.va))?;
            let fe = self.require(va)?;
            let (sub, empty) = self.fm_prune(&fe, h, 0, keep)?;
            freed += sub;
            if empty {
                self.free_va(va)?;
                freed += 1;
                self.with_inode_mut(ie, |d| {
                    d.fm_root = DChild::hole();
                    d.fm_height = 0;
                })?;
            }
        }
        // Zero the tail of the leaf straddling the new end.
        if new_size % BK != 0 {
            if let Some(slot) = self.fm_walk(ie, new_size / BK, false)? {
                let c = self.read_slot(ie, &slot)?;
                if !c.is_hole() && !c.is_unwritten() {
                    let le = self.leaf_for_read(ie, c)?;
                    let tail = (new_size % BK) as usize;
                    self.with_leaf_mut(&le, |bk| bk[tail..].fill(0))?;
                    self.reseal_leaf(ie, &slot, &le)?;
                }
            }
        }
        self.with_inode_mut(ie, |d| {
            d.size = new_size;
            d.nblocks = d.nblocks.saturating_sub(freed);
            touch_mtime_ctime(d);
        })?;
        debug!("truncate ino {} to {} freed {}", ino, new_size, freed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fallocate

    pub fn fallocate_op(&self, ino: u64, mode: i32, off: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::Invalid);
        }
        if off.checked_add(len).map_or(true, |end| end > FILESIZE_MAX) {
            return Err(Error::FileTooBig);
        }
        let ie = self.require_inode(ino)?;
        if !self.with_inode(&ie, |d| mode_is_reg(d.mode))? {
            return Err(Error::Invalid);
        }
        let keep_size = mode & libc::FALLOC_FL_KEEP_SIZE != 0;
        match mode & !libc::FALLOC_FL_KEEP_SIZE {
            0 => self.falloc_reserve(&ie, ino, off, len, keep_size),
            libc::FALLOC_FL_PUNCH_HOLE if keep_size => self.falloc_punch(&ie, ino, off, len),
            libc::FALLOC_FL_ZERO_RANGE => self.falloc_zero(&ie, ino, off, len, keep_size),
            libc::FALLOC_FL_COLLAPSE_RANGE if !keep_size => {
                self.falloc_collapse(&ie, ino, off, len)
            }
            libc::FALLOC_FL_INSERT_RANGE if !keep_size => self.falloc_insert(&ie, ino, off, len),
            _ => Err(Error::Invalid),
        }
    }

    /// DEFAULT / KEEP_SIZE: allocate unwritten leaves for the range
    /// under a single reservation.
    fn falloc_reserve(&self, ie: &Centry, ino: u64, off: u64, len: u64, keep: bool) -> Result<()> {
        let first = off / BK;
        let last = (off + len - 1) / BK;
        // First pass counts the holes so the space is reserved up
        // front; a partial allocation never escapes.
        let mut missing = 0usize;
        for idx in first..=last {
            let covered = match self.fm_walk(ie, idx, false)? {
                Some(slot) => !self.read_slot(ie, &slot)?.is_hole(),
                None => false,
            };
            if !covered {
                missing += 1;
            }
        }
        let vas = self.reserve(Kind::Leaf, missing, ino)?;
        let mut used = 0usize;
        let res: Result<()> = (|| {
            for idx in first..=last {
                let slot = self.fm_walk(ie, idx, true)?.ok_or(Error::Invalid)?;
                let c = self.read_slot(ie, &slot)?;
                if c.is_hole() {
                    let va = *vas.get(used).ok_or(Error::OutOfSpace)?;
                    used += 1;
                    self.write_slot(
                        ie,
                        &slot,
                        DChild { ptr: va.to_u64(), crc: 0, flags: CHILD_UNWRITTEN },
                    )?;
                    self.with_inode_mut_nblocks(ino, 1)?;
                }
            }
            Ok(())
        })();
        self.release_reserved(&vas[used..]);
        res?;
        self.with_inode_mut(ie, |d| {
            if !keep && off + len > d.size {
                d.size = off + len;
            }
            touch_ctime(d);
        })
    }

    /// PUNCH_HOLE | KEEP_SIZE: free fully covered leaves, zero the
    /// partial edges in place.
    fn falloc_punch(&self, ie: &Centry, ino: u64, off: u64, len: u64) -> Result<()> {
        let end = off + len;
        let mut pos = off;
        let mut freed = 0u64;
        while pos < end {
            let idx = pos / BK;
            let inoff = (pos % BK) as usize;
            let n = ((BK - inoff as u64).min(end - pos)) as usize;
            if let Some(slot) = self.fm_walk(ie, idx, false)? {
                let c = self.read_slot(ie, &slot)?;
                if !c.is_hole() {
                    if inoff == 0 && n == BK_SIZE {
                        // Whole leaf covered: back to a hole.
                        let va = Vaddr::from_u64(c.ptr).ok_or(Error::CorruptData(ie.va))?;
                        self.free_va(va)?;
                        self.write_slot(ie, &slot, DChild::hole())?;
                        freed += 1;
                    } else if c.is_unwritten() {
                        // Already reads as zeros.
                    } else {
                        // Partial block: read-modify-write under any
                        // codec.
                        let le = self.leaf_for_read(ie, c)?;
                        self.with_leaf_mut(&le, |bk| bk[inoff..inoff + n].fill(0))?;
                        self.reseal_leaf(ie, &slot, &le)?;
                    }
                }
            }
            pos += n as u64;
        }
        debug!("punch ino {} off {} len {} freed {}", ino, off, len, freed);
        self.with_inode_mut(ie, |d| {
            d.nblocks = d.nblocks.saturating_sub(freed);
            touch_mtime_ctime(d);
        })
    }

    /// ZERO_RANGE: full leaves flip to unwritten, partial edges zero in
    /// place; allocation is kept.
    fn falloc_zero(&self, ie: &Centry, ino: u64, off: u64, len: u64, keep: bool) -> Result<()> {
        let end = off + len;
        let mut pos = off;
        while pos < end {
            let idx = pos / BK;
            let inoff = (pos % BK) as usize;
            let n = ((BK - inoff as u64).min(end - pos)) as usize;
            if let Some(slot) = self.fm_walk(ie, idx, false)? {
                let c = self.read_slot(ie, &slot)?;
                if !c.is_hole() && !c.is_unwritten() {
                    if inoff == 0 && n == BK_SIZE {
                        let _ = self.cache().remove(
                            Vaddr::from_u64(c.ptr).ok_or(Error::CorruptData(ie.va))?,
                        );
                        self.write_slot(
                            ie,
                            &slot,
                            DChild { ptr: c.ptr, crc: 0, flags: CHILD_UNWRITTEN },
                        )?;
                    } else {
                        let le = self.leaf_for_read(ie, c)?;
                        self.with_leaf_mut(&le, |bk| bk[inoff..inoff + n].fill(0))?;
                        self.reseal_leaf(ie, &slot, &le)?;
                    }
                }
            }
            pos += n as u64;
        }
        debug!("zero-range ino {} off {} len {}", ino, off, len);
        self.with_inode_mut(ie, |d| {
            if !keep && end > d.size {
                d.size = end;
            }
            touch_mtime_ctime(d);
        })
    }

    /// Moves the child pointer of `from` onto `to`, leaving a hole at
    /// `from`. Pure pointer manipulation; leaves are not copied. A leaf
    /// the destination slot still points at is reclaimed.
    fn fm_move_child(&self, ie: &Centry, from: u64, to: u64) -> Result<()> {
        let src = match self.fm_walk(ie, from, false)? {
            Some(slot) => {
                let c = self.read_slot(ie, &slot)?;
                if !c.is_hole() {
                    self.write_slot(ie, &slot, DChild::hole())?;
                }
                c
            }
            None => DChild::hole(),
        };
        match self.fm_walk(ie, to, !src.is_hole())? {
            Some(slot) => {
                let old = self.read_slot(ie, &slot)?;
                if !old.is_hole() && old.ptr != src.ptr {
                    let va = Vaddr::from_u64(old.ptr).ok_or(Error::CorruptData(ie.va))?;
                    self.free_va(va)?;
                    self.with_inode_mut(ie, |d| d.nblocks = d.nblocks.saturating_sub(1))?;
                }
                self.write_slot(ie, &slot, src)
            }
            None => Ok(()),
        }
    }

    /// COLLAPSE_RANGE: removes `[off, off+len)`; the suffix shifts down.
    fn falloc_collapse(&self, ie: &Centry, ino: u64, off: u64, len: u64) -> Result<()> {
        let size = self.with_inode(ie, |d| d.size)?;
        if off % BK != 0 || len % BK != 0 || off + len > size {
            return Err(Error::Invalid);
        }
        let shift = len / BK;
        let nleaves = (size + BK - 1) / BK;
        for dst in (off / BK)..(nleaves - shift) {
            self.fm_move_child(ie, dst + shift, dst)?;
        }
        let new_size = size - len;
        self.ftruncate(ie, new_size)?;
        debug!("collapse ino {} off {} len {}", ino, off, len);
        Ok(())
    }

    /// INSERT_RANGE: inserts a hole of `len` at `off`; the suffix
    /// shifts up.
    fn falloc_insert(&self, ie: &Centry, ino: u64, off: u64, len: u64) -> Result<()> {
        let size = self.with_inode(ie, |d| d.size)?;
        if off % BK != 0 || len % BK != 0 || off > size {
            return Err(Error::Invalid);
        }
        if size + len > FILESIZE_MAX {
            return Err(Error::FileTooBig);
        }
        let shift = len / BK;
        let nleaves = (size + BK - 1) / BK;
        let first = off / BK;
        for dst in (first + shift..nleaves + shift).rev() {
            self.fm_move_child(ie, dst - shift, dst)?;
        }
        self.with_inode_mut(ie, |d| {
            d.size += len;
            touch_mtime_ctime(d);
        })?;
        debug!("insert ino {} off {} len {}", ino, off, len);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Seek / fiemap

    /// Smallest allocated leaf index >= `from`, tree-walked so hole
    /// subtrees are skipped whole.
    fn fm_next_data(&self, ie: &Centry, from: u64) -> Result<Option<u64>> {
        let (h, root) = self.with_inode(ie, |d| (d.fm_height, d.fm_root))?;
        if h == 0 || root.is_hole() {
            return Ok(None);
        }
        if h == 1 {
            return Ok(if from == 0 { Some(0) } else { None });
        }
        let va = Vaddr::from_u64(root.ptr).ok_or(Error::CorruptData(ie.va))?;
        let fe = self.require(va)?;
        self.fm_next_data_in(&fe, h, 0, from)
    }

    fn fm_next_data_in(
        &self,
        fe: &Arc<Centry>,
        height: u32,
        base: u64,
        from: u64,
    ) -> Result<Option<u64>> {
        let span = child_span(height);
        let start = if from > base { ((from - base) / span) as usize } else { 0 };
        for i in start..FANOUT {
            let child_base = base + (i as u64) * span;
            let c = self.with_fnode(fe, |f| f.child[i])?;
            if c.is_hole() {
                continue;
            }
            if height == 2 {
                if child_base >= from {
                    return Ok(Some(child_base));
                }
                continue;
            }
            let va = Vaddr::from_u64(c.ptr).ok_or(Error::CorruptData(fe.va))?;
            let ce = self.require(va)?;
            if let Some(found) = self.fm_next_data_in(&ce, height - 1, child_base, from)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Smallest hole leaf index >= `from`, skipping dense subtrees.
    fn fm_next_hole(&self, ie: &Centry, from: u64) -> Result<u64> {
        let (h, root) = self.with_inode(ie, |d| (d.fm_height, d.fm_root))?;
        if h == 0 || root.is_hole() {
            return Ok(from);
        }
        if h == 1 {
            return Ok(from.max(1));
        }
        let va = Vaddr::from_u64(root.ptr).ok_or(Error::CorruptData(ie.va))?;
        let fe = self.require(va)?;
        match self.fm_next_hole_in(&fe, h, 0, from)? {
            Some(idx) => Ok(idx),
            None => Ok(capacity(h).max(from)),
        }
    }

    fn fm_next_hole_in(
        &self,
        fe: &Arc<Centry>,
        height: u32,
        base: u64,
        from: u64,
    ) -> Result<Option<u64>> {
        let span = child_span(height);
        let start = if from > base { ((from - base) / span) as usize } else { 0 };
        for i in start..FANOUT {
            let child_base = base + (i as u64) * span;
            let c = self.with_fnode(fe, |f| f.child[i])?;
            if c.is_hole() {
                return Ok(Some(child_base.max(from)));
            }
            if height == 2 {
                continue;
            }
            let va = Vaddr::from_u64(c.ptr).ok_or(Error::CorruptData(fe.va))?;
            let ce = self.require(va)?;
            if let Some(found) = self.fm_next_hole_in(&ce, height - 1, child_base, from)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// SEEK_DATA / SEEK_HOLE. Follows the original's convention of
    /// returning the file size when no data lies beyond the offset.
    pub fn lseek_op(&self, ino: u64, off: u64, whence: u32) -> Result<u64> {
        let ie = self.require_inode(ino)?;
        let size = self.with_inode(&ie, |d| d.size)?;
        if off >= size {
            return Err(Error::NoData);
        }
        match whence as i32 {
            libc::SEEK_DATA => {
                let found = self.fm_next_data(&ie, off / BK)?;
                Ok(match found {
                    Some(idx) => (idx * BK).max(off).min(size),
                    None => size,
                })
            }
            libc::SEEK_HOLE => {
                let idx = self.fm_next_hole(&ie, off / BK)?;
                let pos = if idx == off / BK && self.leaf_is_hole(&ie, idx)? {
                    off
                } else {
                    idx * BK
                };
                Ok(pos.min(size))
            }
            _ => Err(Error::Invalid),
        }
    }

    fn leaf_is_hole(&self, ie: &Centry, idx: u64) -> Result<bool> {
        match self.fm_walk(ie, idx, false)? {
            None => Ok(true),
            Some(slot) => Ok(self.read_slot(ie, &slot)?.is_hole()),
        }
    }

    /// Lazy extent map of `[off, off+len)`, coalescing physically
    /// contiguous leaves.
    pub fn fiemap_op(&self, ino: u64, off: u64, len: u64) -> Result<Vec<FmExtent>> {
        let ie = self.require_inode(ino)?;
        let size = self.with_inode(&ie, |d| d.size)?;
        let end = off.checked_add(len).unwrap_or(u64::MAX).min(size);
        if off >= end {
            return Ok(Vec::new());
        }
        let mut raw: Vec<FmExtent> = Vec::new();
        let mut idx = off / BK;
        let last = (end - 1) / BK;
        while idx <= last {
            match self.fm_next_data(&ie, idx)? {
                None => break,
                Some(found) => {
                    if found > last {
                        break;
                    }
                    let slot = match self.fm_walk(&ie, found, false)? {
                        Some(slot) => slot,
                        None => break,
                    };
                    let c = self.read_slot(&ie, &slot)?;
                    let va = Vaddr::from_u64(c.ptr).ok_or(Error::CorruptData(ie.va))?;
                    raw.push(FmExtent {
                        logical: found * BK,
                        physical: va.phys(),
                        length: BK,
                    });
                    idx = found + 1;
                }
            }
        }
        Ok(raw
            .into_iter()
            .coalesce(|a, b| {
                if a.logical + a.length == b.logical && a.physical + a.length == b.physical {
                    Ok(FmExtent { logical: a.logical, physical: a.physical, length: a.length + b.length })
                } else {
                    Err((a, b))
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities() {
        assert_eq!(capacity(0), 0);
        assert_eq!(capacity(1), 1);
        assert_eq!(capacity(2), 256);
        assert_eq!(capacity(3), 256 * 256);
        assert_eq!(capacity(HEIGHT_MAX), FILESIZE_MAX / BK);
    }

    #[test]
    fn digits() {
        let idx = 0x0102_0304u64;
        assert_eq!(digit(idx, 2), 0x04);
        assert_eq!(digit(idx, 3), 0x03);
        assert_eq!(digit(idx, 4), 0x02);
        assert_eq!(digit(idx, 5), 0x01);
    }

    #[test]
    fn child_spans() {
        assert_eq!(child_span(2), 1);
        assert_eq!(child_span(3), 256);
        assert_eq!(child_span(4), 256 * 256);
    }
}
