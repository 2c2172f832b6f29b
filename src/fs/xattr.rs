//! Extended attributes.
//!
//! Short records live in the inode's inline area; anything that does
//! not fit gets a dedicated XNODE holding the record header, the name
//! and the head of the value, with large values continuing through a
//! chain of raw continuation XNODEs. Record nodes link off the inode's
//! `xa_head`. Setting or removing an xattr updates ctime only.

use std::sync::Arc;

use log::debug;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::Centry;
use crate::error::{Error, Result};
use crate::layout::{DXnode, DXrec, XNODE_HEAP_SIZE, XREC_HDR_SIZE};
use crate::node::Node;
use crate::param::{NAME_MAX, XATTR_INLINE_SIZE, XATTR_VALUE_MAX};
use crate::vaddr::{Kind, Vaddr};

use super::inode::touch_ctime;
use super::Fsys;

/// Set-mode selector, mirroring the POSIX flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrSet {
    Any,
    Create,
    Replace,
}

impl XattrSet {
    pub fn from_flags(flags: u32) -> Result<XattrSet> {
        match flags as i32 {
            0 => Ok(XattrSet::Any),
            libc::XATTR_CREATE => Ok(XattrSet::Create),
            libc::XATTR_REPLACE => Ok(XattrSet::Replace),
            _ => Err(Error::Invalid),
        }
    }
}

fn rec_len_for(name_len: usize, value_len: usize) -> usize {
    (XREC_HDR_SIZE + name_len + value_len + 7) & !7
}

/// Reads the record at `off` of an inline area or xnode heap: header,
/// name, value head.
fn xrec_at(heap: &[u8], off: usize) -> Option<(DXrec, &[u8], &[u8])> {
    if off + XREC_HDR_SIZE > heap.len() {
        return None;
    }
    let hdr = DXrec::read_from_prefix(&heap[off..])?;
    if hdr.rec_len == 0 {
        return None;
    }
    let rec_len = hdr.rec_len as usize;
    if rec_len < XREC_HDR_SIZE || off + rec_len > heap.len() {
        return None;
    }
    let name_end = off + XREC_HDR_SIZE + hdr.name_len as usize;
    if name_end > off + rec_len {
        return None;
    }
    let head_len = (rec_len - XREC_HDR_SIZE - hdr.name_len as usize)
        .min(hdr.value_len as usize);
    let name = &heap[off + XREC_HDR_SIZE..name_end];
    let head = &heap[name_end..name_end + head_len];
    Some((hdr, name, head))
}

fn put_xrec(heap: &mut [u8], off: usize, hdr: DXrec, name: &[u8], head: &[u8]) {
    heap[off..off + XREC_HDR_SIZE].copy_from_slice(hdr.as_bytes());
    let name_end = off + XREC_HDR_SIZE + name.len();
    heap[off + XREC_HDR_SIZE..name_end].copy_from_slice(name);
    heap[name_end..name_end + head.len()].copy_from_slice(head);
}

fn check_xattr_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.contains(&0) {
        return Err(Error::Invalid);
    }
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

impl Fsys {
    fn with_xnode<R>(&self, e: &Centry, f: impl FnOnce(&DXnode) -> R) -> Result<R> {
        let guard = e.node();
        match guard.as_ref() {
            Some(Node::Xnode(d)) => Ok(f(d)),
            _ => Err(Error::WrongKind(e.va)),
        }
    }

    fn with_xnode_mut<R>(&self, e: &Centry, f: impl FnOnce(&mut DXnode) -> R) -> Result<R> {
        let out = {
            let mut guard = e.node_mut();
            match guard.as_mut() {
                Some(Node::Xnode(d)) => f(d),
                _ => return Err(Error::WrongKind(e.va)),
            }
        };
        let _ = e.bump_generation();
        e.mark_dirty();
        Ok(out)
    }

    fn xnode_new(&self, ino: u64) -> Result<Arc<Centry>> {
        let d: DXnode = FromBytes::new_zeroed();
        self.new_node(Kind::Xnode, ino, Node::Xnode(Box::new(d)))
    }

    /// Finds an inline record by name; `(offset, value)` on a hit.
    fn inline_find(&self, ie: &Centry, name: &[u8]) -> Result<Option<(usize, Vec<u8>)>> {
        self.with_inode(ie, |d| {
            let mut off = 0usize;
            while let Some((hdr, rec_name, head)) = xrec_at(&d.xa_inline, off) {
                if hdr.in_use != 0 && rec_name == name {
                    return Some((off, head.to_vec()));
                }
                off += hdr.rec_len as usize;
            }
            None
        })
    }

    /// Finds a chained record node by name. Returns the holding entry,
    /// its predecessor (None when it is the head) and the value.
    fn chain_find(
        &self,
        ie: &Centry,
        name: &[u8],
    ) -> Result<Option<(Arc<Centry>, Option<Arc<Centry>>, Vec<u8>)>> {
        let mut link = self.with_inode(ie, |d| d.xa_head)?;
        let mut prev: Option<Arc<Centry>> = None;
        while link != 0 {
            let va = Vaddr::from_u64(link).ok_or(Error::CorruptData(ie.va))?;
            let xe = self.require(va)?;
            let hit = self.with_xnode(&xe, |d| {
                match xrec_at(&d.heap, 0) {
                    Some((hdr, rec_name, head)) if rec_name == name => {
                        Some((hdr, head.to_vec()))
                    }
                    _ => None,
                }
            })?;
            if let Some((hdr, mut value)) = hit {
                // Pull the continuation chain for the full value.
                let mut cont = hdr.cont;
                while cont != 0 && value.len() < hdr.value_len as usize {
                    let cva = Vaddr::from_u64(cont).ok_or(Error::CorruptData(xe.va))?;
                    let ce = self.require(cva)?;
                    cont = self.with_xnode(&ce, |d| {
                        value.extend_from_slice(&d.heap[..d.heap_end as usize]);
                        d.next
                    })?;
                }
                value.truncate(hdr.value_len as usize);
                return Ok(Some((xe, prev, value)));
            }
            prev = Some(xe.clone());
            link = self.with_xnode(&xe, |d| d.next)?;
        }
        Ok(None)
    }

    /// Frees a record node and its continuation chain; relinks the
    /// record chain around it.
    fn chain_unlink(
        &self,
        ie: &Centry,
        xe: &Arc<Centry>,
        prev: Option<Arc<Centry>>,
    ) -> Result<()> {
        let (next, mut cont) = self.with_xnode(xe, |d| {
            (d.next, xrec_at(&d.heap, 0).map(|(h, _, _)| h.cont).unwrap_or(0))
        })?;
        while cont != 0 {
            let cva = Vaddr::from_u64(cont).ok_or(Error::CorruptData(xe.va))?;
            let ce = self.require(cva)?;
            cont = self.with_xnode(&ce, |d| d.next)?;
            self.free_va(cva)?;
        }
        match prev {
            Some(pe) => self.with_xnode_mut(&pe, |d| d.next = next)?,
            None => self.with_inode_mut(ie, |d| d.xa_head = next)?,
        }
        self.free_va(xe.va)
    }

    /// Stores a record too large for the inline area.
    fn chain_insert(&self, ie: &Centry, ino: u64, name: &[u8], value: &[u8]) -> Result<()> {
        let head_cap = XNODE_HEAP_SIZE - XREC_HDR_SIZE - name.len();
        let head_len = value.len().min(head_cap);
        let xe = self.xnode_new(ino)?;

        // Continuations first, so the record node links a complete
        // chain.
        let mut cont_head = 0u64;
        let rest = &value[head_len..];
        if !rest.is_empty() {
            let mut chunks: Vec<&[u8]> = rest.chunks(XNODE_HEAP_SIZE).collect();
            chunks.reverse();
            for chunk in chunks {
                let ce = self.xnode_new(ino)?;
                let next = cont_head;
                self.with_xnode_mut(&ce, |d| {
                    d.next = next;
                    d.heap_end = chunk.len() as u32;
                    d.heap[..chunk.len()].copy_from_slice(chunk);
                })?;
                cont_head = ce.va.to_u64();
            }
        }

        let old_head = self.with_inode(ie, |d| d.xa_head)?;
        let rec_len = rec_len_for(name.len(), head_len).min(XNODE_HEAP_SIZE);
        self.with_xnode_mut(&xe, |d| {
            let hdr = DXrec {
                value_len: value.len() as u32,
                rec_len: rec_len as u16,
                name_len: name.len() as u8,
                in_use: 1,
                cont: cont_head,
            };
            put_xrec(&mut d.heap, 0, hdr, name, &value[..head_len]);
            d.nrecs = 1;
            d.heap_end = rec_len as u32;
            d.next = old_head;
        })?;
        self.with_inode_mut(ie, |d| d.xa_head = xe.va.to_u64())
    }

    // ------------------------------------------------------------------
    // Operations

    pub fn setxattr_op(&self, ino: u64, name: &[u8], value: &[u8], set: XattrSet) -> Result<()> {
        check_xattr_name(name)?;
        if value.len() > XATTR_VALUE_MAX {
            return Err(Error::ArgTooBig);
        }
        let ie = self.require_inode(ino)?;
        let inline_hit = self.inline_find(&ie, name)?;
        let chain_hit = self.chain_find(&ie, name)?;
        let exists = inline_hit.is_some() || chain_hit.is_some();
        match set {
            XattrSet::Create if exists => return Err(Error::Exists),
            XattrSet::Replace if !exists => return Err(Error::NotFound),
            _ => {}
        }

        // Replace is remove-then-insert; both halves stay within this
        // operation, so ctime moves once.
        if let Some((off, _)) = inline_hit {
            self.with_inode_mut(&ie, |d| {
                if let Some((found, _, _)) = xrec_at(&d.xa_inline, off) {
                    let mut hdr = found;
                    hdr.in_use = 0;
                    d.xa_inline[off..off + XREC_HDR_SIZE].copy_from_slice(hdr.as_bytes());
                }
            })?;
        }
        if let Some((xe, prev, _)) = chain_hit {
            self.chain_unlink(&ie, &xe, prev)?;
        }

        let need = rec_len_for(name.len(), value.len());
        let inline_off = if need <= XATTR_INLINE_SIZE {
            self.with_inode(&ie, |d| {
                let mut off = 0usize;
                while let Some((hdr, _, _)) = xrec_at(&d.xa_inline, off) {
                    if hdr.in_use == 0 && hdr.rec_len as usize >= need {
                        return Some((off, hdr.rec_len));
                    }
                    off += hdr.rec_len as usize;
                }
                if off + need <= XATTR_INLINE_SIZE {
                    Some((off, need as u16))
                } else {
                    None
                }
            })?
        } else {
            None
        };

        match inline_off {
            Some((off, rec_len)) => self.with_inode_mut(&ie, |d| {
                let hdr = DXrec {
                    value_len: value.len() as u32,
                    rec_len,
                    name_len: name.len() as u8,
                    in_use: 1,
                    cont: 0,
                };
                put_xrec(&mut d.xa_inline, off, hdr, name, value);
            })?,
            None => self.chain_insert(&ie, ino, name, value)?,
        }
        self.with_inode_mut(&ie, touch_ctime)?;
        debug!("setxattr ino {} {:?}", ino, String::from_utf8_lossy(name));
        Ok(())
    }

    pub fn getxattr_op(&self, ino: u64, name: &[u8]) -> Result<Vec<u8>> {
        check_xattr_name(name)?;
        let ie = self.require_inode(ino)?;
        if let Some((_, value)) = self.inline_find(&ie, name)? {
            return Ok(value);
        }
        if let Some((_, _, value)) = self.chain_find(&ie, name)? {
            return Ok(value);
        }
        Err(Error::NoAttr)
    }

    pub fn removexattr_op(&self, ino: u64, name: &[u8]) -> Result<()> {
        check_xattr_name(name)?;
        let ie = self.require_inode(ino)?;
        if let Some((off, _)) = self.inline_find(&ie, name)? {
            self.with_inode_mut(&ie, |d| {
                if let Some((found, _, _)) = xrec_at(&d.xa_inline, off) {
                    let mut hdr = found;
                    hdr.in_use = 0;
                    d.xa_inline[off..off + XREC_HDR_SIZE].copy_from_slice(hdr.as_bytes());
                }
            })?;
        } else if let Some((xe, prev, _)) = self.chain_find(&ie, name)? {
            self.chain_unlink(&ie, &xe, prev)?;
        } else {
            return Err(Error::NoAttr);
        }
        self.with_inode_mut(&ie, touch_ctime)
    }

    pub fn listxattr_op(&self, ino: u64) -> Result<Vec<Vec<u8>>> {
        let ie = self.require_inode(ino)?;
        let mut names: Vec<Vec<u8>> = self.with_inode(&ie, |d| {
            let mut out = Vec::new();
            let mut off = 0usize;
            while let Some((hdr, name, _)) = xrec_at(&d.xa_inline, off) {
                if hdr.in_use != 0 {
                    out.push(name.to_vec());
                }
                off += hdr.rec_len as usize;
            }
            out
        })?;
        let mut link = self.with_inode(&ie, |d| d.xa_head)?;
        while link != 0 {
            let va = Vaddr::from_u64(link).ok_or(Error::CorruptData(ie.va))?;
            let xe = self.require(va)?;
            link = self.with_xnode(&xe, |d| {
                if let Some((hdr, name, _)) = xrec_at(&d.heap, 0) {
                    if hdr.in_use != 0 {
                        names.push(name.to_vec());
                    }
                }
                d.next
            })?;
        }
        Ok(names)
    }

    /// Frees every record and continuation node of the inode.
    pub fn xattr_drop_all(&self, ie: &Centry) -> Result<()> {
        let mut link = self.with_inode(ie, |d| d.xa_head)?;
        while link != 0 {
            let va = Vaddr::from_u64(link).ok_or(Error::CorruptData(ie.va))?;
            let xe = self.require(va)?;
            let (next, mut cont) = self.with_xnode(&xe, |d| {
                (d.next, xrec_at(&d.heap, 0).map(|(h, _, _)| h.cont).unwrap_or(0))
            })?;
            while cont != 0 {
                let cva = Vaddr::from_u64(cont).ok_or(Error::CorruptData(xe.va))?;
                let ce = self.require(cva)?;
                cont = self.with_xnode(&ce, |d| d.next)?;
                self.free_va(cva)?;
            }
            self.free_va(va)?;
            link = next;
        }
        self.with_inode_mut(ie, |d| d.xa_head = 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rec_len_alignment() {
        assert_eq!(rec_len_for(0, 0), 16);
        assert_eq!(rec_len_for(4, 4), 24);
        assert_eq!(rec_len_for(5, 10) % 8, 0);
    }

    #[test]
    fn xrec_heap_roundtrip() {
        let mut heap = [0u8; 256];
        let hdr = DXrec {
            value_len: 5,
            rec_len: rec_len_for(3, 5) as u16,
            name_len: 3,
            in_use: 1,
            cont: 0,
        };
        put_xrec(&mut heap, 0, hdr, b"foo", b"hello");
        let (back, name, head) = xrec_at(&heap, 0).unwrap();
        assert_eq!(back.value_len, 5);
        assert_eq!(name, b"foo");
        assert_eq!(head, b"hello");
        assert!(xrec_at(&heap, back.rec_len as usize).is_none());
    }

    #[test]
    fn name_checks() {
        assert!(check_xattr_name(b"user.data").is_ok());
        assert!(check_xattr_name(b"").is_err());
        assert!(check_xattr_name(&[b'a'; NAME_MAX + 1]).is_err());
    }
}
