//! Persistent storage engine: the only path between cached nodes and
//! the volume.
//!
//! Fetching reads one block, verifies the common header against the
//! expected virtual address, decodes the node and publishes it into the
//! waiting cache entry. Storing snapshots the node under its entry
//! lock, seals it and writes the whole block. The engine never decides
//! freeness and never mutates logical state.
//!
//! Write ordering: dirty nodes are grouped into waves such that a child
//! is always durable before the parent that points at it, with the
//! superblock alone in the final wave. The pipelined flush and the
//! synchronous flush below share this schedule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use crate::cache::{Cache, Centry};
use crate::codec::{new_bkbuf, BkBuf};
use crate::crc::crc32;
use crate::error::{Error, Result};
use crate::layout::{DAgmap, DDnode, DFnode, DInode, DNodeHdr, DSuper, DXnode};
use crate::node::Node;
use crate::param::{BK_SIZE, NODE_HDR_SIZE};
use crate::spacemap::Agmap;
use crate::vaddr::{Kind, Vaddr};
use crate::volume::Volume;

/// Offset of the crc field within the common header.
const HDR_CRC_OFF: usize = 12;

/// Cumulative volume I/O counters, mirrored into the superblock at
/// flush time and exported through the pseudo namespace.
#[derive(Default)]
pub struct Iostat {
    pub rd_ops: AtomicU64,
    pub rd_bytes: AtomicU64,
    pub wr_ops: AtomicU64,
    pub wr_bytes: AtomicU64,
}

impl Iostat {
    fn count_read(&self) {
        let _ = self.rd_ops.fetch_add(1, Ordering::Relaxed);
        let _ = self.rd_bytes.fetch_add(BK_SIZE as u64, Ordering::Relaxed);
    }

    fn count_write(&self) {
        let _ = self.wr_ops.fetch_add(1, Ordering::Relaxed);
        let _ = self.wr_bytes.fetch_add(BK_SIZE as u64, Ordering::Relaxed);
    }
}

pub struct Pstor {
    vol: Volume,
    cache: Arc<Cache>,
    pub iostat: Iostat,
}

impl Pstor {
    pub fn new(vol: Volume, cache: Arc<Cache>) -> Pstor {
        Pstor { vol, cache, iostat: Iostat::default() }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn volume(&self) -> &Volume {
        &self.vol
    }

    /// Reads, verifies and decodes the node for a `Loading` entry, then
    /// publishes it. A failure faults the entry so that parked tasks
    /// observe the error instead of waiting forever.
    pub fn fetch(&self, entry: &Centry) -> Result<()> {
        match self.load_node(entry.va) {
            Ok((node, generation)) => {
                entry.resolve(node, generation);
                Ok(())
            }
            Err(err) => {
                entry.fault();
                Err(err)
            }
        }
    }

    /// Reads and decodes one node straight from the volume.
    pub fn load_node(&self, va: Vaddr) -> Result<(Node, u64)> {
        let bk = self.vol.read_block(va)?;
        self.iostat.count_read();
        decode_node(va, bk)
    }

    /// Snapshots, seals and writes one dirty node. The dirty bit is
    /// cleared only if the node was not re-mutated while the write was
    /// in flight.
    pub fn store(&self, entry: &Centry) -> Result<()> {
        let (bk, generation) = {
            let guard = entry.node();
            let node = guard.as_ref().ok_or(Error::CorruptData(entry.va))?;
            (encode_node(entry.va, node, entry.generation()), entry.generation())
        };
        self.vol.write_block(entry.va, &bk)?;
        self.iostat.count_write();
        if entry.generation() == generation {
            entry.clear_dirty();
        }
        Ok(())
    }

    /// Loads through the cache, synchronously. This is the non-pipelined
    /// path used by mkfs, the offline checker, and the unit-test
    /// executor; the server resolves misses through storage jobs
    /// instead.
    pub fn require_now(&self, va: Vaddr) -> Result<Arc<Centry>> {
        let (entry, created) = self.cache.grab(va);
        if created {
            self.fetch(&entry)?;
        }
        match entry.state() {
            crate::cache::CS_READY => Ok(entry),
            _ => Err(Error::CorruptData(va)),
        }
    }

    /// Flush wave of a dirty node; lower waves are written first.
    pub fn wave_of(entry: &Centry) -> u32 {
        match entry.va.kind {
            Kind::Leaf | Kind::Xnode => 0,
            Kind::Fnode => {
                // Child fnodes carry a smaller height than their parent.
                let guard = entry.node();
                match guard.as_ref() {
                    Some(Node::Fnode(f)) => f.height.min(crate::param::HEIGHT_MAX),
                    _ => crate::param::HEIGHT_MAX,
                }
            }
            Kind::Dnode => 6,
            Kind::Inode => 7,
            Kind::Agmap => 8,
            Kind::Super => 9,
        }
    }

    /// Synchronous wave-ordered flush of all (or one inode's) dirty
    /// nodes, superblock last, followed by a device sync.
    pub fn flush_now(&self, owner: Option<u64>) -> Result<()> {
        let mut dirty = self.cache.collect_dirty();
        if let Some(ino) = owner {
            // Space-maps and the superblock always ride along so that
            // allocation state is durable with the data it covers.
            dirty.retain(|e| {
                e.owner() == ino || matches!(e.va.kind, Kind::Agmap | Kind::Super)
            });
        }
        dirty.sort_by_key(|e| (Self::wave_of(e), e.va));
        for entry in dirty {
            self.store(&entry)?;
        }
        self.vol.sync()?;
        Ok(())
    }
}

/// Builds the sealed block image of one node.
pub fn encode_node(va: Vaddr, node: &Node, generation: u64) -> BkBuf {
    let mut bk = new_bkbuf();
    let length = match node {
        Node::Leaf(payload) => {
            bk.copy_from_slice(&payload[..]);
            return bk;
        }
        Node::Super(d) => copy_into(&mut bk, d.as_bytes()),
        Node::Inode(d) => copy_into(&mut bk, d.as_bytes()),
        Node::Dnode(d) => copy_into(&mut bk, d.as_bytes()),
        Node::Fnode(d) => copy_into(&mut bk, d.as_bytes()),
        Node::Xnode(d) => copy_into(&mut bk, d.as_bytes()),
        Node::Agmap(am) => {
            let mut d: DAgmap = FromBytes::new_zeroed();
            am.encode_into(&mut d);
            copy_into(&mut bk, d.as_bytes())
        }
    };
    let hdr = DNodeHdr {
        magic: va.kind.magic(),
        length: length as u32,
        crc: 0,
        vaddr: va.to_u64(),
        generation,
        reserved: [0; 32],
    };
    bk[..NODE_HDR_SIZE].copy_from_slice(hdr.as_bytes());
    let crc = crc32(&bk[..length]);
    bk[HDR_CRC_OFF..HDR_CRC_OFF + 4].copy_from_slice(&crc.to_le_bytes());
    bk
}

fn copy_into(bk: &mut [u8; BK_SIZE], bytes: &[u8]) -> usize {
    bk[..bytes.len()].copy_from_slice(bytes);
    bytes.len()
}

/// Verifies the common header and decodes a block into its node form.
pub fn decode_node(va: Vaddr, bk: BkBuf) -> Result<(Node, u64)> {
    if va.kind == Kind::Leaf {
        // Raw payload; integrity is the parent slot's checksum, checked
        // by the file-map on first use.
        return Ok((Node::Leaf(bk), 0));
    }
    let hdr = DNodeHdr::read_from_prefix(&bk[..]).ok_or(Error::CorruptData(va))?;
    if hdr.magic & !0xFF != Kind::Super.magic() & !0xFF {
        return Err(Error::BadMagic);
    }
    if hdr.magic != va.kind.magic() {
        return Err(Error::WrongKind(va));
    }
    if hdr.vaddr != va.to_u64() {
        return Err(Error::CorruptData(va));
    }
    let length = hdr.length as usize;
    if length < NODE_HDR_SIZE || length > BK_SIZE {
        return Err(Error::CorruptData(va));
    }
    let mut image = bk;
    image[HDR_CRC_OFF..HDR_CRC_OFF + 4].copy_from_slice(&[0; 4]);
    if crc32(&image[..length]) != hdr.crc {
        return Err(Error::CorruptData(va));
    }

    let node = match va.kind {
        Kind::Super => Node::Super(read_struct::<DSuper>(va, &image)?),
        Kind::Inode => Node::Inode(read_struct::<DInode>(va, &image)?),
        Kind::Dnode => Node::Dnode(read_struct::<DDnode>(va, &image)?),
        Kind::Fnode => Node::Fnode(read_struct::<DFnode>(va, &image)?),
        Kind::Xnode => Node::Xnode(read_struct::<DXnode>(va, &image)?),
        Kind::Agmap => {
            let d = read_struct::<DAgmap>(va, &image)?;
            Node::Agmap(Box::new(Agmap::decode(&d)?))
        }
        Kind::Leaf => unreachable!(),
    };
    Ok((node, hdr.generation))
}

fn read_struct<T: FromBytes>(va: Vaddr, image: &[u8; BK_SIZE]) -> Result<Box<T>> {
    let v = T::read_from_prefix(&image[..]).ok_or(Error::CorruptData(va))?;
    Ok(Box::new(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inode_va() -> Vaddr {
        Vaddr::new(Kind::Inode, 0, 5)
    }

    fn sample_inode() -> Node {
        let mut d: DInode = FromBytes::new_zeroed();
        d.ino = 5;
        d.mode = libc::S_IFREG | 0o644;
        d.nlink = 1;
        d.size = 4096;
        Node::Inode(Box::new(d))
    }

    #[test]
    fn encode_decode_roundtrip() {
        let bk = encode_node(inode_va(), &sample_inode(), 7);
        let (node, generation) = decode_node(inode_va(), bk).unwrap();
        assert_eq!(generation, 7);
        match node {
            Node::Inode(d) => {
                assert_eq!(d.ino, 5);
                assert_eq!(d.size, 4096);
            }
            _ => panic!("wrong node kind"),
        }
    }

    #[test]
    fn decode_rejects_flipped_bit() {
        let mut bk = encode_node(inode_va(), &sample_inode(), 1);
        bk[100] ^= 0x01;
        assert!(matches!(decode_node(inode_va(), bk), Err(Error::CorruptData(_))));
    }

    #[test]
    fn decode_rejects_wrong_kind() {
        let bk = encode_node(inode_va(), &sample_inode(), 1);
        let other = Vaddr::new(Kind::Dnode, 0, 5);
        assert!(matches!(decode_node(other, bk), Err(Error::WrongKind(_))));
    }

    #[test]
    fn decode_rejects_relocated_block() {
        let bk = encode_node(inode_va(), &sample_inode(), 1);
        let other = Vaddr::new(Kind::Inode, 0, 6);
        assert!(matches!(decode_node(other, bk), Err(Error::CorruptData(_))));
    }

    #[test]
    fn leaf_is_raw() {
        let mut payload = new_bkbuf();
        payload[0] = 0xEE;
        let va = Vaddr::new(Kind::Leaf, 2, 2);
        let bk = encode_node(va, &Node::Leaf(payload), 0);
        assert_eq!(bk[0], 0xEE);
        let (node, _) = decode_node(va, bk).unwrap();
        assert!(matches!(node, Node::Leaf(_)));
    }
}
