//! Per-allocation-group space-maps.
//!
//! Each AG tracks its blocks with one bitmap per node kind. A block is
//! free iff it is clear in every kind's bitmap, so the in-memory form
//! also carries the union bitmap for fast free-slot scans. Within an AG
//! the allocator hands out the lowest free slot to keep the working set
//! compact; rotation across AGs is the caller's policy.

use bitmaps::Bitmap;

use crate::error::{Error, Result};
use crate::layout::DAgmap;
use crate::param::AG_NBK;
use crate::vaddr::{Kind, Vaddr, NKIND};

/// In-memory space-map of one allocation group.
#[derive(Clone)]
pub struct Agmap {
    pub ag: u32,
    nused: [u64; NKIND],
    maps: [Bitmap<AG_NBK>; NKIND],
    /// Union of all kind bitmaps.
    occupied: Bitmap<AG_NBK>,
}

impl Agmap {
    /// A blank map with every block free.
    pub fn new(ag: u32) -> Agmap {
        Agmap {
            ag,
            nused: [0; NKIND],
            maps: Default::default(),
            occupied: Bitmap::new(),
        }
    }

    /// Rebuilds the in-memory form from the on-disk record.
    pub fn decode(d: &DAgmap) -> Result<Agmap> {
        let mut am = Agmap::new(d.ag);
        for k in 0..NKIND {
            let mut map = Bitmap::new();
            let mut count = 0u64;
            for slot in 0..AG_NBK {
                if d.bitmap[k][slot / 8] & (1 << (slot % 8)) != 0 {
                    let _ = map.set(slot, true);
                    count += 1;
                    if am.occupied.set(slot, true) {
                        // Two kinds claim one block.
                        return Err(Error::CorruptData(Vaddr::agmap(d.ag)));
                    }
                }
            }
            if count != d.nused[k] {
                return Err(Error::CorruptData(Vaddr::agmap(d.ag)));
            }
            am.maps[k] = map;
            am.nused[k] = d.nused[k];
        }
        Ok(am)
    }

    /// Writes this map into the on-disk record's occupancy fields.
    pub fn encode_into(&self, d: &mut DAgmap) {
        d.ag = self.ag;
        d.nused = self.nused;
        for k in 0..NKIND {
            let mut bytes = [0u8; AG_NBK / 8];
            for slot in 0..AG_NBK {
                if self.maps[k].get(slot) {
                    bytes[slot / 8] |= 1 << (slot % 8);
                }
            }
            d.bitmap[k] = bytes;
        }
    }

    /// Allocates the lowest free slot for `kind`, if any.
    pub fn alloc(&mut self, kind: Kind) -> Option<Vaddr> {
        let slot = (0..AG_NBK).find(|slot| !self.occupied.get(*slot))?;
        let _ = self.maps[kind as usize].set(slot, true);
        let _ = self.occupied.set(slot, true);
        self.nused[kind as usize] += 1;
        Some(Vaddr::new(kind, self.ag, slot as u32))
    }

    /// Marks a specific slot allocated; used when laying out fixed
    /// nodes (superblock, the space-map itself).
    pub fn alloc_at(&mut self, kind: Kind, slot: u32) -> Result<Vaddr> {
        if self.occupied.get(slot as usize) {
            return Err(Error::Invalid);
        }
        let _ = self.maps[kind as usize].set(slot as usize, true);
        let _ = self.occupied.set(slot as usize, true);
        self.nused[kind as usize] += 1;
        Ok(Vaddr::new(kind, self.ag, slot))
    }

    /// Frees one slot. Freeing a free slot is a consistency error.
    pub fn free(&mut self, va: Vaddr) -> Result<()> {
        debug_assert_eq!(va.ag, self.ag);
        let slot = va.slot as usize;
        if !self.maps[va.kind as usize].get(slot) {
            return Err(Error::InvalidFree(va));
        }
        let _ = self.maps[va.kind as usize].set(slot, false);
        let _ = self.occupied.set(slot, false);
        self.nused[va.kind as usize] -= 1;
        Ok(())
    }

    pub fn is_allocated(&self, kind: Kind, slot: u32) -> bool {
        self.maps[kind as usize].get(slot as usize)
    }

    /// Free slots remaining in this AG.
    pub fn nfree(&self) -> usize {
        AG_NBK - self.nused_total() as usize
    }

    /// Allocated slots of one kind.
    pub fn nused_of(&self, kind: Kind) -> u64 {
        self.nused[kind as usize]
    }

    /// Total allocated slots.
    pub fn nused_total(&self) -> u64 {
        self.nused.iter().sum()
    }
}
