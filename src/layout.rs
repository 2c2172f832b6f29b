//! On-disk node formats.
//!
//! Every metadata block starts with the common [`DNodeHdr`]: kind magic,
//! used length, CRC32, the node's own packed virtual address and a
//! generation counter. Data leaves are raw block-sized payloads; their
//! checksums live in the parent's child slot, so the leaf span stays a
//! power of two.
//!
//! All fields are little-endian. Structs derive zerocopy traits and are
//! laid out without implicit padding; the `const_assert`s below keep
//! every node inside one block.

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::param::{
    AG_NBK, BK_SIZE, DIR_NBUCKETS, DNODE_HEAP_SIZE, FANOUT, NODE_HDR_SIZE, SYMLNK_INLINE_MAX,
    XATTR_INLINE_SIZE,
};
use crate::vaddr::NKIND;

/// Volume format version understood by this implementation.
pub const FORMAT_VERSION: u32 = 1;

/// Bytes of record heap in one xattr node.
pub const XNODE_HEAP_SIZE: usize = 8064;

/// Common header at the head of every metadata block.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DNodeHdr {
    /// Kind magic, `Kind::magic()`.
    pub magic: u64,
    /// Used bytes in this block, header included.
    pub length: u32,
    /// CRC32 over the used bytes, computed with this field zeroed.
    pub crc: u32,
    /// The node's own packed virtual address.
    pub vaddr: u64,
    /// Bumped on every store of the node.
    pub generation: u64,
    pub reserved: [u8; 32],
}

const_assert!(core::mem::size_of::<DNodeHdr>() == NODE_HDR_SIZE);

/// A child slot of the file-map: packed leaf/fnode address plus the
/// child's payload checksum when the child is a raw leaf.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DChild {
    /// Packed vaddr of the child, 0 for a hole.
    pub ptr: u64,
    /// CRC32 of the child leaf payload; unused for interior children.
    pub crc: u32,
    /// See `CHILD_UNWRITTEN`.
    pub flags: u32,
}

/// Child carries no persisted bytes; reads yield zeros.
pub const CHILD_UNWRITTEN: u32 = 1;

const_assert!(core::mem::size_of::<DChild>() == 16);

impl DChild {
    pub fn hole() -> DChild {
        DChild { ptr: 0, crc: 0, flags: 0 }
    }

    pub fn is_hole(&self) -> bool {
        self.ptr == 0
    }

    pub fn is_unwritten(&self) -> bool {
        self.flags & CHILD_UNWRITTEN != 0
    }
}

/// Superblock, block 0 of AG 0.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DSuper {
    pub hdr: DNodeHdr,
    pub version: u32,
    pub bk_size: u32,
    pub ag_nbk: u32,
    pub nag: u32,
    pub feature_flags: u64,
    pub root_ino: u64,
    pub uuid: [u8; 16],
    /// Non-zero while the filesystem accepts requests.
    pub active: u32,
    pub pad0: u32,
    /// Committed counters; `statvfs` reads these, never the cache.
    pub nbk_total: u64,
    pub nbk_free: u64,
    pub nino_used: u64,
    /// Cumulative I/O counters.
    pub rd_ops: u64,
    pub rd_bytes: u64,
    pub wr_ops: u64,
    pub wr_bytes: u64,
    pub mount_count: u64,
}

const_assert!(core::mem::size_of::<DSuper>() <= BK_SIZE);

/// Per-AG space-map: one bitmap per kind over the AG's blocks.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DAgmap {
    pub hdr: DNodeHdr,
    pub ag: u32,
    pub pad0: u32,
    /// Allocated-block count per kind.
    pub nused: [u64; NKIND],
    /// One bit per block per kind.
    pub bitmap: [[u8; AG_NBK / 8]; NKIND],
}

const_assert!(core::mem::size_of::<DAgmap>() <= BK_SIZE);

/// Timestamps: seconds and nanoseconds, spelled out to keep the struct
/// padding-free.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DTimes {
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
    pub btime_sec: u64,
    pub btime_nsec: u64,
}

/// On-disk inode. One whole block, so the directory bucket table, the
/// short symlink target and the xattr head all live inline.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DInode {
    pub hdr: DNodeHdr,
    pub ino: u64,
    /// Parent directory ino; maintained for `..` and offline checking.
    pub parent: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    /// Allocated blocks reachable from the file-map, leaves and interiors.
    pub nblocks: u64,
    pub times: DTimes,
    pub iflags: u64,

    /// Directory state: seeded name hash plus the bucket table.
    pub dir_seed: u64,
    pub dir_nentries: u64,
    pub dir_buckets: [u64; DIR_NBUCKETS],
    pub pad0: u64,

    /// File-map root. Height 0 is an empty map; height 1 points straight
    /// at a leaf; greater heights point at an FNODE of that height.
    pub fm_height: u32,
    pub pad1: u32,
    pub fm_root: DChild,

    /// Symlink target: inline when short, spilled to one leaf otherwise.
    pub sym_len: u32,
    pub pad2: u32,
    pub sym_leaf: DChild,
    pub sym_inline: [u8; SYMLNK_INLINE_MAX],

    /// Xattr: inline record area plus the overflow chain head.
    pub xa_head: u64,
    pub xa_inline: [u8; XATTR_INLINE_SIZE],
}

const_assert!(core::mem::size_of::<DInode>() <= BK_SIZE);

/// Directory hash-bucket node: a chain link plus a record heap.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DDnode {
    pub hdr: DNodeHdr,
    pub bucket: u32,
    pub pad0: u32,
    /// Next node of the same bucket chain, packed vaddr or 0.
    pub next: u64,
    pub nentries: u32,
    /// Append frontier within `heap`.
    pub heap_end: u32,
    pub heap: [u8; DNODE_HEAP_SIZE],
}

const_assert!(core::mem::size_of::<DDnode>() <= BK_SIZE);

/// Directory entry record header inside a dnode heap. The name bytes
/// follow it; `rec_len` is the full record length rounded up to 8.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DDirent {
    /// 0 marks a tombstone; record positions never shift.
    pub ino: u64,
    pub hash: u64,
    pub rec_len: u16,
    pub name_len: u8,
    pub dtype: u8,
    pub pad0: u32,
}

pub const DIRENT_HDR_SIZE: usize = core::mem::size_of::<DDirent>();

const_assert!(DIRENT_HDR_SIZE == 24);

/// File-map interior node.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DFnode {
    pub hdr: DNodeHdr,
    /// Level of this node in the tree; leaves hang off height 2.
    pub height: u32,
    /// Non-hole child count; the node is freed when it reaches 0.
    pub nchildren: u32,
    pub child: [DChild; FANOUT],
}

const_assert!(core::mem::size_of::<DFnode>() <= BK_SIZE);

/// Xattr overflow node: records, or raw continuation bytes of one large
/// value.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DXnode {
    pub hdr: DNodeHdr,
    /// Next record node, or next continuation of a large value.
    pub next: u64,
    pub nrecs: u32,
    pub heap_end: u32,
    pub heap: [u8; XNODE_HEAP_SIZE],
}

const_assert!(core::mem::size_of::<DXnode>() <= BK_SIZE);

/// Xattr record header inside an xnode heap or the inode inline area.
/// Name bytes follow the header, then the head of the value; values
/// larger than the remaining heap continue in `cont` nodes.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DXrec {
    pub value_len: u32,
    pub rec_len: u16,
    pub name_len: u8,
    /// 0 marks a tombstone.
    pub in_use: u8,
    /// First continuation xnode, packed vaddr or 0.
    pub cont: u64,
}

pub const XREC_HDR_SIZE: usize = core::mem::size_of::<DXrec>();

const_assert!(XREC_HDR_SIZE == 16);

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn sizes_fit_block() {
        assert!(size_of::<DSuper>() <= BK_SIZE);
        assert!(size_of::<DAgmap>() <= BK_SIZE);
        assert!(size_of::<DInode>() <= BK_SIZE);
        assert!(size_of::<DDnode>() <= BK_SIZE);
        assert!(size_of::<DFnode>() <= BK_SIZE);
        assert!(size_of::<DXnode>() <= BK_SIZE);
    }

    #[test]
    fn header_is_64_bytes() {
        assert_eq!(size_of::<DNodeHdr>(), NODE_HDR_SIZE);
    }
}
