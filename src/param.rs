//! Volume-format and runtime limit constants.

/// Block size (bytes). Every persistent node occupies exactly one block.
pub const BK_SIZE: usize = 8192;

/// Blocks per allocation group.
pub const AG_NBK: usize = 1024;

/// Allocation-group span (bytes).
pub const AG_SIZE: u64 = (BK_SIZE * AG_NBK) as u64;

/// Minimum number of allocation groups in a volume.
pub const NAG_MIN: usize = 2;

/// Maximum number of allocation groups in a volume (16 TiB).
pub const NAG_MAX: usize = 2 * 1024 * 1024;

/// Minimal volume size.
pub const VOLUME_SIZE_MIN: u64 = AG_SIZE * (NAG_MIN as u64);

/// Maximal volume size.
pub const VOLUME_SIZE_MAX: u64 = AG_SIZE * (NAG_MAX as u64);

/// Common node header size at the head of every metadata block (bytes).
pub const NODE_HDR_SIZE: usize = 64;

/// File-map radix fan-out: child slots per interior node.
pub const FANOUT: usize = 256;

/// Maximal file-map height: level 1 is the leaf level, levels 2 and up
/// are interior nodes.
pub const HEIGHT_MAX: u32 = 5;

/// Maximal file size: FANOUT^(HEIGHT_MAX-1) leaves of BK_SIZE bytes (32 TiB).
pub const FILESIZE_MAX: u64 = (BK_SIZE as u64) << (8 * (HEIGHT_MAX - 1));

/// Maximal length of a directory-entry name.
pub const NAME_MAX: usize = 255;

/// Maximal number of hard links to a single inode.
pub const LINK_MAX: u32 = 32767;

/// Symlink target bytes stored inline within the inode.
pub const SYMLNK_INLINE_MAX: usize = 1024;

/// Maximal symlink target length; longer targets are rejected.
pub const SYMLNK_MAX: usize = 4095;

/// Hash buckets per directory.
pub const DIR_NBUCKETS: usize = 61;

/// Bytes of entry heap in one directory node.
pub const DNODE_HEAP_SIZE: usize = 7 * 1024;

/// Xattr record bytes stored inline within the inode.
pub const XATTR_INLINE_SIZE: usize = 1024;

/// Maximal xattr value length.
pub const XATTR_VALUE_MAX: usize = 64 * 1024;

/// First pseudo inode number; volume inodes never reach this range.
pub const PSEUDO_INO_BASE: u64 = 1 << 60;

/// Default storage-I/O worker count.
pub const NSIO_DEFAULT: usize = 4;

/// Maximal storage-I/O worker count.
pub const NSIO_MAX: usize = 8;

/// Depth of each inter-stage job queue.
pub const QUEUE_DEPTH: usize = 256;

/// Queue dequeue timeout driving periodic housekeeping (milliseconds).
pub const DEQ_TIMEOUT_MS: u64 = 50;

/// Default cache budget, in cached blocks.
pub const CACHE_NBK_DEFAULT: usize = 8192;

/// Open file handles per mount.
pub const NOPENF_MAX: usize = 4096;

/// Maximal frame payload accepted from the adaptor.
pub const FRAME_PAYLOAD_MAX: usize = IO_SIZE_MAX + 4096;

/// Maximal read/write I/O size per request.
pub const IO_SIZE_MAX: usize = 1024 * 1024;
