//! volufs: a user-space volume filesystem.
//!
//! A single fixed-size volume file is carved into allocation groups of
//! power-of-two blocks; every persistent node (superblock, space-maps,
//! inodes, directory nodes, file-map nodes, data leaves, xattr nodes)
//! lives in exactly one block and is named by a stable virtual
//! address. Layers, bottom up:
//!   + Codec and volume: whole-block transfer with torn-write
//!     detection.
//!   + Space-maps: per-AG, per-kind allocation bitmaps.
//!   + Cache: bounded, single-instance-per-address object cache.
//!   + Storage engine: fetch/store of whole nodes, wave-ordered flush.
//!   + Filesystem engines: inodes, directories, file-maps, xattrs.
//!   + Pipeline: RX / VPROC / SIO / TX stage workers over bounded
//!     queues, with a pending set for tasks awaiting block I/O.

pub mod cache;
pub mod check;
pub mod codec;
pub mod crc;
pub mod error;
pub mod fs;
pub mod layout;
pub mod mkfs;
pub mod node;
pub mod param;
pub mod pstor;
pub mod server;
pub mod spacemap;
pub mod vaddr;
pub mod volume;

pub use error::{Error, Result};
pub use fs::Fsys;
pub use server::Server;
