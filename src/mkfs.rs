//! Volume formatting.
//!
//! Lays out a fresh volume: one space-map per allocation group, the
//! root directory inode, and the superblock written last so a torn
//! format never looks mountable.

use std::path::Path;

use log::info;
use uuid::Uuid;
use zerocopy::FromBytes;

use crate::codec::BlockCodec;
use crate::error::{Error, Result};
use crate::layout::{DInode, DSuper, FORMAT_VERSION};
use crate::node::Node;
use crate::param::{AG_NBK, BK_SIZE};
use crate::pstor::encode_node;
use crate::spacemap::Agmap;
use crate::vaddr::{ino_of, Kind, Vaddr};
use crate::volume::Volume;

/// Formats `path` as a fresh volume of `size` bytes; returns the new
/// volume's UUID.
pub fn mkfs(path: &Path, size: u64, codec: Box<dyn BlockCodec>) -> Result<Uuid> {
    let vol = Volume::create(path, size, codec)?;
    let nag = vol.nag();
    let fs_uuid = Uuid::new_v4();

    let mut agmaps: Vec<Agmap> = (0..nag).map(Agmap::new).collect();
    agmaps[0].alloc_at(Kind::Super, 0)?;
    agmaps[0].alloc_at(Kind::Agmap, 1)?;
    for am in agmaps.iter_mut().skip(1) {
        let _ = am.alloc_at(Kind::Agmap, 0)?;
    }

    let root_va = agmaps[0].alloc(Kind::Inode).ok_or(Error::OutOfSpace)?;
    let root_ino = ino_of(root_va);
    let mut root: DInode = FromBytes::new_zeroed();
    root.ino = root_ino;
    root.parent = root_ino;
    root.mode = libc::S_IFDIR | 0o755;
    root.nlink = 2;
    let (sec, nsec) = crate::fs::unix_now();
    root.times.atime_sec = sec;
    root.times.atime_nsec = nsec;
    root.times.mtime_sec = sec;
    root.times.mtime_nsec = nsec;
    root.times.ctime_sec = sec;
    root.times.ctime_nsec = nsec;
    root.times.btime_sec = sec;
    root.times.btime_nsec = nsec;
    root.dir_seed = u64::from_le_bytes(
        Uuid::new_v4().as_bytes()[..8].try_into().map_err(|_| Error::Invalid)?,
    );

    let nbk_total = (nag as u64) * (AG_NBK as u64);
    let nbk_used: u64 = agmaps.iter().map(|am| am.nused_total()).sum();
    let mut sb: DSuper = FromBytes::new_zeroed();
    sb.version = FORMAT_VERSION;
    sb.bk_size = BK_SIZE as u32;
    sb.ag_nbk = AG_NBK as u32;
    sb.nag = nag;
    sb.root_ino = root_ino;
    sb.uuid = *fs_uuid.as_bytes();
    sb.active = 0;
    sb.nbk_total = nbk_total;
    sb.nbk_free = nbk_total - nbk_used;
    sb.nino_used = 1;

    // Children before parents, superblock last.
    let root_bk = encode_node(root_va, &Node::Inode(Box::new(root)), 0);
    vol.write_block(root_va, &root_bk)?;
    for am in &agmaps {
        let va = Vaddr::agmap(am.ag);
        let bk = encode_node(va, &Node::Agmap(Box::new(am.clone())), 0);
        vol.write_block(va, &bk)?;
    }
    let sb_bk = encode_node(Vaddr::super_(), &Node::Super(Box::new(sb)), 0);
    vol.write_block(Vaddr::super_(), &sb_bk)?;
    vol.sync()?;
    info!("formatted {} with {} allocation groups, uuid {}", path.display(), nag, fs_uuid);
    Ok(fs_uuid)
}
