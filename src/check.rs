//! Offline volume verifier.
//!
//! Walks the volume without mounting it: superblock sanity, space-map
//! decoding, then a reachability sweep from the root inode that checks
//! every node's header, every leaf's checksum against its parent slot,
//! and finally cross-checks the per-AG per-kind occupancy counts
//! against the space-map bits.

use std::collections::VecDeque;
use std::path::Path;

use hashbrown::HashMap;
use log::info;

use crate::codec::BlockCodec;
use crate::error::{Error, Result};
use crate::layout::{
    DChild, DDirent, DInode, DXrec, DIRENT_HDR_SIZE, FORMAT_VERSION, XREC_HDR_SIZE,
};
use crate::node::Node;
use crate::param::{AG_NBK, BK_SIZE, SYMLNK_INLINE_MAX};
use crate::pstor::decode_node;
use crate::spacemap::Agmap;
use crate::vaddr::{va_of_ino, Kind, Vaddr};
use crate::volume::Volume;

/// Findings of one verification pass.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub nodes_checked: u64,
    pub inodes: u64,
    pub errors: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn err(&mut self, msg: String) {
        self.errors.push(msg);
    }
}

struct Checker {
    vol: Volume,
    agmaps: Vec<Agmap>,
    /// Reachable-node tally per (ag, kind).
    counted: HashMap<(u32, Kind), u64>,
    report: CheckReport,
}

impl Checker {
    fn load(&mut self, va: Vaddr) -> Result<Node> {
        let bk = self.vol.read_block(va)?;
        let (node, _) = decode_node(va, bk)?;
        self.report.nodes_checked += 1;
        Ok(node)
    }

    fn count(&mut self, va: Vaddr) {
        *self.counted.entry((va.ag, va.kind)).or_insert(0) += 1;
    }

    fn check_leaf(&mut self, slot: &DChild, what: &str) {
        let va = match Vaddr::from_u64(slot.ptr) {
            Some(va) if va.kind == Kind::Leaf => va,
            _ => {
                self.report.err(format!("{}: bad leaf pointer {:#x}", what, slot.ptr));
                return;
            }
        };
        self.count(va);
        if slot.is_unwritten() {
            return;
        }
        match self.vol.read_block(va) {
            Ok(bk) => {
                if crate::crc::crc32(&bk[..]) != slot.crc {
                    self.report.err(format!("{}: leaf {} checksum mismatch", what, va));
                }
            }
            Err(err) => self.report.err(format!("{}: leaf {} unreadable: {}", what, va, err)),
        }
    }

    fn check_filemap(&mut self, ino: u64, d: &DInode) {
        match d.fm_height {
            0 => {}
            1 => {
                if !d.fm_root.is_hole() {
                    self.check_leaf(&d.fm_root.clone(), &format!("ino {}", ino));
                }
            }
            h => {
                if !d.fm_root.is_hole() {
                    self.check_fnode_tree(ino, d.fm_root.ptr, h);
                }
            }
        }
    }

    fn check_fnode_tree(&mut self, ino: u64, ptr: u64, height: u32) {
        let va = match Vaddr::from_u64(ptr) {
            Some(va) if va.kind == Kind::Fnode => va,
            _ => {
                self.report.err(format!("ino {}: bad fnode pointer {:#x}", ino, ptr));
                return;
            }
        };
        self.count(va);
        let node = match self.load(va) {
            Ok(node) => node,
            Err(err) => {
                self.report.err(format!("ino {}: fnode {}: {}", ino, va, err));
                return;
            }
        };
        let f = match node {
            Node::Fnode(f) => f,
            _ => return,
        };
        if f.height != height {
            self.report
                .err(format!("ino {}: fnode {} height {} expected {}", ino, va, f.height, height));
        }
        let mut nchildren = 0;
        for child in f.child.iter() {
            if child.is_hole() {
                continue;
            }
            nchildren += 1;
            if height == 2 {
                self.check_leaf(child, &format!("ino {}", ino));
            } else {
                self.check_fnode_tree(ino, child.ptr, height - 1);
            }
        }
        if nchildren != f.nchildren {
            self.report.err(format!(
                "ino {}: fnode {} child count {} recorded {}",
                ino, va, nchildren, f.nchildren
            ));
        }
    }

    fn check_xattrs(&mut self, ino: u64, d: &DInode) {
        let mut link = d.xa_head;
        let mut hops = 0;
        while link != 0 {
            let va = match Vaddr::from_u64(link) {
                Some(va) if va.kind == Kind::Xnode => va,
                _ => {
                    self.report.err(format!("ino {}: bad xnode pointer {:#x}", ino, link));
                    return;
                }
            };
            self.count(va);
            let node = match self.load(va) {
                Ok(node) => node,
                Err(err) => {
                    self.report.err(format!("ino {}: xnode {}: {}", ino, va, err));
                    return;
                }
            };
            let x = match node {
                Node::Xnode(x) => x,
                _ => return,
            };
            if x.heap.len() >= XREC_HDR_SIZE {
                if let Some(rec) = zerocopy::FromBytes::read_from_prefix(&x.heap[..XREC_HDR_SIZE])
                {
                    let rec: DXrec = rec;
                    let mut cont = rec.cont;
                    while cont != 0 {
                        let cva = match Vaddr::from_u64(cont) {
                            Some(cva) if cva.kind == Kind::Xnode => cva,
                            _ => {
                                self.report.err(format!(
                                    "ino {}: bad xattr continuation {:#x}",
                                    ino, cont
                                ));
                                break;
                            }
                        };
                        self.count(cva);
                        match self.load(cva) {
                            Ok(Node::Xnode(c)) => cont = c.next,
                            Ok(_) => break,
                            Err(err) => {
                                self.report.err(format!("ino {}: xnode {}: {}", ino, cva, err));
                                break;
                            }
                        }
                    }
                }
            }
            link = x.next;
            hops += 1;
            if hops > AG_NBK * 16 {
                self.report.err(format!("ino {}: xattr chain does not terminate", ino));
                return;
            }
        }
    }

    /// Checks one directory inode; returns child inos to visit.
    fn check_dir(&mut self, ino: u64, d: &DInode) -> Vec<u64> {
        let mut children = Vec::new();
        let mut nentries = 0u64;
        for head in d.dir_buckets.iter() {
            let mut link = *head;
            let mut hops = 0;
            while link != 0 {
                let va = match Vaddr::from_u64(link) {
                    Some(va) if va.kind == Kind::Dnode => va,
                    _ => {
                        self.report.err(format!("ino {}: bad dnode pointer {:#x}", ino, link));
                        break;
                    }
                };
                self.count(va);
                let node = match self.load(va) {
                    Ok(node) => node,
                    Err(err) => {
                        self.report.err(format!("ino {}: dnode {}: {}", ino, va, err));
                        break;
                    }
                };
                let dn = match node {
                    Node::Dnode(dn) => dn,
                    _ => break,
                };
                let mut off = 0usize;
                while off + DIRENT_HDR_SIZE <= dn.heap_end as usize {
                    let hdr: DDirent =
                        match zerocopy::FromBytes::read_from_prefix(&dn.heap[off..]) {
                            Some(hdr) => hdr,
                            None => break,
                        };
                    if (hdr.rec_len as usize) < DIRENT_HDR_SIZE {
                        self.report.err(format!("ino {}: dnode {} bad record", ino, va));
                        break;
                    }
                    if hdr.ino != 0 {
                        nentries += 1;
                        children.push(hdr.ino);
                    }
                    off += hdr.rec_len as usize;
                }
                link = dn.next;
                hops += 1;
                if hops > AG_NBK * 16 {
                    self.report.err(format!("ino {}: dnode chain does not terminate", ino));
                    break;
                }
            }
        }
        if nentries != d.dir_nentries {
            self.report.err(format!(
                "ino {}: entry count {} recorded {}",
                ino, nentries, d.dir_nentries
            ));
        }
        children
    }
}

/// Verifies the volume at `path`; never mutates it.
pub fn check_volume(path: &Path, codec: Box<dyn BlockCodec>) -> Result<CheckReport> {
    let vol = Volume::open(path, codec)?;
    let nag = vol.nag();

    let sb = {
        let bk = vol.read_block(Vaddr::super_())?;
        match decode_node(Vaddr::super_(), bk)? {
            (Node::Super(sb), _) => sb,
            _ => return Err(Error::BadMagic),
        }
    };
    if sb.version != FORMAT_VERSION
        || sb.bk_size as usize != BK_SIZE
        || sb.ag_nbk as usize != AG_NBK
        || sb.nag != nag
    {
        return Err(Error::BadMagic);
    }

    let mut agmaps = Vec::new();
    for ag in 0..nag {
        let va = Vaddr::agmap(ag);
        let bk = vol.read_block(va)?;
        match decode_node(va, bk)? {
            (Node::Agmap(am), _) => agmaps.push(*am),
            _ => return Err(Error::WrongKind(va)),
        }
    }

    let mut checker = Checker {
        vol,
        agmaps,
        counted: HashMap::new(),
        report: CheckReport::default(),
    };

    // Fixed nodes.
    checker.count(Vaddr::super_());
    for ag in 0..nag {
        checker.count(Vaddr::agmap(ag));
    }

    // Reachability sweep, breadth-first over directories.
    let mut queue: VecDeque<u64> = VecDeque::new();
    let mut seen: hashbrown::HashSet<u64> = hashbrown::HashSet::new();
    queue.push_back(sb.root_ino);
    let _ = seen.insert(sb.root_ino);
    while let Some(ino) = queue.pop_front() {
        let va = va_of_ino(ino);
        checker.count(va);
        checker.report.inodes += 1;
        let node = match checker.load(va) {
            Ok(node) => node,
            Err(err) => {
                checker.report.err(format!("ino {}: {}", ino, err));
                continue;
            }
        };
        let d = match node {
            Node::Inode(d) => d,
            _ => {
                checker.report.err(format!("ino {}: not an inode", ino));
                continue;
            }
        };
        if d.ino != ino {
            checker.report.err(format!("ino {}: records ino {}", ino, d.ino));
        }
        checker.check_xattrs(ino, &d);
        if d.mode & libc::S_IFMT == libc::S_IFDIR {
            for child in checker.check_dir(ino, &d) {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        } else if d.mode & libc::S_IFMT == libc::S_IFLNK {
            if d.sym_len as usize > SYMLNK_INLINE_MAX && !d.sym_leaf.is_hole() {
                checker.check_leaf(&d.sym_leaf.clone(), &format!("symlink ino {}", ino));
            }
        } else {
            checker.check_filemap(ino, &d);
        }
    }

    // Occupancy cross-check: every set bit accounted for, every counted
    // node marked allocated.
    for am in &checker.agmaps {
        for kind in [
            Kind::Super,
            Kind::Agmap,
            Kind::Inode,
            Kind::Dnode,
            Kind::Fnode,
            Kind::Leaf,
            Kind::Xnode,
        ] {
            let counted = checker.counted.get(&(am.ag, kind)).copied().unwrap_or(0);
            let marked = am.nused_of(kind);
            if counted != marked {
                checker.report.err(format!(
                    "ag {} kind {:?}: {} reachable, {} marked allocated",
                    am.ag, kind, counted, marked
                ));
            }
        }
    }
    let used: u64 = checker.agmaps.iter().map(|am| am.nused_total()).sum();
    if sb.nbk_free != sb.nbk_total - used {
        checker.report.err(format!(
            "superblock free count {} expected {}",
            sb.nbk_free,
            sb.nbk_total - used
        ));
    }

    info!(
        "check: {} nodes, {} inodes, {} errors",
        checker.report.nodes_checked,
        checker.report.inodes,
        checker.report.errors.len()
    );
    Ok(checker.report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PlainCodec;
    use crate::mkfs::mkfs;
    use crate::param::VOLUME_SIZE_MIN;

    fn temp_path() -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("volufs-check-{}", uuid::Uuid::new_v4()));
        p
    }

    #[test]
    fn fresh_volume_is_clean() {
        let path = temp_path();
        let _ = mkfs(&path, VOLUME_SIZE_MIN, Box::new(PlainCodec)).unwrap();
        let report = check_volume(&path, Box::new(PlainCodec)).unwrap();
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.inodes, 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn corrupt_superblock_detected() {
        use std::os::unix::fs::FileExt;
        let path = temp_path();
        let _ = mkfs(&path, VOLUME_SIZE_MIN, Box::new(PlainCodec)).unwrap();
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all_at(&[0xFF; 16], 0).unwrap();
        drop(f);
        assert!(check_volume(&path, Box::new(PlainCodec)).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
