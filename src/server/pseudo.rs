//! Pseudo namespace: synthetic control files exposing runtime knobs
//! and statistics.
//!
//! A fixed tree of pseudo inodes hangs off a reserved ino range,
//! reachable by looking up `.volufs` in the root directory. Every leaf
//! is a regular-file pseudo inode whose read and write redirect to a
//! show/save handler pair; nothing here ever touches the volume.

use crate::error::{Error, Result};
use crate::fs::dir::DirentOut;
use crate::fs::inode::{attr_of, Attr};
use crate::fs::{unix_now, Fsys};
use crate::param::{BK_SIZE, PSEUDO_INO_BASE};

struct PseudoEnt {
    off: u64,
    parent: u64,
    name: &'static str,
    dir: bool,
    writable: bool,
}

/// The synthetic tree. Offsets are stable; inos are `base + off`.
const TREE: &[PseudoEnt] = &[
    PseudoEnt { off: 0, parent: 0, name: "", dir: true, writable: false },
    PseudoEnt { off: 1, parent: 0, name: "halt", dir: false, writable: true },
    PseudoEnt { off: 2, parent: 0, name: "uuid", dir: false, writable: false },
    PseudoEnt { off: 3, parent: 0, name: "super", dir: true, writable: false },
    PseudoEnt { off: 4, parent: 3, name: "fsstat", dir: false, writable: false },
    PseudoEnt { off: 5, parent: 3, name: "iostat", dir: false, writable: false },
    PseudoEnt { off: 6, parent: 0, name: "cache", dir: true, writable: false },
    PseudoEnt { off: 7, parent: 6, name: "cstats", dir: false, writable: false },
    PseudoEnt { off: 8, parent: 6, name: "alloc_nbk", dir: false, writable: false },
    PseudoEnt { off: 9, parent: 0, name: "fusei", dir: true, writable: false },
    PseudoEnt { off: 10, parent: 9, name: "attr_timeout", dir: false, writable: true },
    PseudoEnt { off: 11, parent: 9, name: "entry_timeout", dir: false, writable: true },
    PseudoEnt { off: 12, parent: 0, name: "logger", dir: true, writable: false },
    PseudoEnt { off: 13, parent: 12, name: "debug", dir: false, writable: true },
];

fn ent_of(ino: u64) -> Result<&'static PseudoEnt> {
    let off = ino.checked_sub(PSEUDO_INO_BASE).ok_or(Error::NotFound)?;
    TREE.get(off as usize).ok_or(Error::NotFound)
}

/// Renders a pseudo file's current contents.
fn show(fsys: &Fsys, ent: &PseudoEnt) -> Result<String> {
    use std::sync::atomic::Ordering;
    let io = &fsys.pstor().iostat;
    let out = match ent.off {
        1 => format!("{}\n", fsys.is_active() as u32),
        2 => format!("{}\n", fsys.uuid()?.hyphenated()),
        4 => {
            let st = fsys.statfs()?;
            format!(
                "bk_size={}\nnbk_total={}\nnbk_free={}\nnfiles_total={}\nnfiles_free={}\n",
                st.bk_size, st.nbk_total, st.nbk_free, st.nfiles_total, st.nfiles_free
            )
        }
        5 => format!(
            "rd_ops={}\nrd_bytes={}\nwr_ops={}\nwr_bytes={}\n",
            io.rd_ops.load(Ordering::Relaxed),
            io.rd_bytes.load(Ordering::Relaxed),
            io.wr_ops.load(Ordering::Relaxed),
            io.wr_bytes.load(Ordering::Relaxed),
        ),
        7 => {
            let cs = fsys.cache().stats();
            format!("inodes={}\nvnodes={}\nblocks={}\n", cs.inodes, cs.vnodes, cs.blocks)
        }
        8 => format!("{}\n", fsys.cache().stats().total() * BK_SIZE),
        10 => format!("{}\n", fsys.attr_timeout.load(Ordering::Relaxed)),
        11 => format!("{}\n", fsys.entry_timeout.load(Ordering::Relaxed)),
        13 => format!("{}\n", log::max_level() as usize),
        _ => return Err(Error::Invalid),
    };
    Ok(out)
}

/// Applies a write to a pseudo file.
fn save(fsys: &Fsys, ent: &PseudoEnt, data: &[u8]) -> Result<()> {
    use std::sync::atomic::Ordering;
    if !ent.writable {
        return Err(Error::NotSupported);
    }
    let text = std::str::from_utf8(data).map_err(|_| Error::Invalid)?;
    let nn: i64 = text.trim().parse().map_err(|_| Error::Invalid)?;
    match ent.off {
        1 => match nn {
            0 => fsys.deactivate(),
            1 => fsys.activate(),
            _ => return Err(Error::Invalid),
        },
        10 | 11 => {
            if !(0..10).contains(&nn) {
                return Err(Error::Invalid);
            }
            let knob = if ent.off == 10 { &fsys.attr_timeout } else { &fsys.entry_timeout };
            knob.store(nn as u32, Ordering::Relaxed);
        }
        13 => {
            let level = match nn {
                0 => log::LevelFilter::Off,
                1 => log::LevelFilter::Error,
                2 => log::LevelFilter::Warn,
                3 => log::LevelFilter::Info,
                4 => log::LevelFilter::Debug,
                5 => log::LevelFilter::Trace,
                _ => return Err(Error::Invalid),
            };
            log::set_max_level(level);
        }
        _ => return Err(Error::NotSupported),
    }
    Ok(())
}

pub fn getattr(fsys: &Fsys, ino: u64) -> Result<Attr> {
    let ent = ent_of(ino)?;
    let (sec, nsec) = unix_now();
    let mut d: crate::layout::DInode = zerocopy::FromBytes::new_zeroed();
    d.ino = ino;
    d.nlink = if ent.dir { 2 } else { 1 };
    d.mode = if ent.dir {
        libc::S_IFDIR | 0o555
    } else if ent.writable {
        libc::S_IFREG | 0o644
    } else {
        libc::S_IFREG | 0o444
    };
    d.size = if ent.dir { 0 } else { show(fsys, ent).map(|s| s.len() as u64).unwrap_or(0) };
    d.times.atime_sec = sec;
    d.times.atime_nsec = nsec;
    d.times.mtime_sec = sec;
    d.times.mtime_nsec = nsec;
    d.times.ctime_sec = sec;
    d.times.ctime_nsec = nsec;
    Ok(attr_of(&d))
}

pub fn lookup(fsys: &Fsys, parent: u64, name: &[u8]) -> Result<Attr> {
    let pent = ent_of(parent)?;
    if !pent.dir {
        return Err(Error::NotDir);
    }
    if name == b"." {
        return getattr(fsys, parent);
    }
    if name == b".." {
        return if pent.off == 0 {
            // `..` of the pseudo root leads back to the real root.
            let e = fsys.require_inode(fsys.root_ino())?;
            fsys.with_inode(&e, attr_of)
        } else {
            getattr(fsys, PSEUDO_INO_BASE + pent.parent)
        };
    }
    for ent in TREE.iter().skip(1) {
        if ent.parent == pent.off && ent.name.as_bytes() == name {
            return getattr(fsys, PSEUDO_INO_BASE + ent.off);
        }
    }
    Err(Error::NotFound)
}

pub fn readdir(_fsys: &Fsys, ino: u64, cursor: u64, limit: usize) -> Result<Vec<DirentOut>> {
    let pent = ent_of(ino)?;
    if !pent.dir {
        return Err(Error::NotDir);
    }
    let mut out = Vec::new();
    let mut pos = 0u64;
    if cursor == 0 && out.len() < limit {
        out.push(DirentOut { name: b".".to_vec(), ino, dtype: libc::DT_DIR, next: 1 });
    }
    if cursor <= 1 && out.len() < limit {
        out.push(DirentOut { name: b"..".to_vec(), ino, dtype: libc::DT_DIR, next: 2 });
    }
    pos += 2;
    for ent in TREE.iter().skip(1) {
        if ent.parent != pent.off || (pent.off == 0 && ent.off == 0) {
            continue;
        }
        if pos >= cursor && out.len() < limit {
            out.push(DirentOut {
                name: ent.name.as_bytes().to_vec(),
                ino: PSEUDO_INO_BASE + ent.off,
                dtype: if ent.dir { libc::DT_DIR } else { libc::DT_REG },
                next: pos + 1,
            });
        }
        pos += 1;
    }
    Ok(out)
}

/// Read redirection for pseudo files.
pub fn read(fsys: &Fsys, ino: u64, off: u64, len: usize) -> Result<Vec<u8>> {
    let ent = ent_of(ino)?;
    if ent.dir {
        return Err(Error::IsDir);
    }
    let full = show(fsys, ent)?;
    let bytes = full.as_bytes();
    if off as usize >= bytes.len() {
        return Ok(Vec::new());
    }
    let end = (off as usize + len).min(bytes.len());
    Ok(bytes[off as usize..end].to_vec())
}

/// Write redirection for pseudo files.
pub fn write(fsys: &Fsys, ino: u64, data: &[u8]) -> Result<usize> {
    let ent = ent_of(ino)?;
    if ent.dir {
        return Err(Error::IsDir);
    }
    save(fsys, ent, data)?;
    Ok(data.len())
}
