//! Adaptor wire protocol: length-prefixed, opcode-tagged frames.
//!
//! Each request frame is a 32-bit length (bytes that follow), a fixed
//! request head and an opcode-specific payload; responses mirror that
//! with a status head carrying the errno. The core only defines the
//! payload halves; whatever sits on the other end of the byte stream
//! owns the kernel side.

use std::io::{Read, Write};

use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::fs::{Attr, FsStat};
use crate::param::FRAME_PAYLOAD_MAX;

/// Request opcodes of the POSIX metadata surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    Getattr = 3,
    Setattr = 4,
    Mkdir = 5,
    Rmdir = 6,
    Create = 7,
    Open = 8,
    Read = 9,
    Write = 10,
    Release = 11,
    Fsync = 12,
    Fallocate = 13,
    Flock = 14,
    Rename = 15,
    Link = 16,
    Symlink = 17,
    Readlink = 18,
    Setxattr = 19,
    Getxattr = 20,
    Listxattr = 21,
    Removexattr = 22,
    Readdir = 23,
    Statfs = 24,
    Lseek = 25,
    Fiemap = 26,
    Ioctl = 27,
    Unlink = 28,
}

impl Opcode {
    pub fn from_u32(v: u32) -> Option<Opcode> {
        match v {
            1 => Some(Opcode::Lookup),
            2 => Some(Opcode::Forget),
            3 => Some(Opcode::Getattr),
            4 => Some(Opcode::Setattr),
            5 => Some(Opcode::Mkdir),
            6 => Some(Opcode::Rmdir),
            7 => Some(Opcode::Create),
            8 => Some(Opcode::Open),
            9 => Some(Opcode::Read),
            10 => Some(Opcode::Write),
            11 => Some(Opcode::Release),
            12 => Some(Opcode::Fsync),
            13 => Some(Opcode::Fallocate),
            14 => Some(Opcode::Flock),
            15 => Some(Opcode::Rename),
            16 => Some(Opcode::Link),
            17 => Some(Opcode::Symlink),
            18 => Some(Opcode::Readlink),
            19 => Some(Opcode::Setxattr),
            20 => Some(Opcode::Getxattr),
            21 => Some(Opcode::Listxattr),
            22 => Some(Opcode::Removexattr),
            23 => Some(Opcode::Readdir),
            24 => Some(Opcode::Statfs),
            25 => Some(Opcode::Lseek),
            26 => Some(Opcode::Fiemap),
            27 => Some(Opcode::Ioctl),
            28 => Some(Opcode::Unlink),
            _ => None,
        }
    }
}

/// Fixed head of every request frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct ReqHead {
    pub opcode: u32,
    pub pad0: u32,
    pub unique: u64,
    pub ino: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub pad1: u32,
}

pub const REQ_HEAD_SIZE: usize = core::mem::size_of::<ReqHead>();

/// Fixed head of every response frame; `error` is a negated errno or 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct RespHead {
    pub opcode: u32,
    pub error: i32,
    pub unique: u64,
}

pub const RESP_HEAD_SIZE: usize = core::mem::size_of::<RespHead>();

// ---------------------------------------------------------------------
// Request payloads

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PForget {
    pub nlookup: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PSetattr {
    pub set: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PMkdir {
    pub mode: u32,
    pub pad0: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PCreate {
    pub mode: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct POpen {
    pub flags: u32,
    pub pad0: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PRead {
    pub fh: u64,
    pub off: u64,
    pub len: u32,
    pub pad0: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PWrite {
    pub fh: u64,
    pub off: u64,
    pub len: u32,
    pub pad0: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PRelease {
    pub fh: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PFsync {
    pub fh: u64,
    pub datasync: u32,
    pub pad0: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PFalloc {
    pub fh: u64,
    pub off: u64,
    pub len: u64,
    pub mode: i32,
    pub pad0: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PRename {
    pub newparent: u64,
    pub flags: u32,
    pub oldlen: u16,
    pub newlen: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PLink {
    pub ino: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PSymlink {
    pub nlen: u32,
    pub tlen: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PSetxattr {
    pub flags: u32,
    pub nlen: u32,
    pub vlen: u32,
    pub pad0: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PGetxattr {
    pub size: u32,
    pub pad0: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PReaddir {
    pub fh: u64,
    pub cursor: u64,
    pub limit: u32,
    pub pad0: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PLseek {
    pub fh: u64,
    pub off: u64,
    pub whence: u32,
    pub pad0: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PFiemap {
    pub off: u64,
    pub len: u64,
}

/// Ioctl commands understood by the core.
pub const IOCTL_HALT: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct PIoctl {
    pub cmd: u32,
    pub arg: u32,
}

// ---------------------------------------------------------------------
// Response payloads

/// Wire form of an attribute snapshot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct RAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
    pub rdev: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
    pub attr_timeout: u32,
    pub entry_timeout: u32,
    pub pad0: u32,
}

impl RAttr {
    pub fn from_attr(attr: &Attr, attr_timeout: u32, entry_timeout: u32) -> RAttr {
        RAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime_sec: attr.atime.0,
            atime_nsec: attr.atime.1,
            mtime_sec: attr.mtime.0,
            mtime_nsec: attr.mtime.1,
            ctime_sec: attr.ctime.0,
            ctime_nsec: attr.ctime.1,
            rdev: attr.rdev,
            mode: attr.mode,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            blksize: attr.blksize,
            attr_timeout,
            entry_timeout,
            pad0: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ROpen {
    pub fh: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct RCreate {
    pub attr: RAttr,
    pub fh: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct RWrite {
    pub count: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct RStatfs {
    pub nbk_total: u64,
    pub nbk_free: u64,
    pub nfiles_total: u64,
    pub nfiles_free: u64,
    pub bk_size: u32,
    pub name_max: u32,
}

impl RStatfs {
    pub fn from_stat(st: &FsStat) -> RStatfs {
        RStatfs {
            nbk_total: st.nbk_total,
            nbk_free: st.nbk_free,
            nfiles_total: st.nfiles_total,
            nfiles_free: st.nfiles_free,
            bk_size: st.bk_size,
            name_max: st.name_max,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct RLseek {
    pub off: u64,
}

/// Fixed head of one readdir reply record; the name follows, padded to
/// 8 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct RDirent {
    pub ino: u64,
    pub next: u64,
    pub nlen: u16,
    pub dtype: u8,
    pub pad0: u8,
    pub pad1: u32,
}

pub const RDIRENT_SIZE: usize = core::mem::size_of::<RDirent>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct RExtent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
}

// ---------------------------------------------------------------------
// Frame transport

/// Reads one request frame; `None` on clean end-of-stream.
pub fn read_request(r: &mut impl Read) -> Result<Option<(ReqHead, Vec<u8>)>> {
    let mut lenbuf = [0u8; 4];
    match r.read_exact(&mut lenbuf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(lenbuf) as usize;
    if len < REQ_HEAD_SIZE || len > REQ_HEAD_SIZE + FRAME_PAYLOAD_MAX {
        return Err(Error::Invalid);
    }
    let mut head = [0u8; REQ_HEAD_SIZE];
    r.read_exact(&mut head)?;
    let head = ReqHead::read_from(&head[..]).ok_or(Error::Invalid)?;
    let mut payload = vec![0u8; len - REQ_HEAD_SIZE];
    r.read_exact(&mut payload)?;
    Ok(Some((head, payload)))
}

pub fn write_request(w: &mut impl Write, head: &ReqHead, payload: &[u8]) -> Result<()> {
    let len = (REQ_HEAD_SIZE + payload.len()) as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(head.as_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_response(r: &mut impl Read) -> Result<(RespHead, Vec<u8>)> {
    let mut lenbuf = [0u8; 4];
    r.read_exact(&mut lenbuf)?;
    let len = u32::from_le_bytes(lenbuf) as usize;
    if len < RESP_HEAD_SIZE || len > RESP_HEAD_SIZE + FRAME_PAYLOAD_MAX {
        return Err(Error::Invalid);
    }
    let mut head = [0u8; RESP_HEAD_SIZE];
    r.read_exact(&mut head)?;
    let head = RespHead::read_from(&head[..]).ok_or(Error::Invalid)?;
    let mut payload = vec![0u8; len - RESP_HEAD_SIZE];
    r.read_exact(&mut payload)?;
    Ok((head, payload))
}

pub fn write_response(w: &mut impl Write, head: &RespHead, payload: &[u8]) -> Result<()> {
    let len = (RESP_HEAD_SIZE + payload.len()) as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(head.as_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}
