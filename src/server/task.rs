//! Task records: the in-flight representation of one request as it
//! traverses the pipeline.
//!
//! The RX stage parses a frame into a [`Task`]; the VPROC stage runs
//! its handler, possibly parking it on awaited blocks; the TX stage
//! encodes the reply. Read tasks take an extra FINI round trip so the
//! reply leaves before their cache pins do.

use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::fs::inode::{Cred, SetAttr, SetAttrSet};
use crate::fs::xattr::XattrSet;
use crate::param::IO_SIZE_MAX;

use super::proto::*;

/// Task life-cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Parsed,
    ExecReq,
    ExecRes,
    FiniReq,
    FiniRes,
    Done,
}

/// Decoded request arguments.
#[derive(Debug)]
pub enum Args {
    Lookup { name: Vec<u8> },
    Forget { nlookup: u64 },
    Getattr,
    Setattr(SetAttr),
    Mkdir { name: Vec<u8>, mode: u32 },
    Rmdir { name: Vec<u8> },
    Create { name: Vec<u8>, mode: u32, flags: u32 },
    Open { flags: u32 },
    Read { fh: u64, off: u64, len: u32 },
    Write { fh: u64, off: u64, data: Vec<u8> },
    Release { fh: u64 },
    Fsync { fh: u64, datasync: bool },
    Fallocate { fh: u64, mode: i32, off: u64, len: u64 },
    Flock,
    Rename { name: Vec<u8>, newparent: u64, newname: Vec<u8>, flags: u32 },
    Link { ino: u64, name: Vec<u8> },
    Symlink { name: Vec<u8>, target: Vec<u8> },
    Readlink,
    Setxattr { name: Vec<u8>, value: Vec<u8>, set: XattrSet },
    Getxattr { name: Vec<u8>, size: u32 },
    Listxattr { size: u32 },
    Removexattr { name: Vec<u8> },
    Readdir { cursor: u64, limit: u32 },
    Statfs,
    Lseek { off: u64, whence: u32 },
    Fiemap { off: u64, len: u64 },
    Ioctl { cmd: u32, arg: u32 },
    Unlink { name: Vec<u8> },
}

/// Handler result, held until the TX stage encodes it.
#[derive(Debug)]
pub enum Reply {
    Empty,
    Attr(crate::fs::Attr),
    Entry(crate::fs::Attr),
    Created { attr: crate::fs::Attr, fh: u64 },
    Opened { fh: u64 },
    Data(Vec<u8>),
    Written(u64),
    Statfs(crate::fs::FsStat),
    Lseek(u64),
    Dirents(Vec<crate::fs::dir::DirentOut>),
    Extents(Vec<crate::fs::filemap::FmExtent>),
}

/// One in-flight request.
pub struct Task {
    pub unique: u64,
    pub opcode: Opcode,
    pub ino: u64,
    pub cred: Cred,
    pub args: Args,
    pub state: TaskState,
    pub result: Option<std::result::Result<Reply, Error>>,
}

impl Task {
    pub fn errno(&self) -> i32 {
        match &self.result {
            Some(Err(err)) => err.errno(),
            _ => 0,
        }
    }
}

fn split_payload(payload: &[u8], at: usize) -> Result<(&[u8], &[u8])> {
    if at > payload.len() {
        return Err(Error::Invalid);
    }
    Ok(payload.split_at(at))
}

fn fixed<T: FromBytes + Copy>(payload: &[u8]) -> Result<(T, &[u8])> {
    let v = T::read_from_prefix(payload).ok_or(Error::Invalid)?;
    Ok((v, &payload[core::mem::size_of::<T>()..]))
}

/// Parses one frame into a task record.
pub fn parse(head: &ReqHead, payload: &[u8]) -> Result<Task> {
    let opcode = Opcode::from_u32(head.opcode).ok_or(Error::NotSupported)?;
    let args = match opcode {
        Opcode::Lookup => Args::Lookup { name: payload.to_vec() },
        Opcode::Forget => {
            let (p, _) = fixed::<PForget>(payload)?;
            Args::Forget { nlookup: p.nlookup }
        }
        Opcode::Getattr => Args::Getattr,
        Opcode::Setattr => {
            let (p, _) = fixed::<PSetattr>(payload)?;
            Args::Setattr(SetAttr {
                set: SetAttrSet::from_bits_truncate(p.set),
                mode: p.mode,
                uid: p.uid,
                gid: p.gid,
                size: p.size,
                atime: (p.atime_sec, p.atime_nsec),
                mtime: (p.mtime_sec, p.mtime_nsec),
            })
        }
        Opcode::Mkdir => {
            let (p, rest) = fixed::<PMkdir>(payload)?;
            Args::Mkdir { name: rest.to_vec(), mode: p.mode }
        }
        Opcode::Rmdir => Args::Rmdir { name: payload.to_vec() },
        Opcode::Create => {
            let (p, rest) = fixed::<PCreate>(payload)?;
            Args::Create { name: rest.to_vec(), mode: p.mode, flags: p.flags }
        }
        Opcode::Open => {
            let (p, _) = fixed::<POpen>(payload)?;
            Args::Open { flags: p.flags }
        }
        Opcode::Read => {
            let (p, _) = fixed::<PRead>(payload)?;
            if p.len as usize > IO_SIZE_MAX {
                return Err(Error::Invalid);
            }
            Args::Read { fh: p.fh, off: p.off, len: p.len }
        }
        Opcode::Write => {
            let (p, rest) = fixed::<PWrite>(payload)?;
            if p.len as usize != rest.len() || rest.len() > IO_SIZE_MAX {
                return Err(Error::Invalid);
            }
            Args::Write { fh: p.fh, off: p.off, data: rest.to_vec() }
        }
        Opcode::Release => {
            let (p, _) = fixed::<PRelease>(payload)?;
            Args::Release { fh: p.fh }
        }
        Opcode::Fsync => {
            let (p, _) = fixed::<PFsync>(payload)?;
            Args::Fsync { fh: p.fh, datasync: p.datasync != 0 }
        }
        Opcode::Fallocate => {
            let (p, _) = fixed::<PFalloc>(payload)?;
            Args::Fallocate { fh: p.fh, mode: p.mode, off: p.off, len: p.len }
        }
        Opcode::Flock => Args::Flock,
        Opcode::Rename => {
            let (p, rest) = fixed::<PRename>(payload)?;
            let (old, rest) = split_payload(rest, p.oldlen as usize)?;
            let (new, _) = split_payload(rest, p.newlen as usize)?;
            Args::Rename {
                name: old.to_vec(),
                newparent: p.newparent,
                newname: new.to_vec(),
                flags: p.flags,
            }
        }
        Opcode::Link => {
            let (p, rest) = fixed::<PLink>(payload)?;
            Args::Link { ino: p.ino, name: rest.to_vec() }
        }
        Opcode::Symlink => {
            let (p, rest) = fixed::<PSymlink>(payload)?;
            let (name, rest) = split_payload(rest, p.nlen as usize)?;
            let (target, _) = split_payload(rest, p.tlen as usize)?;
            Args::Symlink { name: name.to_vec(), target: target.to_vec() }
        }
        Opcode::Readlink => Args::Readlink,
        Opcode::Setxattr => {
            let (p, rest) = fixed::<PSetxattr>(payload)?;
            let (name, rest) = split_payload(rest, p.nlen as usize)?;
            let (value, _) = split_payload(rest, p.vlen as usize)?;
            Args::Setxattr {
                name: name.to_vec(),
                value: value.to_vec(),
                set: XattrSet::from_flags(p.flags)?,
            }
        }
        Opcode::Getxattr => {
            let (p, rest) = fixed::<PGetxattr>(payload)?;
            Args::Getxattr { name: rest.to_vec(), size: p.size }
        }
        Opcode::Listxattr => {
            let (p, _) = fixed::<PGetxattr>(payload)?;
            Args::Listxattr { size: p.size }
        }
        Opcode::Removexattr => Args::Removexattr { name: payload.to_vec() },
        Opcode::Readdir => {
            let (p, _) = fixed::<PReaddir>(payload)?;
            Args::Readdir { cursor: p.cursor, limit: p.limit }
        }
        Opcode::Statfs => Args::Statfs,
        Opcode::Lseek => {
            let (p, _) = fixed::<PLseek>(payload)?;
            Args::Lseek { off: p.off, whence: p.whence }
        }
        Opcode::Fiemap => {
            let (p, _) = fixed::<PFiemap>(payload)?;
            Args::Fiemap { off: p.off, len: p.len }
        }
        Opcode::Ioctl => {
            let (p, _) = fixed::<PIoctl>(payload)?;
            Args::Ioctl { cmd: p.cmd, arg: p.arg }
        }
        Opcode::Unlink => Args::Unlink { name: payload.to_vec() },
    };
    Ok(Task {
        unique: head.unique,
        opcode,
        ino: head.ino,
        cred: Cred { uid: head.uid, gid: head.gid },
        args,
        state: TaskState::Parsed,
        result: None,
    })
}

/// Encodes the task's reply payload. Errors encode as an empty payload
/// with the errno in the response head.
pub fn encode_reply(task: &Task, attr_timeout: u32, entry_timeout: u32) -> Vec<u8> {
    let reply = match &task.result {
        Some(Ok(reply)) => reply,
        _ => return Vec::new(),
    };
    match reply {
        Reply::Empty => Vec::new(),
        Reply::Attr(attr) | Reply::Entry(attr) => {
            RAttr::from_attr(attr, attr_timeout, entry_timeout).as_bytes().to_vec()
        }
        Reply::Created { attr, fh } => {
            let r = RCreate {
                attr: RAttr::from_attr(attr, attr_timeout, entry_timeout),
                fh: *fh,
            };
            r.as_bytes().to_vec()
        }
        Reply::Opened { fh } => ROpen { fh: *fh }.as_bytes().to_vec(),
        Reply::Data(data) => data.clone(),
        Reply::Written(count) => RWrite { count: *count }.as_bytes().to_vec(),
        Reply::Statfs(st) => RStatfs::from_stat(st).as_bytes().to_vec(),
        Reply::Lseek(off) => RLseek { off: *off }.as_bytes().to_vec(),
        Reply::Dirents(entries) => {
            let mut out = Vec::new();
            for de in entries {
                let hdr = RDirent {
                    ino: de.ino,
                    next: de.next,
                    nlen: de.name.len() as u16,
                    dtype: de.dtype,
                    pad0: 0,
                    pad1: 0,
                };
                out.extend_from_slice(hdr.as_bytes());
                out.extend_from_slice(&de.name);
                let pad = (8 - de.name.len() % 8) % 8;
                out.extend_from_slice(&[0u8; 8][..pad]);
            }
            out
        }
        Reply::Extents(extents) => {
            let mut out = Vec::new();
            for ext in extents {
                let r = RExtent {
                    logical: ext.logical,
                    physical: ext.physical,
                    length: ext.length,
                };
                out.extend_from_slice(r.as_bytes());
            }
            out
        }
    }
}
