//! Error taxonomy of the core.
//!
//! Every failure a logical handler can produce is a typed variant here;
//! the adaptor boundary turns variants into POSIX errno values. The one
//! exception is `WouldBlock`, which never crosses the TX stage: the
//! pipeline consumes it by parking the task until the awaited blocks
//! resolve.

use thiserror::Error;

use crate::vaddr::Vaddr;

/// Core error kinds, surfaced as errno at the adaptor.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no such entry")]
    NotFound,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("entry exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("symlink loop")]
    Loop,
    #[error("name too long")]
    NameTooLong,
    #[error("access denied")]
    AccessDenied,
    #[error("not owner")]
    NotOwner,
    #[error("out of space")]
    OutOfSpace,
    #[error("out of inodes")]
    OutOfInodes,
    #[error("too many links")]
    MLink,
    #[error("file too big")]
    FileTooBig,
    #[error("argument too big")]
    ArgTooBig,
    #[error("corrupt data at {0}")]
    CorruptData(Vaddr),
    #[error("bad magic")]
    BadMagic,
    #[error("wrong node kind at {0}")]
    WrongKind(Vaddr),
    #[error("freeing an unallocated block at {0}")]
    InvalidFree(Vaddr),
    #[error("invalid argument")]
    Invalid,
    #[error("operation not supported")]
    NotSupported,
    #[error("bad file handle")]
    BadHandle,
    #[error("no data beyond offset")]
    NoData,
    #[error("no such attribute")]
    NoAttr,
    #[error("mount busy")]
    Busy,
    #[error("would block on {0:?}")]
    WouldBlock(Vec<Vaddr>),
    #[error("volume I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// POSIX errno for this error kind.
    ///
    /// `WouldBlock` maps to EAGAIN for completeness, but the pipeline
    /// never lets it reach a reply frame.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::NotDir => libc::ENOTDIR,
            Error::IsDir => libc::EISDIR,
            Error::Exists => libc::EEXIST,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::Loop => libc::ELOOP,
            Error::NameTooLong => libc::ENAMETOOLONG,
            Error::AccessDenied => libc::EACCES,
            Error::NotOwner => libc::EPERM,
            Error::OutOfSpace => libc::ENOSPC,
            Error::OutOfInodes => libc::ENOSPC,
            Error::MLink => libc::EMLINK,
            Error::FileTooBig => libc::EFBIG,
            Error::ArgTooBig => libc::E2BIG,
            Error::CorruptData(_) => libc::EIO,
            Error::BadMagic => libc::EIO,
            Error::WrongKind(_) => libc::EIO,
            Error::InvalidFree(_) => libc::EIO,
            Error::Invalid => libc::EINVAL,
            Error::NotSupported => libc::ENOSYS,
            Error::BadHandle => libc::EBADF,
            Error::NoData => libc::ENXIO,
            Error::NoAttr => libc::ENODATA,
            Error::Busy => libc::EBUSY,
            Error::WouldBlock(_) => libc::EAGAIN,
            Error::Io(_) => libc::EIO,
        }
    }

    /// True for errors that deactivate the whole mount when raised on a
    /// metadata node.
    pub fn is_fatal_on_meta(&self) -> bool {
        matches!(
            self,
            Error::CorruptData(_)
                | Error::BadMagic
                | Error::WrongKind(_)
                | Error::InvalidFree(_)
                | Error::Io(_)
        )
    }
}
