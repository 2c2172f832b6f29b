//! Backing volume file: open/create, exclusive locking, block-granular
//! positioned I/O.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::codec::{new_bkbuf, BkBuf, BlockCodec};
use crate::error::{Error, Result};
use crate::param::{AG_SIZE, BK_SIZE, VOLUME_SIZE_MAX, VOLUME_SIZE_MIN};
use crate::vaddr::Vaddr;

/// An open volume file plus the mount-selected codec. All storage I/O
/// funnels through here, one whole block at a time.
pub struct Volume {
    file: File,
    path: PathBuf,
    nag: u32,
    codec: Box<dyn BlockCodec>,
}

/// Validates a requested volume size and returns the AG count.
pub fn size_to_nag(size: u64) -> Result<u32> {
    if size < VOLUME_SIZE_MIN || size > VOLUME_SIZE_MAX || size % AG_SIZE != 0 {
        return Err(Error::Invalid);
    }
    Ok((size / AG_SIZE) as u32)
}

impl Volume {
    /// Creates a fresh sparse volume file of `size` bytes.
    pub fn create(path: &Path, size: u64, codec: Box<dyn BlockCodec>) -> Result<Volume> {
        let nag = size_to_nag(size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size)?;
        let vol = Volume { file, path: path.to_owned(), nag, codec };
        vol.lock_exclusive()?;
        Ok(vol)
    }

    /// Opens an existing volume file, taking the exclusive volume lock.
    pub fn open(path: &Path, codec: Box<dyn BlockCodec>) -> Result<Volume> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        let nag = size_to_nag(size)?;
        let vol = Volume { file, path: path.to_owned(), nag, codec };
        vol.lock_exclusive()?;
        Ok(vol)
    }

    /// Single-owner guard over the volume file.
    fn lock_exclusive(&self) -> Result<()> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(Error::Busy);
        }
        Ok(())
    }

    pub fn nag(&self) -> u32 {
        self.nag
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        (self.nag as u64) * AG_SIZE
    }

    fn check_bounds(&self, va: Vaddr) -> Result<u64> {
        let off = va.phys();
        if off + BK_SIZE as u64 > self.size() {
            return Err(Error::CorruptData(va));
        }
        Ok(off)
    }

    /// Reads and unseals one whole block.
    pub fn read_block(&self, va: Vaddr) -> Result<BkBuf> {
        let off = self.check_bounds(va)?;
        let mut bk = new_bkbuf();
        self.file.read_exact_at(&mut bk[..], off)?;
        self.codec.unseal(va, &mut bk)?;
        Ok(bk)
    }

    /// Seals and writes one whole block.
    pub fn write_block(&self, va: Vaddr, bk: &[u8; BK_SIZE]) -> Result<()> {
        let off = self.check_bounds(va)?;
        let mut sealed = new_bkbuf();
        sealed.copy_from_slice(&bk[..]);
        self.codec.seal(va, &mut sealed)?;
        self.file.write_all_at(&sealed[..], off)?;
        Ok(())
    }

    /// Flushes OS buffers down to the device.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
