//! Filesystem core. Five layers:
//!   + Space-maps: per-AG, per-kind block allocation.
//!   + Storage: whole-node fetch/store through the cache and codec.
//!   + Inodes: POSIX metadata, open handles, deferred destruction.
//!   + Directories: hashed buckets with dnode overflow chains.
//!   + File-maps: radix trees mapping file offsets to data leaves.
//!
//! This module owns the mount context, [`Fsys`]. Every operation takes
//! the context explicitly; on-volume nodes carry no back-pointers. A
//! handler that needs an uncached block either loads it inline (the
//! synchronous executor used by mkfs, fsck and the unit tests) or
//! returns `WouldBlock` so the pipeline can park the task and resolve
//! the miss through a storage job.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::{HashMap, HashSet};
use log::{debug, warn};

use crate::cache::{Cache, Centry, CS_FAULTY, CS_READY};
use crate::error::{Error, Result};
use crate::layout::{DInode, DSuper};
use crate::node::Node;
use crate::param::{NOPENF_MAX, PSEUDO_INO_BASE};
use crate::pstor::Pstor;
use crate::spacemap::Agmap;
use crate::vaddr::{is_pseudo_ino, va_of_ino, Kind, Vaddr};

pub mod dir;
pub mod filemap;
pub mod inode;
pub mod xattr;

pub use inode::{attr_of, Attr, Cred, SetAttr, SetAttrSet};

/// Receives storage jobs on behalf of parked tasks. The pipelined
/// server installs one; without it the context loads inline.
pub trait SioSubmit: Send + Sync {
    fn submit_load(&self, entry: Arc<Centry>);
}

/// Statvfs snapshot built from committed superblock counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStat {
    pub bk_size: u32,
    pub nbk_total: u64,
    pub nbk_free: u64,
    pub nfiles_total: u64,
    pub nfiles_free: u64,
    pub name_max: u32,
}

/// One open file handle.
struct OpenFile {
    ino: u64,
    flags: u32,
    /// Keeps the inode resident for the handle's lifetime.
    entry: Option<Arc<Centry>>,
}

/// Open handles, adaptor lookup counts and unlinked-but-open orphans.
#[derive(Default)]
struct OpenTable {
    next_fh: u64,
    files: HashMap<u64, OpenFile>,
    nopen: HashMap<u64, u32>,
    nlookup: HashMap<u64, u64>,
    orphans: HashSet<u64>,
}

/// The mount context: one per mounted volume, passed to every
/// operation.
pub struct Fsys {
    pstor: Arc<Pstor>,
    cache: Arc<Cache>,
    /// The pinned superblock entry.
    sb: Arc<Centry>,
    /// AG rotation cursor for data allocations.
    next_ag: AtomicU32,
    openf: Mutex<OpenTable>,
    sio: Mutex<Option<Arc<dyn SioSubmit>>>,
    /// Mirrors the superblock active flag for lock-free fast-fail.
    active: AtomicBool,
    /// Adaptor cache timeout knobs, settable through the pseudo tree.
    pub attr_timeout: AtomicU32,
    pub entry_timeout: AtomicU32,
    /// Inodes whose destruction is due; drained at housekeeping ticks
    /// so multi-node teardown never wedges a suspended handler.
    reapq: Mutex<VecDeque<u64>>,
    /// Root directory ino, copied out of the superblock at mount.
    root_ino: u64,
}

pub fn unix_now() -> (u64, u64) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos() as u64),
        Err(_) => (0, 0),
    }
}

impl Fsys {
    /// Mounts an opened volume: loads and validates the superblock,
    /// bumps the mount counter and activates the namespace.
    pub fn mount(pstor: Arc<Pstor>) -> Result<Arc<Fsys>> {
        let cache = pstor.cache().clone();
        let sb = pstor.require_now(Vaddr::super_())?;
        let (root_ino, active) = {
            let mut guard = sb.node_mut();
            let d = match guard.as_mut() {
                Some(Node::Super(d)) => d,
                _ => return Err(Error::WrongKind(Vaddr::super_())),
            };
            if d.version != crate::layout::FORMAT_VERSION {
                return Err(Error::BadMagic);
            }
            if d.bk_size as usize != crate::param::BK_SIZE
                || d.ag_nbk as usize != crate::param::AG_NBK
            {
                return Err(Error::BadMagic);
            }
            d.mount_count += 1;
            d.active = 1;
            (d.root_ino, true)
        };
        sb.mark_dirty();
        sb.pin();
        let fsys = Arc::new(Fsys {
            pstor,
            cache,
            sb,
            next_ag: AtomicU32::new(0),
            openf: Mutex::new(OpenTable::default()),
            sio: Mutex::new(None),
            active: AtomicBool::new(active),
            attr_timeout: AtomicU32::new(1),
            entry_timeout: AtomicU32::new(1),
            reapq: Mutex::new(VecDeque::new()),
            root_ino,
        });
        debug!("mounted volume, root ino {}", root_ino);
        Ok(fsys)
    }

    pub fn pstor(&self) -> &Arc<Pstor> {
        &self.pstor
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn root_ino(&self) -> u64 {
        self.root_ino
    }

    pub fn install_sio(&self, sio: Arc<dyn SioSubmit>) {
        *self.sio.lock().unwrap() = Some(sio);
    }

    pub fn uninstall_sio(&self) {
        *self.sio.lock().unwrap() = None;
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deactivates the namespace; subsequent requests fail fast with
    /// EIO while the drain protocol completes.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.with_super_mut(|d| d.active = 0);
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
        let _ = self.with_super_mut(|d| d.active = 1);
    }

    // ------------------------------------------------------------------
    // Node staging

    /// Returns the unique ready cache entry for `va`. On a miss the
    /// pipelined mode submits a storage job and suspends the caller
    /// with `WouldBlock`; the synchronous mode loads inline.
    pub fn require(&self, va: Vaddr) -> Result<Arc<Centry>> {
        let (entry, created) = self.cache.grab(va);
        match entry.state() {
            CS_READY => Ok(entry),
            CS_FAULTY => {
                let _ = self.cache.remove(va);
                Err(Error::CorruptData(va))
            }
            _ => {
                let sio = self.sio.lock().unwrap().clone();
                match sio {
                    Some(sio) => {
                        if created {
                            sio.submit_load(entry.clone());
                        }
                        Err(Error::WouldBlock(vec![va]))
                    }
                    None => {
                        self.pstor.fetch(&entry)?;
                        Ok(entry)
                    }
                }
            }
        }
    }

    /// Stages the inode entry of `ino`.
    pub fn require_inode(&self, ino: u64) -> Result<Arc<Centry>> {
        if is_pseudo_ino(ino) {
            return Err(Error::Invalid);
        }
        self.require(va_of_ino(ino))
    }

    // ------------------------------------------------------------------
    // Typed node access

    pub fn with_super<R>(&self, f: impl FnOnce(&DSuper) -> R) -> Result<R> {
        let guard = self.sb.node();
        match guard.as_ref() {
            Some(Node::Super(d)) => Ok(f(d)),
            _ => Err(Error::WrongKind(Vaddr::super_())),
        }
    }

    pub fn with_super_mut<R>(&self, f: impl FnOnce(&mut DSuper) -> R) -> Result<R> {
        let out = {
            let mut guard = self.sb.node_mut();
            match guard.as_mut() {
                Some(Node::Super(d)) => f(d),
                _ => return Err(Error::WrongKind(Vaddr::super_())),
            }
        };
        let _ = self.sb.bump_generation();
        self.sb.mark_dirty();
        Ok(out)
    }

    pub fn with_inode<R>(&self, e: &Centry, f: impl FnOnce(&DInode) -> R) -> Result<R> {
        let guard = e.node();
        match guard.as_ref() {
            Some(Node::Inode(d)) => Ok(f(d)),
            _ => Err(Error::WrongKind(e.va)),
        }
    }

    /// Mutates an inode and marks the entry dirty.
    pub fn with_inode_mut<R>(&self, e: &Centry, f: impl FnOnce(&mut DInode) -> R) -> Result<R> {
        let out = {
            let mut guard = e.node_mut();
            match guard.as_mut() {
                Some(Node::Inode(d)) => f(d),
                _ => return Err(Error::WrongKind(e.va)),
            }
        };
        let _ = e.bump_generation();
        e.mark_dirty();
        Ok(out)
    }

    pub fn with_agmap_mut<R>(&self, e: &Centry, f: impl FnOnce(&mut Agmap) -> R) -> Result<R> {
        let out = {
            let mut guard = e.node_mut();
            match guard.as_mut() {
                Some(Node::Agmap(am)) => f(am),
                _ => return Err(Error::WrongKind(e.va)),
            }
        };
        let _ = e.bump_generation();
        e.mark_dirty();
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Allocation

    /// Allocates one block of `kind`, tagged with the owning ino for
    /// targeted flushes. Data leaves spread across AGs by owner, which
    /// keeps one file's leaves compact while hot writers land on
    /// different groups; metadata packs from the lowest AG.
    pub fn alloc_va(&self, kind: Kind, owner: u64) -> Result<Vaddr> {
        let nag = self.pstor.volume().nag();
        let start = match kind {
            Kind::Leaf if owner != 0 => (owner % nag as u64) as u32,
            Kind::Leaf => self.next_ag.fetch_add(1, Ordering::Relaxed) % nag,
            _ => 0,
        };
        for i in 0..nag {
            let ag = (start + i) % nag;
            let am = self.require(Vaddr::agmap(ag))?;
            let got = self.with_agmap_mut(&am, |m| m.alloc(kind))?;
            if let Some(va) = got {
                self.with_super_mut(|d| d.nbk_free -= 1)?;
                if kind == Kind::Inode {
                    self.with_super_mut(|d| d.nino_used += 1)?;
                }
                debug!("alloc {} owner {}", va, owner);
                return Ok(va);
            }
        }
        if kind == Kind::Inode {
            Err(Error::OutOfInodes)
        } else {
            Err(Error::OutOfSpace)
        }
    }

    /// Frees one block and drops its cache entry.
    pub fn free_va(&self, va: Vaddr) -> Result<()> {
        let am = self.require(Vaddr::agmap(va.ag))?;
        self.with_agmap_mut(&am, |m| m.free(va))??;
        self.with_super_mut(|d| d.nbk_free += 1)?;
        if va.kind == Kind::Inode {
            self.with_super_mut(|d| d.nino_used -= 1)?;
        }
        let _ = self.cache.remove(va);
        Ok(())
    }

    /// Reserves `n` blocks of `kind` up front for a batch operation.
    /// The caller owns the returned addresses and must either use them
    /// or release them through [`Fsys::release_reserved`].
    pub fn reserve(&self, kind: Kind, n: usize, owner: u64) -> Result<Vec<Vaddr>> {
        let mut vas = Vec::with_capacity(n);
        for _ in 0..n {
            match self.alloc_va(kind, owner) {
                Ok(va) => vas.push(va),
                Err(err) => {
                    self.release_reserved(&vas);
                    return Err(err);
                }
            }
        }
        Ok(vas)
    }

    pub fn release_reserved(&self, vas: &[Vaddr]) {
        for va in vas {
            if let Err(err) = self.free_va(*va) {
                warn!("failed to release reserved {}: {}", va, err);
            }
        }
    }

    /// Free blocks of `kind` across all AGs. Synchronous-path only.
    pub fn free_count(&self) -> Result<u64> {
        self.with_super(|d| d.nbk_free)
    }

    /// Creates a fresh node of `kind` in cache, dirty, owned by `owner`.
    pub fn new_node(&self, kind: Kind, owner: u64, node: Node) -> Result<Arc<Centry>> {
        debug_assert_eq!(node.kind(), kind);
        let va = self.alloc_va(kind, owner)?;
        let entry = self.cache.insert_new(va, node);
        entry.set_owner(owner);
        entry.mark_dirty();
        Ok(entry)
    }

    /// Unhooks a node: frees its block and forgets the cache entry.
    pub fn drop_node(&self, entry: &Centry) -> Result<()> {
        self.free_va(entry.va)
    }

    // ------------------------------------------------------------------
    // Open file handles

    pub fn handle_open(&self, ino: u64, flags: u32, entry: Option<Arc<Centry>>) -> Result<u64> {
        let mut tab = self.openf.lock().unwrap();
        if tab.files.len() >= NOPENF_MAX {
            return Err(Error::OutOfSpace);
        }
        tab.next_fh += 1;
        let fh = tab.next_fh;
        if let Some(e) = &entry {
            e.pin();
        }
        let _ = tab.files.insert(fh, OpenFile { ino, flags, entry });
        *tab.nopen.entry(ino).or_insert(0) += 1;
        Ok(fh)
    }

    pub fn handle_ino(&self, fh: u64) -> Result<(u64, u32)> {
        let tab = self.openf.lock().unwrap();
        let of = tab.files.get(&fh).ok_or(Error::BadHandle)?;
        Ok((of.ino, of.flags))
    }

    /// Closes a handle. Returns the ino whose deferred destruction this
    /// close has unblocked, if any.
    pub fn handle_release(&self, fh: u64) -> Result<Option<u64>> {
        let mut tab = self.openf.lock().unwrap();
        let of = tab.files.remove(&fh).ok_or(Error::BadHandle)?;
        if let Some(e) = &of.entry {
            e.unpin();
        }
        let n = tab.nopen.get_mut(&of.ino).ok_or(Error::BadHandle)?;
        *n -= 1;
        if *n == 0 {
            let _ = tab.nopen.remove(&of.ino);
            if tab.orphans.remove(&of.ino) {
                return Ok(Some(of.ino));
            }
        }
        Ok(None)
    }

    pub fn has_open_files(&self) -> bool {
        !self.openf.lock().unwrap().files.is_empty()
    }

    /// Drops every open handle, as when the adaptor disappears without
    /// releasing. Orphans queue for destruction.
    pub fn release_all_handles(&self) {
        let fhs: Vec<u64> = self.openf.lock().unwrap().files.keys().copied().collect();
        for fh in fhs {
            if let Ok(Some(orphan)) = self.handle_release(fh) {
                self.reap_push(orphan);
            }
        }
        self.reap_now();
    }

    pub fn is_open(&self, ino: u64) -> bool {
        self.openf.lock().unwrap().nopen.contains_key(&ino)
    }

    /// Marks an unlinked-but-open inode for destruction at last close.
    pub fn defer_destroy(&self, ino: u64) {
        let _ = self.openf.lock().unwrap().orphans.insert(ino);
    }

    /// Queues a dead inode for teardown. Destruction touches an
    /// unbounded set of nodes, so it runs from the housekeeping path
    /// where suspension costs nothing; the synchronous mode reaps
    /// inline.
    pub fn reap_push(&self, ino: u64) {
        self.reapq.lock().unwrap().push_back(ino);
        if self.sio.lock().unwrap().is_none() {
            self.reap_now();
        }
    }

    /// Either defers to last close or queues destruction now.
    pub fn retire_ino(&self, ino: u64) {
        if self.is_open(ino) {
            self.defer_destroy(ino);
        } else {
            self.reap_push(ino);
        }
    }

    /// Drains the reap queue. Inodes whose nodes are not yet cached go
    /// back to the queue and resume on a later tick.
    pub fn reap_now(&self) {
        let mut requeue = Vec::new();
        loop {
            let ino = match self.reapq.lock().unwrap().pop_front() {
                Some(ino) => ino,
                None => break,
            };
            let res = self
                .require_inode(ino)
                .and_then(|e| self.destroy_inode(&e));
            match res {
                Ok(()) => {}
                Err(Error::WouldBlock(_)) => requeue.push(ino),
                Err(err) => warn!("reap of ino {} failed: {}", ino, err),
            }
        }
        self.reapq.lock().unwrap().extend(requeue);
    }

    pub fn has_reapable(&self) -> bool {
        !self.reapq.lock().unwrap().is_empty()
    }

    /// Adaptor lookup-count bookkeeping; a forgotten inode with no
    /// links and no handles is destroyed.
    pub fn nlookup_bump(&self, ino: u64) {
        *self.openf.lock().unwrap().nlookup.entry(ino).or_insert(0) += 1;
    }

    pub fn nlookup_forget(&self, ino: u64, n: u64) -> bool {
        let mut tab = self.openf.lock().unwrap();
        match tab.nlookup.get_mut(&ino) {
            Some(cnt) => {
                *cnt = cnt.saturating_sub(n);
                if *cnt == 0 {
                    let _ = tab.nlookup.remove(&ino);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    // ------------------------------------------------------------------
    // Whole-volume operations

    pub fn statfs(&self) -> Result<FsStat> {
        self.with_super(|d| FsStat {
            bk_size: d.bk_size,
            nbk_total: d.nbk_total,
            nbk_free: d.nbk_free,
            nfiles_total: d.nbk_total,
            nfiles_free: d.nbk_total - d.nino_used,
            name_max: crate::param::NAME_MAX as u32,
        })
    }

    /// Folds the live I/O counters into the superblock and flushes all
    /// dirty state, superblock last.
    pub fn sync_now(&self, owner: Option<u64>) -> Result<()> {
        let io = &self.pstor.iostat;
        let (ro, rb, wo, wb) = (
            io.rd_ops.load(Ordering::Relaxed),
            io.rd_bytes.load(Ordering::Relaxed),
            io.wr_ops.load(Ordering::Relaxed),
            io.wr_bytes.load(Ordering::Relaxed),
        );
        self.with_super_mut(|d| {
            d.rd_ops = ro;
            d.rd_bytes = rb;
            d.wr_ops = wo;
            d.wr_bytes = wb;
        })?;
        self.pstor.flush_now(owner)
    }

    /// Unmount-time teardown: refuses while handles are open, then
    /// deactivates, flushes everything and drops the superblock pin.
    pub fn unmount(&self) -> Result<()> {
        if self.has_open_files() {
            return Err(Error::Busy);
        }
        self.deactivate();
        self.sync_now(None)?;
        self.sb.unpin();
        let _ = self.cache.squeeze(true);
        Ok(())
    }

    pub fn uuid(&self) -> Result<uuid::Uuid> {
        self.with_super(|d| uuid::Uuid::from_bytes(d.uuid))
    }
}

/// Ino of the pseudo namespace root.
pub fn pseudo_root_ino() -> u64 {
    PSEUDO_INO_BASE
}

/// Reserved root-directory name under which the pseudo tree is
/// reachable; hidden from readdir.
pub const PSEUDO_ROOT_NAME: &str = ".volufs";
