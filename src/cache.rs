//! Object cache: a bounded associative store of decoded nodes keyed by
//! virtual address.
//!
//! Invariants:
//! * at most one live entry per virtual address;
//! * dirty or pinned entries are never evicted;
//! * the cache performs no I/O — a miss hands the caller a `Loading`
//!   entry to resolve through the storage engine.
//!
//! Three tables with identical semantics partition the population:
//! inodes, other metadata nodes, and raw data blocks.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashbrown::HashMap;

use crate::node::Node;
use crate::vaddr::{Kind, Vaddr};

/// Entry life-cycle states.
pub const CS_LOADING: u8 = 0;
pub const CS_READY: u8 = 1;
pub const CS_FAULTY: u8 = 2;

/// One cached node. The entry is shared (`Arc`) between the cache
/// table, pinned tasks and in-flight storage jobs; the node payload is
/// behind its own lock, per the single-writer discipline.
pub struct Centry {
    pub va: Vaddr,
    state: AtomicU8,
    node: RwLock<Option<Node>>,
    dirty: AtomicBool,
    pins: AtomicU32,
    tick: AtomicU64,
    /// Ino whose subtree this node belongs to; drives targeted flush.
    owner: AtomicU64,
    /// Set when a data leaf failed its checksum; reads fail fast until
    /// the leaf is rewritten.
    quarantined: AtomicBool,
    /// Leaf payload checked against the parent slot checksum.
    verified: AtomicBool,
    generation: AtomicU64,
}

impl Centry {
    fn new(va: Vaddr) -> Centry {
        Centry {
            va,
            state: AtomicU8::new(CS_LOADING),
            node: RwLock::new(None),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
            tick: AtomicU64::new(0),
            owner: AtomicU64::new(0),
            quarantined: AtomicBool::new(false),
            verified: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CS_READY
    }

    /// Installs the decoded node and publishes the entry as ready.
    pub fn resolve(&self, node: Node, generation: u64) {
        *self.node.write().unwrap() = Some(node);
        self.generation.store(generation, Ordering::Relaxed);
        self.state.store(CS_READY, Ordering::Release);
    }

    /// Marks a failed load; waiters observe the fault and fail the task.
    pub fn fault(&self) {
        self.state.store(CS_FAULTY, Ordering::Release);
    }

    pub fn node(&self) -> RwLockReadGuard<'_, Option<Node>> {
        self.node.read().unwrap()
    }

    pub fn node_mut(&self) -> RwLockWriteGuard<'_, Option<Node>> {
        self.node.write().unwrap()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn pin(&self) {
        let _ = self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub fn set_owner(&self, ino: u64) {
        self.owner.store(ino, Ordering::Relaxed);
    }

    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn quarantine(&self) {
        self.quarantined.store(true, Ordering::Release);
    }

    pub fn clear_quarantine(&self) {
        self.quarantined.store(false, Ordering::Release);
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Acquire)
    }

    pub fn mark_verified(&self) {
        self.verified.store(true, Ordering::Release);
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn touch(&self, tick: u64) {
        self.tick.store(tick, Ordering::Relaxed);
    }

    fn last_tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    fn is_evictable(&self) -> bool {
        self.is_ready() && !self.is_dirty() && !self.is_pinned()
    }
}

/// Cache occupancy snapshot, one row per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cstats {
    pub inodes: usize,
    pub vnodes: usize,
    pub blocks: usize,
}

impl Cstats {
    pub fn total(&self) -> usize {
        self.inodes + self.vnodes + self.blocks
    }
}

type Table = Mutex<HashMap<Vaddr, Arc<Centry>>>;

pub struct Cache {
    itable: Table,
    vtable: Table,
    btable: Table,
    /// Upper bound on total cached entries, approached by the periodic
    /// squeeze rather than enforced on insert.
    limit: usize,
    tick: AtomicU64,
}

impl Cache {
    pub fn new(limit: usize) -> Cache {
        Cache {
            itable: Mutex::new(HashMap::new()),
            vtable: Mutex::new(HashMap::new()),
            btable: Mutex::new(HashMap::new()),
            limit,
            tick: AtomicU64::new(0),
        }
    }

    fn table(&self, kind: Kind) -> &Table {
        match kind {
            Kind::Inode => &self.itable,
            Kind::Leaf => &self.btable,
            _ => &self.vtable,
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Looks up a live entry, refreshing its clock position.
    pub fn lookup(&self, va: Vaddr) -> Option<Arc<Centry>> {
        let table = self.table(va.kind).lock().unwrap();
        let entry = table.get(&va)?.clone();
        entry.touch(self.next_tick());
        Some(entry)
    }

    /// Returns the unique entry for `va`, creating it in `Loading` state
    /// when absent. The second element is true when the entry was
    /// created by this call, i.e. the caller must issue the fetch.
    pub fn grab(&self, va: Vaddr) -> (Arc<Centry>, bool) {
        let mut table = self.table(va.kind).lock().unwrap();
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        match table.get(&va) {
            Some(entry) => {
                let entry = entry.clone();
                entry.touch(tick);
                (entry, false)
            }
            None => {
                let entry = Arc::new(Centry::new(va));
                entry.touch(tick);
                let _ = table.insert(va, entry.clone());
                (entry, true)
            }
        }
    }

    /// Inserts a freshly created node, already decoded and ready.
    pub fn insert_new(&self, va: Vaddr, node: Node) -> Arc<Centry> {
        let entry = Arc::new(Centry::new(va));
        entry.touch(self.next_tick());
        entry.resolve(node, 0);
        entry.mark_verified();
        let mut table = self.table(va.kind).lock().unwrap();
        let prev = table.insert(va, entry.clone());
        debug_assert!(prev.is_none(), "duplicate cache entry for {}", va);
        entry
    }

    /// Drops the entry for `va`, if any. Used by unlink paths after the
    /// block is freed; the entry may still be referenced by in-flight
    /// pins, which simply keep the orphan alive until released.
    pub fn remove(&self, va: Vaddr) -> Option<Arc<Centry>> {
        self.table(va.kind).lock().unwrap().remove(&va)
    }

    /// Best-effort eviction of up to `want` clean, unpinned entries,
    /// oldest first. Returns the number of entries dropped.
    pub fn evict_clean(&self, want: usize) -> usize {
        let mut victims: Vec<(u64, Vaddr)> = Vec::new();
        for table in [&self.btable, &self.vtable, &self.itable] {
            let table = table.lock().unwrap();
            for (va, entry) in table.iter() {
                if entry.is_evictable() {
                    victims.push((entry.last_tick(), *va));
                }
            }
        }
        victims.sort_unstable();
        let mut dropped = 0;
        for (_, va) in victims.into_iter().take(want) {
            let mut table = self.table(va.kind).lock().unwrap();
            // Re-check under the table lock; the entry may have been
            // pinned or dirtied since the scan.
            if let Some(entry) = table.get(&va) {
                if entry.is_evictable() {
                    let _ = table.remove(&va);
                    dropped += 1;
                }
            }
        }
        dropped
    }

    /// Periodic cache pressure relief, tiered like the server's idle /
    /// normal / aggressive adjustments.
    pub fn squeeze(&self, shutting_down: bool) -> usize {
        let cur = self.stats().total();
        if shutting_down {
            return self.evict_clean(cur);
        }
        if cur > self.limit {
            self.evict_clean(cur - self.limit + self.limit / 8)
        } else if cur > self.limit / 2 {
            self.evict_clean(cur / 16)
        } else {
            0
        }
    }

    /// Dirty entries of every table, unordered.
    pub fn collect_dirty(&self) -> Vec<Arc<Centry>> {
        let mut out = Vec::new();
        for table in [&self.btable, &self.vtable, &self.itable] {
            let table = table.lock().unwrap();
            out.extend(table.values().filter(|e| e.is_dirty()).cloned());
        }
        out
    }

    pub fn stats(&self) -> Cstats {
        Cstats {
            inodes: self.itable.lock().unwrap().len(),
            vnodes: self.vtable.lock().unwrap().len(),
            blocks: self.btable.lock().unwrap().len(),
        }
    }

    pub fn has_dirty(&self) -> bool {
        for table in [&self.btable, &self.vtable, &self.itable] {
            if table.lock().unwrap().values().any(|e| e.is_dirty()) {
                return true;
            }
        }
        false
    }
}
