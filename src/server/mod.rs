//! Request execution pipeline.
//!
//! Four stage kinds run as dedicated OS threads talking over bounded
//! channels: RX parses adaptor frames into tasks, the single VPROC
//! worker runs every logical handler, N SIO workers move whole blocks
//! between cache and volume, and TX encodes replies back onto the
//! stream. A handler that misses the cache returns `WouldBlock`; the
//! task parks on the awaited addresses and re-executes when the SIO
//! completions drain its wait set. All metadata mutation happens on the
//! VPROC thread.
//!
//! Shutdown follows the drain protocol: a halt write deactivates the
//! superblock, housekeeping flushes dirty state once the last handle
//! closes, and end-of-stream from the adaptor moves the server through
//! DRAIN to TERM.

pub mod proto;
pub mod pseudo;
pub mod task;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use hashbrown::HashMap;
use log::{debug, error, info, warn};
use scopeguard::defer;

use crate::cache::Centry;
use crate::error::{Error, Result};
use crate::fs::{Fsys, SioSubmit};
use crate::param::{DEQ_TIMEOUT_MS, NSIO_DEFAULT, NSIO_MAX, QUEUE_DEPTH};
use crate::pstor::Pstor;
use crate::vaddr::{is_pseudo_ino, Kind, Vaddr};

use self::proto::{Opcode, RespHead};
use self::task::{Args, Reply, Task, TaskState};

/// Server states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServState {
    None = 0,
    Boot = 1,
    Active = 2,
    Drain = 3,
    Term = 4,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> StateCell {
        StateCell(AtomicU8::new(ServState::None as u8))
    }

    fn set(&self, s: ServState) {
        self.0.store(s as u8, Ordering::Release);
    }

    fn get(&self) -> ServState {
        match self.0.load(Ordering::Acquire) {
            0 => ServState::None,
            1 => ServState::Boot,
            2 => ServState::Active,
            3 => ServState::Drain,
            _ => ServState::Term,
        }
    }

    fn is_running(&self) -> bool {
        !matches!(self.get(), ServState::Term)
    }
}

/// Messages consumed by the VPROC worker.
enum VprocMsg {
    Task(Box<Task>),
    Fini(Box<Task>),
    Completion(Vaddr),
    RxDone,
}

/// Storage jobs executed by the SIO workers.
enum SioJob {
    Load(Arc<Centry>),
    Store(Arc<Centry>),
}

/// Round-robin sharding of storage jobs across the SIO workers.
struct SioDispatch {
    shards: Vec<Sender<SioJob>>,
    counter: AtomicUsize,
}

impl SioDispatch {
    fn submit(&self, job: SioJob) {
        let i = self.counter.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        if self.shards[i].send(job).is_err() {
            warn!("storage queue closed, job dropped");
        }
    }
}

impl SioSubmit for SioDispatch {
    fn submit_load(&self, entry: Arc<Centry>) {
        self.submit(SioJob::Load(entry));
    }
}

/// Wave-ordered pipelined flush: one wave of stores is in flight at a
/// time, so a child is durable before any node pointing at it.
struct Flusher {
    waves: Vec<Vec<Arc<Centry>>>,
    cur: usize,
    inflight: hashbrown::HashSet<Vaddr>,
    waiters: Vec<Box<Task>>,
    active: bool,
}

impl Flusher {
    fn new() -> Flusher {
        Flusher {
            waves: Vec::new(),
            cur: 0,
            inflight: hashbrown::HashSet::new(),
            waiters: Vec::new(),
            active: false,
        }
    }

    fn start(&mut self, fsys: &Fsys, owner: Option<u64>) {
        if self.active {
            return;
        }
        let mut dirty = fsys.cache().collect_dirty();
        if let Some(ino) = owner {
            dirty.retain(|e| {
                e.owner() == ino || matches!(e.va.kind, Kind::Agmap | Kind::Super)
            });
        }
        if dirty.is_empty() {
            return;
        }
        dirty.sort_by_key(|e| (Pstor::wave_of(e), e.va));
        let mut waves: Vec<Vec<Arc<Centry>>> = Vec::new();
        let mut last_wave = u32::MAX;
        for entry in dirty {
            let w = Pstor::wave_of(&entry);
            if w != last_wave {
                waves.push(Vec::new());
                last_wave = w;
            }
            waves.last_mut().unwrap().push(entry);
        }
        self.waves = waves;
        self.cur = 0;
        self.active = true;
    }

    fn issue(&mut self, sio: &SioDispatch) {
        while self.active && self.inflight.is_empty() {
            if self.cur >= self.waves.len() {
                return;
            }
            let wave = std::mem::take(&mut self.waves[self.cur]);
            self.cur += 1;
            for entry in wave {
                let _ = self.inflight.insert(entry.va);
                sio.submit(SioJob::Store(entry));
            }
        }
    }

    fn on_completion(&mut self, va: Vaddr) -> bool {
        self.active && self.inflight.remove(&va) && self.inflight.is_empty()
    }

    fn is_done(&self) -> bool {
        self.active && self.inflight.is_empty() && self.cur >= self.waves.len()
    }

    fn finish(&mut self) -> Vec<Box<Task>> {
        self.active = false;
        self.waves.clear();
        self.cur = 0;
        std::mem::take(&mut self.waiters)
    }
}

/// A task parked on its awaited virtual addresses.
struct Pending {
    task: Box<Task>,
    nwait: usize,
}

/// VPROC-local execution state: the pending set and the per-inode
/// arrival-order barriers. While a task for some ino is parked, later
/// tasks for the same ino queue behind it instead of overtaking.
struct VprocState {
    pending: HashMap<u64, Pending>,
    wait_map: HashMap<Vaddr, Vec<u64>>,
    next_pending_id: u64,
    barrier: HashMap<u64, std::collections::VecDeque<Box<Task>>>,
    flusher: Flusher,
}

impl VprocState {
    fn new() -> VprocState {
        VprocState {
            pending: HashMap::new(),
            wait_map: HashMap::new(),
            next_pending_id: 0,
            barrier: HashMap::new(),
            flusher: Flusher::new(),
        }
    }
}

pub struct Server {
    fsys: Arc<Fsys>,
    state: Arc<StateCell>,
    nsio: usize,
}

impl Server {
    pub fn new(fsys: Arc<Fsys>, nsio: usize) -> Server {
        Server {
            fsys,
            state: Arc::new(StateCell::new()),
            nsio: nsio.clamp(1, NSIO_MAX),
        }
    }

    pub fn nsio_from_env() -> usize {
        std::env::var("FS_SIO_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(NSIO_DEFAULT)
    }

    /// Runs the pipeline over an adaptor byte stream until drain
    /// completes. Consumes the calling thread.
    pub fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        info!("server start, {} sio workers", self.nsio);
        self.state.set(ServState::Boot);
        defer! {
            info!("server stopped");
        }

        let (vproc_task_tx, vproc_task_rx) = bounded::<VprocMsg>(QUEUE_DEPTH);
        // Internal messages (completions, FINI round trips) must never
        // be throttled against the stages that drain them.
        let (vproc_int_tx, vproc_int_rx) = unbounded::<VprocMsg>();
        let (tx_tx, tx_rx) = bounded::<Box<Task>>(QUEUE_DEPTH);

        let mut sio_txs = Vec::new();
        let mut sio_handles = Vec::new();
        for i in 0..self.nsio {
            let (jtx, jrx) = bounded::<SioJob>(QUEUE_DEPTH);
            sio_txs.push(jtx);
            let pstor = self.fsys.pstor().clone();
            let state = self.state.clone();
            let compl = vproc_int_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("volufs-sio-{}", i))
                .spawn(move || run_sio(pstor, state, jrx, compl))
                .map_err(Error::Io)?;
            sio_handles.push(handle);
        }
        let sio = Arc::new(SioDispatch { shards: sio_txs, counter: AtomicUsize::new(0) });
        self.fsys.install_sio(sio.clone());

        let rx_state = self.state.clone();
        let rx_handle = {
            let tx = vproc_task_tx.clone();
            thread::Builder::new()
                .name("volufs-rx".into())
                .spawn(move || run_rx(reader, rx_state, tx))
                .map_err(Error::Io)?
        };

        let tx_handle = {
            let fsys = self.fsys.clone();
            let state = self.state.clone();
            let fini = vproc_int_tx.clone();
            thread::Builder::new()
                .name("volufs-tx".into())
                .spawn(move || run_tx(fsys, state, writer, tx_rx, fini))
                .map_err(Error::Io)?
        };

        self.state.set(ServState::Active);
        run_vproc(
            &self.fsys,
            &self.state,
            &sio,
            vproc_task_rx,
            vproc_int_rx,
            tx_tx,
        );

        // TERM: every queue is drained; collect the stage threads.
        drop(vproc_task_tx);
        drop(vproc_int_tx);
        let _ = rx_handle.join();
        let _ = tx_handle.join();
        drop(sio);
        for handle in sio_handles {
            let _ = handle.join();
        }

        self.fsys.uninstall_sio();
        // Handles are per-connection; an adaptor that vanished without
        // releasing must not wedge a later unmount.
        self.fsys.release_all_handles();
        Ok(())
    }
}

fn run_rx<R: Read>(mut reader: R, state: Arc<StateCell>, tx: Sender<VprocMsg>) {
    debug!("rx worker started");
    loop {
        match proto::read_request(&mut reader) {
            Ok(Some((head, payload))) => match task::parse(&head, &payload) {
                Ok(mut t) => {
                    t.state = TaskState::ExecReq;
                    if tx.send(VprocMsg::Task(Box::new(t))).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    // Unparsable frame: fail just this request.
                    let mut t = Task {
                        unique: head.unique,
                        opcode: Opcode::from_u32(head.opcode).unwrap_or(Opcode::Ioctl),
                        ino: head.ino,
                        cred: Default::default(),
                        args: Args::Statfs,
                        state: TaskState::ExecRes,
                        result: None,
                    };
                    t.result = Some(Err(err));
                    if tx.send(VprocMsg::Task(Box::new(t))).is_err() {
                        break;
                    }
                }
            },
            Ok(None) => break,
            Err(err) => {
                warn!("rx stream error: {}", err);
                break;
            }
        }
        if !state.is_running() {
            break;
        }
    }
    let _ = tx.send(VprocMsg::RxDone);
    debug!("rx worker completed");
}

fn run_sio(
    pstor: Arc<Pstor>,
    state: Arc<StateCell>,
    jobs: Receiver<SioJob>,
    compl: Sender<VprocMsg>,
) {
    debug!("sio worker started");
    let timeout = Duration::from_millis(DEQ_TIMEOUT_MS);
    loop {
        match jobs.recv_timeout(timeout) {
            Ok(SioJob::Load(entry)) => {
                if let Err(err) = pstor.fetch(&entry) {
                    warn!("load of {} failed: {}", entry.va, err);
                }
                if compl.send(VprocMsg::Completion(entry.va)).is_err() {
                    break;
                }
            }
            Ok(SioJob::Store(entry)) => {
                if let Err(err) = pstor.store(&entry) {
                    error!("store of {} failed: {}", entry.va, err);
                }
                if compl.send(VprocMsg::Completion(entry.va)).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !state.is_running() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("sio worker completed");
}

fn run_tx<W: Write>(
    fsys: Arc<Fsys>,
    state: Arc<StateCell>,
    mut writer: W,
    tasks: Receiver<Box<Task>>,
    fini: Sender<VprocMsg>,
) {
    debug!("tx worker started");
    let timeout = Duration::from_millis(DEQ_TIMEOUT_MS);
    loop {
        match tasks.recv_timeout(timeout) {
            Ok(mut t) => {
                if t.state == TaskState::FiniRes {
                    // End of a read task's life cycle.
                    t.state = TaskState::Done;
                    continue;
                }
                let attr_to = fsys.attr_timeout.load(Ordering::Relaxed);
                let entry_to = fsys.entry_timeout.load(Ordering::Relaxed);
                let head = RespHead {
                    opcode: t.opcode as u32,
                    error: -t.errno(),
                    unique: t.unique,
                };
                let payload = task::encode_reply(&t, attr_to, entry_to);
                if let Err(err) = proto::write_response(&mut writer, &head, &payload) {
                    warn!("tx stream error: {}", err);
                    break;
                }
                if t.opcode == Opcode::Read && matches!(t.result, Some(Ok(_))) {
                    // Release pinned blocks only after the reply left.
                    t.state = TaskState::FiniReq;
                    if fini.send(VprocMsg::Fini(t)).is_err() {
                        break;
                    }
                } else {
                    t.state = TaskState::Done;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !state.is_running() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("tx worker completed");
}

fn run_vproc(
    fsys: &Arc<Fsys>,
    state: &Arc<StateCell>,
    sio: &Arc<SioDispatch>,
    task_rx: Receiver<VprocMsg>,
    int_rx: Receiver<VprocMsg>,
    tx_tx: Sender<Box<Task>>,
) {
    debug!("vproc worker started");
    let timeout = Duration::from_millis(DEQ_TIMEOUT_MS);
    let mut vs = VprocState::new();
    let mut rx_done = false;

    loop {
        let msg = crossbeam_channel::select! {
            recv(int_rx) -> msg => msg.ok(),
            recv(task_rx) -> msg => msg.ok(),
            default(timeout) => None,
        };
        match msg {
            Some(VprocMsg::Task(t)) => {
                exec_task(fsys, t, false, &mut vs, sio, &tx_tx);
            }
            Some(VprocMsg::Fini(mut t)) => {
                t.state = TaskState::FiniRes;
                let _ = tx_tx.send(t);
            }
            Some(VprocMsg::Completion(va)) => {
                // Wake parked tasks whose wait sets drained.
                if let Some(ids) = vs.wait_map.remove(&va) {
                    for id in ids {
                        let ready = match vs.pending.get_mut(&id) {
                            Some(p) => {
                                p.nwait -= 1;
                                p.nwait == 0
                            }
                            None => false,
                        };
                        if ready {
                            if let Some(p) = vs.pending.remove(&id) {
                                exec_task(fsys, p.task, true, &mut vs, sio, &tx_tx);
                            }
                        }
                    }
                }
                if vs.flusher.on_completion(va) {
                    vs.flusher.issue(sio);
                    if vs.flusher.is_done() {
                        finish_flush(fsys, &mut vs.flusher, &tx_tx);
                    }
                }
            }
            Some(VprocMsg::RxDone) => {
                rx_done = true;
            }
            None => {}
        }

        // Housekeeping: reap queue, cache pressure, drain probing.
        fsys.reap_now();
        let _ = fsys.cache().squeeze(!fsys.is_active());
        if !fsys.is_active() && !fsys.has_open_files() && !vs.flusher.active {
            if fsys.cache().has_dirty() {
                vs.flusher.start(fsys, None);
                vs.flusher.issue(sio);
                if vs.flusher.is_done() {
                    finish_flush(fsys, &mut vs.flusher, &tx_tx);
                }
            } else if state.get() == ServState::Active {
                state.set(ServState::Drain);
            }
        }
        if rx_done
            && vs.pending.is_empty()
            && vs.barrier.is_empty()
            && !vs.flusher.active
            && !fsys.has_reapable()
            && task_rx.is_empty()
            && int_rx.is_empty()
        {
            state.set(ServState::Term);
            break;
        }
    }
    debug!("vproc worker completed");
}

fn finish_flush(fsys: &Fsys, flusher: &mut Flusher, tx_tx: &Sender<Box<Task>>) {
    if let Err(err) = fsys.pstor().volume().sync() {
        error!("volume sync failed: {}", err);
    }
    for mut waiter in flusher.finish() {
        waiter.state = TaskState::ExecRes;
        waiter.result = Some(Ok(Reply::Empty));
        let _ = tx_tx.send(waiter);
    }
}

fn exec_task(
    fsys: &Arc<Fsys>,
    mut t: Box<Task>,
    resumed: bool,
    vs: &mut VprocState,
    sio: &Arc<SioDispatch>,
    tx_tx: &Sender<Box<Task>>,
) {
    // Arrival-order barrier: while an earlier task on this inode is
    // parked, later ones queue behind it.
    if !resumed {
        if let Some(queue) = vs.barrier.get_mut(&t.ino) {
            queue.push_back(t);
            return;
        }
    }
    let ino = t.ino;
    // Frames that failed parsing carry their verdict already.
    if t.result.is_none() {
        if let Args::Fsync { fh, .. } = &t.args {
            // Fsync waits for a pipelined flush cycle instead of a
            // handler result.
            let owner = match fsys.handle_ino(*fh) {
                Ok((fino, _)) => Some(fino),
                Err(err) => {
                    t.result = Some(Err(err));
                    t.state = TaskState::ExecRes;
                    let _ = tx_tx.send(t);
                    release_barrier(fsys, ino, vs, sio, tx_tx);
                    return;
                }
            };
            vs.flusher.start(fsys, owner);
            if !vs.flusher.active {
                // Nothing dirty: only the device sync remains.
                t.result = Some(fsys.pstor().volume().sync().map(|_| Reply::Empty));
                t.state = TaskState::ExecRes;
                let _ = tx_tx.send(t);
                release_barrier(fsys, ino, vs, sio, tx_tx);
                return;
            }
            vs.flusher.waiters.push(t);
            vs.flusher.issue(sio);
            if vs.flusher.is_done() {
                finish_flush(fsys, &mut vs.flusher, tx_tx);
            }
            release_barrier(fsys, ino, vs, sio, tx_tx);
            return;
        }
        match execute_args(fsys, &t) {
            Err(Error::WouldBlock(vas)) => {
                let id = vs.next_pending_id;
                vs.next_pending_id += 1;
                let nwait = vas.len();
                for va in vas {
                    vs.wait_map.entry(va).or_default().push(id);
                }
                t.state = TaskState::ExecReq;
                let _ = vs.pending.insert(id, Pending { task: t, nwait });
                vs.barrier.entry(ino).or_default();
                return;
            }
            res => {
                if let Err(err) = &res {
                    if err.is_fatal_on_meta() && !is_leaf_error(err) && fsys.is_active() {
                        error!("fatal metadata error: {}", err);
                        fsys.deactivate();
                    }
                }
                t.result = Some(res);
            }
        }
    }
    t.state = TaskState::ExecRes;
    let _ = tx_tx.send(t);
    release_barrier(fsys, ino, vs, sio, tx_tx);
}

/// A task on `ino` finished; run the next queued one, dropping the
/// barrier when the queue drains.
fn release_barrier(
    fsys: &Arc<Fsys>,
    ino: u64,
    vs: &mut VprocState,
    sio: &Arc<SioDispatch>,
    tx_tx: &Sender<Box<Task>>,
) {
    let next = match vs.barrier.get_mut(&ino) {
        Some(queue) => match queue.pop_front() {
            Some(next) => Some(next),
            None => {
                let _ = vs.barrier.remove(&ino);
                None
            }
        },
        None => None,
    };
    if let Some(next) = next {
        exec_task(fsys, next, true, vs, sio, tx_tx);
    }
}

fn is_leaf_error(err: &Error) -> bool {
    matches!(err, Error::CorruptData(va) if va.kind == Kind::Leaf)
}

/// Requests still admitted once the superblock went inactive: handle
/// teardown, statistics, and the pseudo files that steer the drain.
fn allowed_when_inactive(fsys: &Fsys, t: &Task) -> bool {
    if is_pseudo_ino(t.ino) {
        return true;
    }
    match &t.args {
        Args::Release { .. }
        | Args::Forget { .. }
        | Args::Ioctl { .. }
        | Args::Statfs
        | Args::Fsync { .. } => true,
        Args::Read { fh, .. } => {
            matches!(fsys.handle_ino(*fh), Ok((i, _)) if is_pseudo_ino(i))
        }
        Args::Write { fh, .. } => {
            matches!(fsys.handle_ino(*fh), Ok((i, _)) if is_pseudo_ino(i))
        }
        _ => false,
    }
}

/// Dispatches one parsed request to the logical engines.
pub fn execute_args(fsys: &Fsys, t: &Task) -> std::result::Result<Reply, Error> {
    if !fsys.is_active() && !allowed_when_inactive(fsys, t) {
        return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EIO)));
    }
    let ino = t.ino;
    match &t.args {
        Args::Lookup { name } => fsys.lookup_op(ino, name, t.cred).map(Reply::Entry),
        Args::Forget { nlookup } => fsys.forget_op(ino, *nlookup).map(|_| Reply::Empty),
        Args::Getattr => fsys.getattr_op(ino).map(Reply::Attr),
        Args::Setattr(sa) => fsys.setattr_op(ino, sa, t.cred).map(Reply::Attr),
        Args::Mkdir { name, mode } => {
            fsys.mkdir_op(ino, name, *mode, t.cred).map(Reply::Entry)
        }
        Args::Rmdir { name } => fsys.rmdir_op(ino, name, t.cred).map(|_| Reply::Empty),
        Args::Create { name, mode, flags } => fsys
            .create_op(ino, name, *mode, *flags, t.cred)
            .map(|(attr, fh)| Reply::Created { attr, fh }),
        Args::Open { flags } => fsys.open_op(ino, *flags).map(|fh| Reply::Opened { fh }),
        Args::Read { fh, off, len } => {
            let (fino, _) = fsys.handle_ino(*fh)?;
            if is_pseudo_ino(fino) {
                pseudo::read(fsys, fino, *off, *len as usize).map(Reply::Data)
            } else {
                fsys.read_op(fino, *off, *len as usize).map(Reply::Data)
            }
        }
        Args::Write { fh, off, data } => {
            let (fino, _) = fsys.handle_ino(*fh)?;
            if is_pseudo_ino(fino) {
                pseudo::write(fsys, fino, data).map(|n| Reply::Written(n as u64))
            } else {
                fsys.write_op(fino, *off, data).map(|n| Reply::Written(n as u64))
            }
        }
        Args::Release { fh } => fsys.release_op(*fh).map(|_| Reply::Empty),
        Args::Fsync { .. } => {
            // Only the synchronous executor lands here; the pipeline
            // intercepts fsync for the wave flusher.
            fsys.sync_now(None).map(|_| Reply::Empty)
        }
        Args::Fallocate { fh, mode, off, len } => {
            let (fino, _) = fsys.handle_ino(*fh)?;
            fsys.fallocate_op(fino, *mode, *off, *len).map(|_| Reply::Empty)
        }
        Args::Flock => Err(Error::NotSupported),
        Args::Rename { name, newparent, newname, flags } => fsys
            .rename_op(ino, name, *newparent, newname, *flags, t.cred)
            .map(|_| Reply::Empty),
        Args::Link { ino: source, name } => {
            fsys.link_op(*source, ino, name, t.cred).map(Reply::Entry)
        }
        Args::Symlink { name, target } => {
            fsys.symlink_op(ino, name, target, t.cred).map(Reply::Entry)
        }
        Args::Readlink => fsys.readlink_op(ino).map(Reply::Data),
        Args::Setxattr { name, value, set } => {
            fsys.setxattr_op(ino, name, value, *set).map(|_| Reply::Empty)
        }
        Args::Getxattr { name, size } => {
            let value = fsys.getxattr_op(ino, name)?;
            if *size == 0 {
                // Size probe.
                Ok(Reply::Written(value.len() as u64))
            } else if value.len() > *size as usize {
                Err(Error::Invalid)
            } else {
                Ok(Reply::Data(value))
            }
        }
        Args::Listxattr { size } => {
            let names = fsys.listxattr_op(ino)?;
            let mut flat = Vec::new();
            for name in names {
                flat.extend_from_slice(&name);
                flat.push(0);
            }
            if *size == 0 {
                Ok(Reply::Written(flat.len() as u64))
            } else if flat.len() > *size as usize {
                Err(Error::Invalid)
            } else {
                Ok(Reply::Data(flat))
            }
        }
        Args::Removexattr { name } => fsys.removexattr_op(ino, name).map(|_| Reply::Empty),
        Args::Readdir { cursor, limit } => fsys
            .readdir_op(ino, *cursor, (*limit).min(1024) as usize)
            .map(Reply::Dirents),
        Args::Statfs => fsys.statfs().map(Reply::Statfs),
        Args::Lseek { off, whence } => fsys.lseek_op(ino, *off, *whence).map(Reply::Lseek),
        Args::Fiemap { off, len } => fsys.fiemap_op(ino, *off, *len).map(Reply::Extents),
        Args::Ioctl { cmd, arg } => match *cmd {
            proto::IOCTL_HALT => {
                match arg {
                    0 => fsys.deactivate(),
                    1 => fsys.activate(),
                    _ => return Err(Error::Invalid),
                }
                Ok(Reply::Empty)
            }
            _ => Err(Error::NotSupported),
        },
        Args::Unlink { name } => fsys.unlink_op(ino, name, t.cred).map(|_| Reply::Empty),
    }
}
