//! Per-process and per-thread I/O contexts
//!
//! A [`ThreadCtx`] exists for every process or lone thread that issues I/O.
//! It owns one [`ThreadIo`] per disk it has talked to; policies key their
//! per-thread scheduling state by the tdio id.
//!
//! ```text
//!   ThreadCtx (pid:42) ──┬── ThreadIo (da0, generation 3)
//!                        └── ThreadIo (da1, generation 5)
//! ```
//!
//! A tdio belongs to one binding generation of its disk. After a policy
//! switch the old tdio is stale and is replaced on the next I/O.

use crate::stats::DschedStats;
use dsched_common::{Error, IoOwner, ProcId, Result, TdioId, ThreadId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace};

/// The caller issuing a buffer: the current process if any, and the thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issuer {
    pub pid: Option<ProcId>,
    pub tid: ThreadId,
}

impl Issuer {
    #[must_use]
    pub const fn process(pid: ProcId, tid: ThreadId) -> Self {
        Self { pid: Some(pid), tid }
    }

    #[must_use]
    pub const fn kernel_thread(tid: ThreadId) -> Self {
        Self { pid: None, tid }
    }
}

/// Per-thread, per-disk I/O context
#[derive(Debug)]
pub struct ThreadIo {
    id: TdioId,
    owner: IoOwner,
    disk: Arc<str>,
    generation: u64,
    weight: AtomicU32,
    retired: AtomicBool,
}

impl ThreadIo {
    #[must_use]
    pub const fn id(&self) -> TdioId {
        self.id
    }

    #[must_use]
    pub const fn owner(&self) -> IoOwner {
        self.owner
    }

    #[must_use]
    pub fn disk(&self) -> &str {
        &self.disk
    }

    /// Binding generation of the disk this tdio was created for
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Current I/O weight of the owning context
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// The tdio was released by its context and takes no further I/O
    ///
    /// Set before the framework releases it from the policy, so a policy
    /// that checks this under its own lock never tracks it again.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

/// I/O context of a process or a lone thread
#[derive(Debug)]
pub struct ThreadCtx {
    owner: IoOwner,
    weight: AtomicU32,
    tdios: Mutex<Vec<Arc<ThreadIo>>>,
    dead: AtomicBool,
}

impl ThreadCtx {
    fn new(owner: IoOwner, weight: u32) -> Self {
        Self {
            owner,
            weight: AtomicU32::new(weight),
            tdios: Mutex::new(Vec::new()),
            dead: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn owner(&self) -> IoOwner {
        self.owner
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Set the proportional-share weight of this context and its tdios
    pub fn set_io_weight(&self, weight: u32) -> Result<()> {
        if weight == 0 {
            return Err(Error::InvalidWeight(weight));
        }
        let tdios = self.tdios.lock();
        self.weight.store(weight, Ordering::Relaxed);
        for tdio in tdios.iter() {
            tdio.weight.store(weight, Ordering::Relaxed);
        }
        Ok(())
    }

    /// The context's owner has exited
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Snapshot of the live tdios
    #[must_use]
    pub fn tdios(&self) -> Vec<Arc<ThreadIo>> {
        self.tdios.lock().clone()
    }

    /// Find the tdio for a disk binding, allocating it on first use
    ///
    /// Returns `None` once the owner has exited, and `true` alongside a
    /// freshly allocated tdio. Tdios of older generations of the same disk
    /// are dropped.
    pub(crate) fn tdio_for(
        &self,
        disk: &Arc<str>,
        generation: u64,
        alloc: impl FnOnce(u32) -> Arc<ThreadIo>,
    ) -> Option<(Arc<ThreadIo>, bool)> {
        let mut tdios = self.tdios.lock();
        if self.is_dead() {
            return None;
        }
        // Newest tdios are at the back
        if let Some(tdio) = tdios
            .iter()
            .rev()
            .find(|t| t.generation == generation && *t.disk == **disk)
        {
            return Some((tdio.clone(), false));
        }
        tdios.retain(|t| {
            let keep = *t.disk != **disk;
            if !keep {
                t.retire();
            }
            keep
        });
        let tdio = alloc(self.weight());
        tdios.push(tdio.clone());
        Some((tdio, true))
    }

    /// Mark the context dead and hand back its tdios
    fn retire(&self) -> Vec<Arc<ThreadIo>> {
        let mut tdios = self.tdios.lock();
        self.dead.store(true, Ordering::Release);
        for tdio in tdios.iter() {
            tdio.retire();
        }
        std::mem::take(&mut *tdios)
    }
}

/// Tracks I/O contexts in step with process and thread lifecycle
pub struct IoContextTracker {
    procs: RwLock<HashMap<ProcId, Arc<ThreadCtx>>>,
    threads: RwLock<HashMap<ThreadId, Arc<ThreadCtx>>>,
    next_tdio: AtomicU64,
    default_weight: AtomicU32,
    stats: Arc<DschedStats>,
}

impl IoContextTracker {
    #[must_use]
    pub fn new(stats: Arc<DschedStats>) -> Self {
        Self {
            procs: RwLock::new(HashMap::new()),
            threads: RwLock::new(HashMap::new()),
            next_tdio: AtomicU64::new(1),
            default_weight: AtomicU32::new(1),
            stats,
        }
    }

    /// Weight given to contexts created from now on
    pub fn set_default_weight(&self, weight: u32) -> Result<()> {
        if weight == 0 {
            return Err(Error::InvalidWeight(weight));
        }
        self.default_weight.store(weight, Ordering::Relaxed);
        Ok(())
    }

    fn alloc_ctx(&self, owner: IoOwner) -> Arc<ThreadCtx> {
        self.stats.tdctx_allocations.fetch_add(1, Ordering::Relaxed);
        trace!(%owner, "allocating I/O context");
        Arc::new(ThreadCtx::new(owner, self.default_weight.load(Ordering::Relaxed)))
    }

    /// Create the aggregate context of a new process
    pub fn new_proc(&self, pid: ProcId) -> Arc<ThreadCtx> {
        match self.procs.write().entry(pid) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                self.stats.nprocs.fetch_add(1, Ordering::Relaxed);
                e.insert(self.alloc_ctx(IoOwner::Proc(pid))).clone()
            }
        }
    }

    /// Create the context of a new thread
    pub fn new_thread(&self, tid: ThreadId) -> Arc<ThreadCtx> {
        match self.threads.write().entry(tid) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                self.stats.nthreads.fetch_add(1, Ordering::Relaxed);
                e.insert(self.alloc_ctx(IoOwner::Thread(tid))).clone()
            }
        }
    }

    /// Context a buffer from `issuer` is charged to
    ///
    /// Process I/O is charged to the process aggregate, kernel thread I/O
    /// to the thread. Contexts are created on first I/O.
    pub fn context_for(&self, issuer: Issuer) -> Arc<ThreadCtx> {
        match issuer.pid {
            Some(pid) => self.proc(pid).unwrap_or_else(|| self.new_proc(pid)),
            None => self.thread(issuer.tid).unwrap_or_else(|| self.new_thread(issuer.tid)),
        }
    }

    #[must_use]
    pub fn proc(&self, pid: ProcId) -> Option<Arc<ThreadCtx>> {
        self.procs.read().get(&pid).cloned()
    }

    #[must_use]
    pub fn thread(&self, tid: ThreadId) -> Option<Arc<ThreadCtx>> {
        self.threads.read().get(&tid).cloned()
    }

    /// Remove a process context and return the tdios to release
    pub fn exit_proc(&self, pid: ProcId) -> Vec<Arc<ThreadIo>> {
        let Some(ctx) = self.procs.write().remove(&pid) else {
            return Vec::new();
        };
        self.stats.nprocs.fetch_sub(1, Ordering::Relaxed);
        debug!(%pid, "process I/O context released");
        ctx.retire()
    }

    /// Remove a thread context and return the tdios to release
    pub fn exit_thread(&self, tid: ThreadId) -> Vec<Arc<ThreadIo>> {
        let Some(ctx) = self.threads.write().remove(&tid) else {
            return Vec::new();
        };
        self.stats.nthreads.fetch_sub(1, Ordering::Relaxed);
        debug!(%tid, "thread I/O context released");
        ctx.retire()
    }

    /// Allocate a tdio for `owner` on a disk binding generation
    ///
    /// The framework calls this on an owner's first I/O to a binding;
    /// policies only need it to build tdios in isolation.
    pub fn alloc_tdio(
        &self,
        owner: IoOwner,
        disk: Arc<str>,
        generation: u64,
        weight: u32,
    ) -> Arc<ThreadIo> {
        self.stats.tdio_allocations.fetch_add(1, Ordering::Relaxed);
        let id = TdioId(self.next_tdio.fetch_add(1, Ordering::Relaxed));
        trace!(%owner, %id, %disk, generation, "allocating tdio");
        Arc::new(ThreadIo {
            id,
            owner,
            disk,
            generation,
            weight: AtomicU32::new(weight),
            retired: AtomicBool::new(false),
        })
    }
}
