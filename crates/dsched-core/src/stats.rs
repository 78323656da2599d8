//! Framework-wide counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocation and routing counters
#[derive(Debug, Default)]
pub struct DschedStats {
    /// I/O contexts ever allocated
    pub tdctx_allocations: AtomicU64,
    /// Per-disk thread contexts ever allocated
    pub tdio_allocations: AtomicU64,
    /// Per-disk policy contexts ever prepared
    pub diskctx_allocations: AtomicU64,
    /// Bios that arrived without an I/O context
    pub no_tdctx: AtomicU64,
    /// Live thread contexts
    pub nthreads: AtomicU64,
    /// Live process contexts
    pub nprocs: AtomicU64,
    /// Bios sent straight to the device
    pub raw_dispatches: AtomicU64,
    /// Bios handed to a policy
    pub policy_queued: AtomicU64,
}

/// Point-in-time copy of [`DschedStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DschedStatsSnapshot {
    pub tdctx_allocations: u64,
    pub tdio_allocations: u64,
    pub diskctx_allocations: u64,
    pub no_tdctx: u64,
    pub nthreads: u64,
    pub nprocs: u64,
    pub raw_dispatches: u64,
    pub policy_queued: u64,
}

impl DschedStats {
    #[must_use]
    pub fn snapshot(&self) -> DschedStatsSnapshot {
        DschedStatsSnapshot {
            tdctx_allocations: self.tdctx_allocations.load(Ordering::Relaxed),
            tdio_allocations: self.tdio_allocations.load(Ordering::Relaxed),
            diskctx_allocations: self.diskctx_allocations.load(Ordering::Relaxed),
            no_tdctx: self.no_tdctx.load(Ordering::Relaxed),
            nthreads: self.nthreads.load(Ordering::Relaxed),
            nprocs: self.nprocs.load(Ordering::Relaxed),
            raw_dispatches: self.raw_dispatches.load(Ordering::Relaxed),
            policy_queued: self.policy_queued.load(Ordering::Relaxed),
        }
    }
}
