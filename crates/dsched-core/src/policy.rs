//! Scheduling policy interface
//!
//! A policy is registered once under a unique name. Each disk bound to it
//! gets its own [`DiskPolicy`] instance from [`Policy::prepare`]; all
//! queueing decisions for that disk go through that instance.

use crate::bio::{Bio, BioCompletion};
use crate::context::ThreadIo;
use crate::disk::Disk;
use dsched_common::{ProcId, Result, ThreadId};
use std::sync::Arc;

/// What a policy did with a bio offered to it
#[derive(Debug)]
pub enum QueueOutcome {
    /// The policy owns the bio and will dispatch or cancel it
    Queued,
    /// Send the bio straight to the device
    Passthrough(Bio),
    /// The per-disk context no longer accepts bios; retry later
    Rejected(Bio),
}

/// A named scheduling policy
pub trait Policy: Send + Sync {
    /// Unique registry name
    fn name(&self) -> &str;

    /// Create the per-disk context for a newly bound disk
    fn prepare(&self, disk: &Arc<Disk>) -> Result<Arc<dyn DiskPolicy>>;

    /// Whether bios need a per-thread context; pass-through policies say no
    fn tracks_threads(&self) -> bool {
        true
    }

    fn new_buf(&self, _bio: &Bio) {}

    fn new_proc(&self, _pid: ProcId) {}

    fn new_thread(&self, _tid: ThreadId) {}

    fn exit_proc(&self, _pid: ProcId) {}

    fn exit_thread(&self, _tid: ThreadId) {}
}

/// Per-(disk, policy) scheduling context
pub trait DiskPolicy: Send + Sync {
    /// Stop accepting bios and release background resources
    fn teardown(&self);

    /// Complete every held bio with a cancellation
    fn cancel_all(&self);

    /// Take every held bio out of the context without completing it
    fn drain(&self) -> Vec<Bio> {
        Vec::new()
    }

    /// Handle a cache flush request
    fn flush(&self, bio: Bio) -> QueueOutcome {
        QueueOutcome::Passthrough(bio)
    }

    /// Offer a bio issued by `tdio`
    fn bio_queue(&self, tdio: &Arc<ThreadIo>, bio: Bio) -> QueueOutcome;

    /// A tdio was created for this disk binding
    fn new_tdio(&self, _tdio: &Arc<ThreadIo>) {}

    /// A tdio's owner exited; forget it and release its bios
    fn destroy_tdio(&self, _tdio: &ThreadIo) {}

    /// A bio sent with request polling finished on the device
    fn bio_done(&self, _completion: &BioCompletion) {}

    /// A tag slot was released; dispatch more if possible
    fn polling(&self) {}

    /// Bios currently held
    fn queued(&self) -> usize {
        0
    }

    /// Policy-specific counters for management tooling
    fn counters(&self) -> Vec<(&'static str, u64)> {
        Vec::new()
    }
}
