//! The pass-through policy
//!
//! Registered by the framework at startup and the initial default. Bios go
//! straight to the device and no per-thread contexts are allocated.

use crate::bio::Bio;
use crate::context::ThreadIo;
use crate::disk::Disk;
use crate::policy::{DiskPolicy, Policy, QueueOutcome};
use dsched_common::Result;
use std::sync::Arc;

/// Name of the built-in pass-through policy
pub const NOOP_POLICY: &str = "noop";

#[derive(Debug, Default)]
pub struct NoopPolicy;

impl Policy for NoopPolicy {
    fn name(&self) -> &str {
        NOOP_POLICY
    }

    fn prepare(&self, _disk: &Arc<Disk>) -> Result<Arc<dyn DiskPolicy>> {
        Ok(Arc::new(NoopDisk))
    }

    fn tracks_threads(&self) -> bool {
        false
    }
}

struct NoopDisk;

impl DiskPolicy for NoopDisk {
    fn teardown(&self) {}

    fn cancel_all(&self) {}

    fn bio_queue(&self, _tdio: &Arc<ThreadIo>, bio: Bio) -> QueueOutcome {
        QueueOutcome::Passthrough(bio)
    }
}
