//! Device-side interface
//!
//! The framework hands bios to a [`DiskDevice`]; what happens below that
//! (driver queues, request formatting) is the device's business.

use crate::bio::Bio;
use dsched_common::{BioCmd, BioId, BioStatus, IoOwner};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// A block device accepting bios
pub trait DiskDevice: Send + Sync {
    /// Start the I/O; the device completes the bio when it is done
    fn strategy(&self, bio: Bio);
}

/// One bio as it reached the device
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRecord {
    pub bio: BioId,
    pub owner: Option<IoOwner>,
    pub cmd: BioCmd,
    pub offset: u64,
    pub size: u64,
}

/// In-memory device that holds bios until told to complete them
///
/// With [`QueueDevice::inline`] bios complete successfully inside
/// `strategy`, like a device with an infinitely fast write cache.
#[derive(Debug, Default)]
pub struct QueueDevice {
    pending: Mutex<VecDeque<Bio>>,
    dispatched: Mutex<Vec<DispatchRecord>>,
    inline: bool,
}

impl QueueDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn inline() -> Self {
        Self {
            inline: true,
            ..Self::default()
        }
    }

    /// Bios started but not yet completed
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Complete the oldest pending bio
    pub fn complete_next(&self, status: BioStatus) -> Option<BioId> {
        // Pop first: completion may start new I/O on this device
        let bio = self.pending.lock().pop_front()?;
        let id = bio.id();
        bio.complete(status);
        Some(id)
    }

    /// Complete pending bios, including ones started by completions
    pub fn complete_all(&self, status: BioStatus) -> usize {
        let mut completed = 0;
        while self.complete_next(status).is_some() {
            completed += 1;
        }
        completed
    }

    /// Every bio that reached the device, in dispatch order
    #[must_use]
    pub fn dispatched(&self) -> Vec<DispatchRecord> {
        self.dispatched.lock().clone()
    }

    pub fn take_dispatched(&self) -> Vec<DispatchRecord> {
        std::mem::take(&mut *self.dispatched.lock())
    }
}

impl DiskDevice for QueueDevice {
    fn strategy(&self, bio: Bio) {
        self.dispatched.lock().push(DispatchRecord {
            bio: bio.id(),
            owner: bio.owner().map(|ctx| ctx.owner()),
            cmd: bio.cmd(),
            offset: bio.offset(),
            size: bio.size(),
        });
        if self.inline {
            bio.complete(BioStatus::Success);
        } else {
            self.pending.lock().push_back(bio);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_queue_device_holds_until_completed() {
        let device = QueueDevice::new();
        let done = Arc::new(AtomicU64::new(0));
        for i in 0..3 {
            let d = done.clone();
            device.strategy(Bio::read(i * 512, 512).on_complete(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(device.pending(), 3);
        assert_eq!(done.load(Ordering::SeqCst), 0);

        assert!(device.complete_next(BioStatus::Success).is_some());
        assert_eq!(device.complete_all(BioStatus::Success), 2);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(device.dispatched().len(), 3);
        assert_eq!(device.dispatched()[1].offset, 512);
    }

    #[test]
    fn test_inline_device_completes_immediately() {
        let device = QueueDevice::inline();
        let done = Arc::new(AtomicU64::new(0));
        let d = done.clone();
        device.strategy(Bio::write(0, 4096).on_complete(move |c| {
            assert!(c.status.is_success());
            d.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(device.pending(), 0);
        assert_eq!(device.take_dispatched().len(), 1);
        assert!(device.dispatched().is_empty());
    }
}
