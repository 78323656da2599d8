//! Disks and their policy bindings
//!
//! A [`DiskBinding`] ties a [`Disk`] to exactly one active policy context.
//! The binding moves through these states:
//!
//! ```text
//!   Bound ──switch──▶ Switching ──prepare ok──▶ Bound (generation + 1)
//!     │                   └──────prepare failed──▶ Bound (unchanged)
//!     └──destroy──▶ Detached
//! ```
//!
//! Admissions hold a read guard on the state for the whole hand-off to the
//! policy, so a switch or destroy waits for them and every admission after
//! that sees `Switching` or `Detached`.

use crate::bio::Bio;
use crate::device::DiskDevice;
use crate::policy::DiskPolicy;
use crate::registry::PolicyEntry;
use dsched_common::config::DEFAULT_MAX_TAG_QUEUE_DEPTH;
use dsched_common::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;

/// A block device known to the framework
pub struct Disk {
    name: Arc<str>,
    serial: RwLock<Option<String>>,
    device: Arc<dyn DiskDevice>,
    /// `None` until set explicitly or by the framework on attach
    max_tag_queue_depth: Option<u32>,
    current_tag_queue_depth: AtomicU32,
}

impl Disk {
    pub fn new(name: impl Into<Arc<str>>, device: Arc<dyn DiskDevice>) -> Self {
        Self {
            name: name.into(),
            serial: RwLock::new(None),
            device,
            max_tag_queue_depth: None,
            current_tag_queue_depth: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        *self.serial.get_mut() = Some(serial.into());
        self
    }

    #[must_use]
    pub fn with_max_tag_queue_depth(mut self, depth: u32) -> Self {
        self.max_tag_queue_depth = Some(depth.max(1));
        self
    }

    /// Use `depth` unless a depth was set explicitly
    pub(crate) fn or_max_tag_queue_depth(mut self, depth: u32) -> Self {
        self.max_tag_queue_depth.get_or_insert(depth.max(1));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    #[must_use]
    pub fn serial(&self) -> Option<String> {
        self.serial.read().clone()
    }

    pub(crate) fn set_serial(&self, serial: impl Into<String>) {
        *self.serial.write() = Some(serial.into());
    }

    /// Tunable key of the disk name: `mapper/root` becomes `mapper-root`
    #[must_use]
    pub fn tunable_name(&self) -> String {
        self.name.replace('/', "-")
    }

    /// Tunable key of the device head: the name without its unit number
    #[must_use]
    pub fn tunable_head(&self) -> String {
        self.tunable_name()
            .trim_end_matches(|c: char| c.is_ascii_digit())
            .to_string()
    }

    #[must_use]
    pub fn max_tag_queue_depth(&self) -> u32 {
        self.max_tag_queue_depth.unwrap_or(DEFAULT_MAX_TAG_QUEUE_DEPTH)
    }

    #[must_use]
    pub fn current_tag_queue_depth(&self) -> u32 {
        self.current_tag_queue_depth.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn free_slots(&self) -> u32 {
        self.max_tag_queue_depth()
            .saturating_sub(self.current_tag_queue_depth())
    }

    /// Reserve a tag slot for a request sent with request polling
    pub fn try_reserve_tag(&self) -> bool {
        self.current_tag_queue_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < self.max_tag_queue_depth()).then_some(depth + 1)
            })
            .is_ok()
    }

    fn release_tag(&self) {
        let _ = self
            .current_tag_queue_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| depth.checked_sub(1));
    }

    /// Send a bio to the device, bypassing any policy
    pub fn strategy_raw(&self, mut bio: Bio) {
        bio.clear_dsched();
        trace!(disk = %self.name, bio = %bio.id(), "raw dispatch");
        self.device.strategy(bio);
    }

    /// Send a bio that holds a reserved tag slot
    ///
    /// On completion the policy's `bio_done` runs, the tag slot is
    /// released and the policy is polled for more work.
    pub fn strategy_request_polling(self: &Arc<Self>, mut bio: Bio, policy: Arc<dyn DiskPolicy>) {
        let disk = Arc::clone(self);
        bio.push_hook(move |completion| {
            policy.bio_done(completion);
            disk.release_tag();
            policy.polling();
        });
        self.device.strategy(bio);
    }
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("name", &self.name)
            .field("serial", &self.serial())
            .field("max_tag_queue_depth", &self.max_tag_queue_depth())
            .field("current_tag_queue_depth", &self.current_tag_queue_depth())
            .finish_non_exhaustive()
    }
}

/// The policy context a binding currently routes bios to
#[derive(Clone)]
pub(crate) struct ActivePolicy {
    pub(crate) entry: Arc<PolicyEntry>,
    pub(crate) ctx: Arc<dyn DiskPolicy>,
    pub(crate) generation: u64,
}

pub(crate) enum BindingState {
    Bound(ActivePolicy),
    Switching,
    Detached,
}

/// Association of a disk with its active policy
pub struct DiskBinding {
    disk: Arc<Disk>,
    state: RwLock<BindingState>,
}

impl DiskBinding {
    pub(crate) fn new(disk: Arc<Disk>, active: ActivePolicy) -> Self {
        Self {
            disk,
            state: RwLock::new(BindingState::Bound(active)),
        }
    }

    #[must_use]
    pub const fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.disk.name()
    }

    fn active(&self) -> Option<ActivePolicy> {
        match &*self.state.read_recursive() {
            BindingState::Bound(active) => Some(active.clone()),
            BindingState::Switching | BindingState::Detached => None,
        }
    }

    /// Name of the bound policy; `None` while switching or after destroy
    #[must_use]
    pub fn policy_name(&self) -> Option<String> {
        self.active().map(|a| a.entry.name().to_string())
    }

    /// Generation of the current binding
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.active().map(|a| a.generation)
    }

    #[must_use]
    pub fn is_switching(&self) -> bool {
        matches!(*self.state.read_recursive(), BindingState::Switching)
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        matches!(*self.state.read_recursive(), BindingState::Detached)
    }

    /// Bios held by the bound policy
    #[must_use]
    pub fn queued(&self) -> usize {
        self.active().map_or(0, |a| a.ctx.queued())
    }

    /// Counters of the bound policy
    #[must_use]
    pub fn counters(&self) -> Vec<(&'static str, u64)> {
        self.active().map(|a| a.ctx.counters()).unwrap_or_default()
    }

    /// Guard for an admission; recursive so completions may submit
    pub(crate) fn admission(&self) -> RwLockReadGuard<'_, BindingState> {
        self.state.read_recursive()
    }

    /// Enter the switching state and hand out the old policy
    pub(crate) fn begin_switch(&self) -> Result<ActivePolicy> {
        let mut state = self.state.write();
        match std::mem::replace(&mut *state, BindingState::Switching) {
            BindingState::Bound(active) => Ok(active),
            BindingState::Switching => Err(Error::SwitchInProgress(self.name().to_string())),
            BindingState::Detached => {
                *state = BindingState::Detached;
                Err(Error::DiskNotFound(self.name().to_string()))
            }
        }
    }

    /// Leave the switching state with `active` bound
    pub(crate) fn install(&self, active: ActivePolicy) {
        *self.state.write() = BindingState::Bound(active);
    }

    /// Detach the disk and hand out the policy it was bound to
    pub(crate) fn detach(&self) -> Result<ActivePolicy> {
        let mut state = self.state.write();
        match std::mem::replace(&mut *state, BindingState::Detached) {
            BindingState::Bound(active) => Ok(active),
            BindingState::Switching => {
                *state = BindingState::Switching;
                Err(Error::SwitchInProgress(self.name().to_string()))
            }
            BindingState::Detached => Err(Error::DiskNotFound(self.name().to_string())),
        }
    }

    /// Run `f` on the bound policy, if any
    pub(crate) fn with_active<R>(&self, f: impl FnOnce(&ActivePolicy) -> R) -> Option<R> {
        match &*self.state.read_recursive() {
            BindingState::Bound(active) => Some(f(active)),
            BindingState::Switching | BindingState::Detached => None,
        }
    }
}

impl std::fmt::Debug for DiskBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskBinding")
            .field("disk", &self.disk)
            .field("policy", &self.policy_name())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::QueueDevice;
    use dsched_common::BioStatus;

    #[test]
    fn test_tunable_keys() {
        let device = Arc::new(QueueDevice::new());
        let disk = Disk::new("da12", device.clone());
        assert_eq!(disk.tunable_name(), "da12");
        assert_eq!(disk.tunable_head(), "da");

        let disk = Disk::new("mapper/root", device);
        assert_eq!(disk.tunable_name(), "mapper-root");
        assert_eq!(disk.tunable_head(), "mapper-root");
    }

    #[test]
    fn test_tag_reservation() {
        let disk = Disk::new("da0", Arc::new(QueueDevice::new())).with_max_tag_queue_depth(2);
        assert!(disk.try_reserve_tag());
        assert!(disk.try_reserve_tag());
        assert!(!disk.try_reserve_tag());
        assert_eq!(disk.free_slots(), 0);
        disk.release_tag();
        assert_eq!(disk.free_slots(), 1);
    }

    #[test]
    fn test_request_polling_releases_tag_on_completion() {
        use crate::registry::tests::NamedPolicy;
        use crate::policy::Policy;

        let device = Arc::new(QueueDevice::new());
        let disk = Arc::new(Disk::new("da0", device.clone()).with_max_tag_queue_depth(1));
        let ctx = NamedPolicy("pass").prepare(&disk).unwrap();

        assert!(disk.try_reserve_tag());
        disk.strategy_request_polling(Bio::read(0, 512), ctx);
        assert_eq!(disk.current_tag_queue_depth(), 1);
        device.complete_all(BioStatus::Success);
        assert_eq!(disk.current_tag_queue_depth(), 0);
    }
}
