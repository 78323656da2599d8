//! The scheduling framework
//!
//! [`Dsched`] owns the policy registry, the disk bindings and the I/O context
//! tracker. It is an explicit object rather than a global: create one per
//! system and share it behind an `Arc`.
//!
//! Bio admission:
//!
//! ```text
//!   queue(disk, bio)
//!     ├─ flush ─────────────────────▶ policy.flush
//!     ├─ pass-through policy ───────▶ device
//!     ├─ no live I/O context ───────▶ device        (no_tdctx)
//!     └─ tdio lookup/allocation ────▶ policy.bio_queue
//! ```
//!
//! Completion callbacks run on whatever thread completes the bio. They may
//! submit new bios but must not switch or destroy the disk they complete on.

use crate::bio::{Bio, DschedObject};
use crate::context::{IoContextTracker, Issuer, ThreadCtx, ThreadIo};
use crate::disk::{ActivePolicy, BindingState, Disk, DiskBinding};
use crate::noop::{NOOP_POLICY, NoopPolicy};
use crate::policy::{Policy, QueueOutcome};
use crate::registry::{PolicyEntry, PolicyInfo, PolicyRegistry};
use crate::stats::{DschedStats, DschedStatsSnapshot};
use dsched_common::{BioCmd, Config, DschedConfig, Error, ProcId, Result, ThreadId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// A bio the framework refused, handed back to the caller
#[derive(Debug, Error)]
#[error("{error}")]
pub struct QueueRejected {
    error: Error,
    bio: Bio,
}

impl QueueRejected {
    fn new(error: Error, bio: Bio) -> Self {
        Self { error, bio }
    }

    #[must_use]
    pub const fn error(&self) -> &Error {
        &self.error
    }

    /// Whether resubmitting the same bio later may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }

    #[must_use]
    pub fn into_bio(self) -> Bio {
        self.bio
    }

    #[must_use]
    pub fn into_parts(self) -> (Error, Bio) {
        (self.error, self.bio)
    }
}

/// Listing row for management tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    pub name: String,
    pub serial: Option<String>,
    pub policy: Option<String>,
    pub generation: Option<u64>,
    pub queued: usize,
    pub in_flight: u32,
}

/// The disk scheduling framework
pub struct Dsched {
    config: RwLock<DschedConfig>,
    registry: PolicyRegistry,
    disks: RwLock<BTreeMap<String, Arc<DiskBinding>>>,
    tracker: IoContextTracker,
    stats: Arc<DschedStats>,
    default_policy: RwLock<String>,
    default_set: AtomicBool,
    next_generation: AtomicU64,
}

impl Dsched {
    /// Create the framework with the noop policy registered
    #[must_use]
    pub fn new(config: DschedConfig) -> Self {
        let stats = Arc::new(DschedStats::default());
        let dsched = Self {
            default_policy: RwLock::new(config.default_policy.clone()),
            config: RwLock::new(config),
            registry: PolicyRegistry::new(),
            disks: RwLock::new(BTreeMap::new()),
            tracker: IoContextTracker::new(stats.clone()),
            stats,
            default_set: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
        };
        if let Err(err) = dsched.registry.register(Arc::new(NoopPolicy)) {
            warn!(%err, "failed to register the noop policy");
        }
        info!(default_policy = %dsched.default_policy(), "disk scheduler initialized");
        dsched
    }

    /// Create the framework from a full configuration
    ///
    /// Contexts created afterwards start with `bfq.default_weight`.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let dsched = Self::new(config.dsched.clone());
        dsched.tracker.set_default_weight(config.bfq.default_weight)?;
        Ok(dsched)
    }

    #[must_use]
    pub const fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn tracker(&self) -> &IoContextTracker {
        &self.tracker
    }

    #[must_use]
    pub fn stats(&self) -> DschedStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn register(&self, policy: Arc<dyn Policy>) -> Result<Arc<PolicyEntry>> {
        self.registry.register(policy)
    }

    pub fn unregister(&self, policy: &Arc<dyn Policy>) -> Result<()> {
        self.registry.unregister(policy)
    }

    #[must_use]
    pub fn policies(&self) -> Vec<PolicyInfo> {
        self.registry.list()
    }

    /// Policy for disks without a matching tunable
    #[must_use]
    pub fn default_policy(&self) -> String {
        self.default_policy.read().clone()
    }

    /// Change the default policy; overrides `dsched.policy.default`
    pub fn set_default_policy(&self, name: &str) -> Result<()> {
        if self.registry.find(name).is_none() {
            return Err(Error::PolicyNotFound(name.to_string()));
        }
        *self.default_policy.write() = name.to_string();
        self.default_set.store(true, Ordering::Release);
        info!(policy = name, "default disk scheduler policy set");
        Ok(())
    }

    /// Set a `dsched.policy.<key>` tunable for disks attached later
    pub fn set_tunable(&self, key: &str, policy: &str) {
        self.config.write().set_tunable(key, policy);
    }

    /// Attach a disk
    ///
    /// With an explicit policy the disk is bound to it or the call fails.
    /// Otherwise the first registered policy among the disk name tunable,
    /// the disk head tunable, the `default` tunable and the default policy
    /// is used. A disk without an explicit tag queue depth gets the
    /// configured one.
    pub fn disk_create(&self, disk: Disk, policy: Option<&str>) -> Result<Arc<DiskBinding>> {
        let depth = self.config.read().max_tag_queue_depth;
        let disk = Arc::new(disk.or_max_tag_queue_depth(depth));
        if self.disks.read().contains_key(disk.name()) {
            return Err(Error::DiskExists(disk.name().to_string()));
        }

        let entry = match policy {
            Some(name) => self.registry.acquire(name)?,
            None => self.select_policy(&disk)?,
        };
        let ctx = match entry.policy().prepare(&disk) {
            Ok(ctx) => ctx,
            Err(err) => {
                self.registry.release(&entry);
                return Err(err);
            }
        };
        self.stats.diskctx_allocations.fetch_add(1, Ordering::Relaxed);

        let binding = Arc::new(DiskBinding::new(
            disk.clone(),
            ActivePolicy {
                entry: entry.clone(),
                ctx: ctx.clone(),
                generation: self.next_generation(),
            },
        ));
        match self.disks.write().entry(disk.name().to_string()) {
            Entry::Occupied(_) => {
                ctx.teardown();
                self.registry.release(&entry);
                return Err(Error::DiskExists(disk.name().to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(binding.clone());
            }
        }
        info!(disk = disk.name(), policy = entry.name(), "disk attached to scheduler");
        Ok(binding)
    }

    fn select_policy(&self, disk: &Disk) -> Result<Arc<PolicyEntry>> {
        let mut candidates = Vec::new();
        {
            let config = self.config.read();
            for key in [disk.tunable_name(), disk.tunable_head()] {
                if let Some(policy) = config.tunable(&key) {
                    candidates.push(policy.to_string());
                }
            }
            if !self.default_set.load(Ordering::Acquire)
                && let Some(policy) = config.tunable("default")
            {
                candidates.push(policy.to_string());
            }
        }
        candidates.push(self.default_policy());
        candidates.push(NOOP_POLICY.to_string());

        for name in &candidates {
            match self.registry.acquire(name) {
                Ok(entry) => return Ok(entry),
                Err(_) => debug!(disk = disk.name(), policy = %name, "policy not registered, trying next"),
            }
        }
        Err(Error::PolicyNotFound(self.default_policy()))
    }

    /// Record a disk's serial number and apply the `dsched.policy.<serial>`
    /// tunable if one exists
    pub fn disk_update(&self, name: &str, serial: &str) -> Result<()> {
        let binding = self.find_disk(name).ok_or_else(|| Error::DiskNotFound(name.to_string()))?;
        binding.disk().set_serial(serial);
        let policy = self.config.read().tunable(serial).map(str::to_string);
        match policy {
            Some(policy) => self.switch(name, &policy),
            None => Ok(()),
        }
    }

    /// Detach a disk, cancelling every bio its policy still holds
    pub fn disk_destroy(&self, name: &str) -> Result<()> {
        let binding = self.find_disk(name).ok_or_else(|| Error::DiskNotFound(name.to_string()))?;
        let active = binding.detach()?;
        {
            let mut disks = self.disks.write();
            if disks.get(name).is_some_and(|b| Arc::ptr_eq(b, &binding)) {
                disks.remove(name);
            }
        }

        active.ctx.cancel_all();
        active.ctx.teardown();
        self.registry.release(&active.entry);
        info!(disk = name, policy = active.entry.name(), "disk detached from scheduler");
        Ok(())
    }

    /// Switch a disk to another policy
    ///
    /// On any failure the disk stays bound to its previous policy. Bios
    /// held by the old policy are moved to the new one.
    pub fn switch(&self, name: &str, policy: &str) -> Result<()> {
        let binding = self.find_disk(name).ok_or_else(|| Error::DiskNotFound(name.to_string()))?;
        let entry = self.registry.acquire(policy)?;
        let old = match binding.begin_switch() {
            Ok(old) => old,
            Err(err) => {
                self.registry.release(&entry);
                return Err(err);
            }
        };
        if Arc::ptr_eq(&old.entry, &entry) {
            binding.install(old);
            self.registry.release(&entry);
            return Ok(());
        }

        let ctx = match entry.policy().prepare(binding.disk()) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(disk = name, policy, %err, "policy prepare failed, keeping current policy");
                binding.install(old);
                self.registry.release(&entry);
                return Err(err);
            }
        };
        self.stats.diskctx_allocations.fetch_add(1, Ordering::Relaxed);

        old.ctx.teardown();
        let drained = old.ctx.drain();
        binding.install(ActivePolicy {
            entry,
            ctx,
            generation: self.next_generation(),
        });
        self.registry.release(&old.entry);
        info!(
            disk = name,
            from = old.entry.name(),
            to = policy,
            requeued = drained.len(),
            "disk scheduler policy switched"
        );

        for bio in drained {
            if let Err(rejected) = self.queue_on(&binding, bio) {
                let (err, bio) = rejected.into_parts();
                warn!(disk = name, %err, "requeue after switch failed, dispatching directly");
                binding.disk().strategy_raw(bio);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn find_disk(&self, name: &str) -> Option<Arc<DiskBinding>> {
        self.disks.read().get(name).cloned()
    }

    /// Attached disks in name order
    #[must_use]
    pub fn disks(&self) -> Vec<DiskInfo> {
        self.disks
            .read()
            .values()
            .map(|binding| DiskInfo {
                name: binding.name().to_string(),
                serial: binding.disk().serial(),
                policy: binding.policy_name(),
                generation: binding.generation(),
                queued: binding.queued(),
                in_flight: binding.disk().current_tag_queue_depth(),
            })
            .collect()
    }

    /// Submit a bio to a disk
    ///
    /// A refused bio is handed back inside the error; while the disk is
    /// switching policies the error is retryable.
    pub fn queue(&self, disk: &str, bio: Bio) -> std::result::Result<(), QueueRejected> {
        let Some(binding) = self.find_disk(disk) else {
            return Err(QueueRejected::new(Error::DiskNotFound(disk.to_string()), bio));
        };
        self.queue_on(&binding, bio)
    }

    fn queue_on(&self, binding: &DiskBinding, mut bio: Bio) -> std::result::Result<(), QueueRejected> {
        let outcome = {
            let state = binding.admission();
            let active = match &*state {
                BindingState::Bound(active) => active,
                BindingState::Switching => {
                    return Err(QueueRejected::new(Error::Switching(binding.name().to_string()), bio));
                }
                BindingState::Detached => {
                    return Err(QueueRejected::new(Error::DiskNotFound(binding.name().to_string()), bio));
                }
            };

            if bio.cmd() == BioCmd::Flush {
                active.ctx.flush(bio)
            } else if !active.entry.policy().tracks_threads() {
                QueueOutcome::Passthrough(bio)
            } else if let Some(tdio) = self.tdio_for(&bio, binding.disk(), active) {
                bio.set_dsched(DschedObject {
                    disk: binding.disk().name_arc(),
                    bio: bio.id(),
                    owner: tdio.owner(),
                    tdio: tdio.id(),
                    queued_at: Instant::now(),
                });
                active.ctx.bio_queue(&tdio, bio)
            } else {
                self.stats.no_tdctx.fetch_add(1, Ordering::Relaxed);
                trace!(disk = binding.name(), bio = %bio.id(), "bio without I/O context");
                QueueOutcome::Passthrough(bio)
            }
        };

        match outcome {
            QueueOutcome::Queued => {
                self.stats.policy_queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            QueueOutcome::Passthrough(bio) => {
                self.stats.raw_dispatches.fetch_add(1, Ordering::Relaxed);
                binding.disk().strategy_raw(bio);
                Ok(())
            }
            QueueOutcome::Rejected(bio) => {
                Err(QueueRejected::new(Error::Switching(binding.name().to_string()), bio))
            }
        }
    }

    /// tdio of the bio's owner on this binding, allocated on first use
    fn tdio_for(&self, bio: &Bio, disk: &Disk, active: &ActivePolicy) -> Option<Arc<ThreadIo>> {
        let owner = bio.owner()?;
        let name = disk.name_arc();
        let (tdio, fresh) = owner.tdio_for(&name, active.generation, |weight| {
            self.tracker
                .alloc_tdio(owner.owner(), name.clone(), active.generation, weight)
        })?;
        if fresh {
            active.ctx.new_tdio(&tdio);
        }
        Some(tdio)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Charge a new buffer to the issuer's I/O context
    pub fn new_buf(&self, bio: &mut Bio, issuer: Issuer) {
        let ctx = self.tracker.context_for(issuer);
        bio.set_owner(ctx);
        self.registry.for_each(|entry| entry.policy().new_buf(bio));
    }

    pub fn new_proc(&self, pid: ProcId) -> Arc<ThreadCtx> {
        let ctx = self.tracker.new_proc(pid);
        self.registry.for_each(|entry| entry.policy().new_proc(pid));
        ctx
    }

    pub fn new_thread(&self, tid: ThreadId) -> Arc<ThreadCtx> {
        let ctx = self.tracker.new_thread(tid);
        self.registry.for_each(|entry| entry.policy().new_thread(tid));
        ctx
    }

    pub fn exit_proc(&self, pid: ProcId) {
        let tdios = self.tracker.exit_proc(pid);
        self.release_tdios(&tdios);
        self.registry.for_each(|entry| entry.policy().exit_proc(pid));
    }

    pub fn exit_thread(&self, tid: ThreadId) {
        let tdios = self.tracker.exit_thread(tid);
        self.release_tdios(&tdios);
        self.registry.for_each(|entry| entry.policy().exit_thread(tid));
    }

    /// Unlink exited tdios from the policies still bound to their disks
    fn release_tdios(&self, tdios: &[Arc<ThreadIo>]) {
        for tdio in tdios {
            let Some(binding) = self.find_disk(tdio.disk()) else {
                continue;
            };
            binding.with_active(|active| {
                if active.generation == tdio.generation() {
                    active.ctx.destroy_tdio(tdio);
                }
            });
        }
    }
}

impl std::fmt::Debug for Dsched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dsched")
            .field("default_policy", &self.default_policy())
            .field("policies", &self.registry.len())
            .field("disks", &self.disks.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::BioCompletion;
    use crate::device::QueueDevice;
    use crate::policy::DiskPolicy;
    use dsched_common::{BioStatus, TdioId};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Per-disk context that holds every bio until told otherwise
    #[derive(Default)]
    struct HoldDisk {
        bios: Mutex<VecDeque<Bio>>,
        new_tdios: Mutex<Vec<TdioId>>,
        destroyed: Mutex<Vec<TdioId>>,
        torn_down: AtomicBool,
    }

    impl DiskPolicy for HoldDisk {
        fn teardown(&self) {
            self.torn_down.store(true, Ordering::SeqCst);
        }

        fn cancel_all(&self) {
            let bios: Vec<Bio> = self.bios.lock().drain(..).collect();
            for bio in bios {
                bio.cancel();
            }
        }

        fn drain(&self) -> Vec<Bio> {
            self.bios.lock().drain(..).collect()
        }

        fn bio_queue(&self, _tdio: &Arc<ThreadIo>, bio: Bio) -> QueueOutcome {
            if self.torn_down.load(Ordering::SeqCst) {
                return QueueOutcome::Rejected(bio);
            }
            self.bios.lock().push_back(bio);
            QueueOutcome::Queued
        }

        fn new_tdio(&self, tdio: &Arc<ThreadIo>) {
            self.new_tdios.lock().push(tdio.id());
        }

        fn destroy_tdio(&self, tdio: &ThreadIo) {
            self.destroyed.lock().push(tdio.id());
        }

        fn queued(&self) -> usize {
            self.bios.lock().len()
        }
    }

    struct HoldPolicy {
        name: &'static str,
        fail_prepare: AtomicBool,
        disks: Mutex<Vec<Arc<HoldDisk>>>,
    }

    impl HoldPolicy {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_prepare: AtomicBool::new(false),
                disks: Mutex::new(Vec::new()),
            })
        }

        fn last(&self) -> Arc<HoldDisk> {
            self.disks.lock().last().cloned().unwrap()
        }
    }

    impl Policy for HoldPolicy {
        fn name(&self) -> &str {
            self.name
        }

        fn prepare(&self, _disk: &Arc<Disk>) -> Result<Arc<dyn DiskPolicy>> {
            if self.fail_prepare.load(Ordering::SeqCst) {
                return Err(Error::Internal("prepare failed".into()));
            }
            let ctx = Arc::new(HoldDisk::default());
            self.disks.lock().push(ctx.clone());
            Ok(ctx)
        }
    }

    fn setup() -> (Dsched, Arc<QueueDevice>) {
        (Dsched::new(DschedConfig::default()), Arc::new(QueueDevice::new()))
    }

    fn counted_bio(dsched: &Dsched, tid: u64, log: &Arc<Mutex<Vec<BioCompletion>>>) -> Bio {
        let log = log.clone();
        let mut bio = Bio::read(0, 4096).on_complete(move |c| log.lock().push(c));
        dsched.new_buf(&mut bio, Issuer::kernel_thread(ThreadId(tid)));
        bio
    }

    #[test]
    fn test_noop_is_default_and_passes_through() {
        let (dsched, device) = setup();
        assert_eq!(dsched.policies()[0].name, NOOP_POLICY);

        let binding = dsched.disk_create(Disk::new("da0", device.clone()), None).unwrap();
        assert_eq!(binding.policy_name().as_deref(), Some(NOOP_POLICY));

        let mut bio = Bio::write(0, 512);
        dsched.new_buf(&mut bio, Issuer::process(ProcId(1), ThreadId(1)));
        dsched.queue("da0", bio).unwrap();

        assert_eq!(device.pending(), 1);
        let stats = dsched.stats();
        assert_eq!(stats.raw_dispatches, 1);
        assert_eq!(stats.tdio_allocations, 0);
    }

    #[test]
    fn test_create_with_unknown_policy_fails() {
        let (dsched, device) = setup();
        let err = dsched
            .disk_create(Disk::new("da0", device), Some("missing"))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(dsched.find_disk("da0").is_none());
        assert_eq!(dsched.registry().find(NOOP_POLICY).unwrap().bindings(), 0);
    }

    #[test]
    fn test_duplicate_disk_rejected() {
        let (dsched, device) = setup();
        dsched.disk_create(Disk::new("da0", device.clone()), None).unwrap();
        let err = dsched.disk_create(Disk::new("da0", device), None).unwrap_err();
        assert!(matches!(err, Error::DiskExists(_)));
        assert_eq!(dsched.registry().find(NOOP_POLICY).unwrap().bindings(), 1);
    }

    #[test]
    fn test_tunable_policy_selection() {
        let mut config = DschedConfig::default();
        config.set_tunable("da1", "hold");
        config.set_tunable("ad", "hold");
        config.set_tunable("mapper-root", "unregistered");
        config.set_tunable("default", "other");
        let dsched = Dsched::new(config);
        let device = Arc::new(QueueDevice::new());
        dsched.register(HoldPolicy::new("hold")).unwrap();
        dsched.register(HoldPolicy::new("other")).unwrap();

        let by_name = dsched.disk_create(Disk::new("da1", device.clone()), None).unwrap();
        assert_eq!(by_name.policy_name().as_deref(), Some("hold"));
        let by_head = dsched.disk_create(Disk::new("ad4", device.clone()), None).unwrap();
        assert_eq!(by_head.policy_name().as_deref(), Some("hold"));
        // Unregistered tunable falls through to the default tunable
        let fallthrough = dsched.disk_create(Disk::new("mapper/root", device.clone()), None).unwrap();
        assert_eq!(fallthrough.policy_name().as_deref(), Some("other"));

        // A default set at runtime overrides the default tunable
        dsched.set_default_policy(NOOP_POLICY).unwrap();
        let after = dsched.disk_create(Disk::new("vn0", device), None).unwrap();
        assert_eq!(after.policy_name().as_deref(), Some(NOOP_POLICY));
        assert!(dsched.set_default_policy("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_switch_to_missing_policy_keeps_binding() {
        let (dsched, device) = setup();
        let hold = HoldPolicy::new("hold");
        dsched.register(hold).unwrap();
        let binding = dsched.disk_create(Disk::new("da0", device), Some("hold")).unwrap();
        let generation = binding.generation();

        let err = dsched.switch("da0", "missing").unwrap_err();
        assert!(matches!(err, Error::PolicyNotFound(_)));
        assert_eq!(binding.policy_name().as_deref(), Some("hold"));
        assert_eq!(binding.generation(), generation);
        assert!(dsched.switch("da9", "hold").unwrap_err().is_not_found());
    }

    #[test]
    fn test_switch_failed_prepare_keeps_binding() {
        let (dsched, device) = setup();
        let hold = HoldPolicy::new("hold");
        let broken = HoldPolicy::new("broken");
        broken.fail_prepare.store(true, Ordering::SeqCst);
        dsched.register(hold.clone()).unwrap();
        dsched.register(broken).unwrap();
        let binding = dsched.disk_create(Disk::new("da0", device), Some("hold")).unwrap();

        assert!(dsched.switch("da0", "broken").is_err());
        assert_eq!(binding.policy_name().as_deref(), Some("hold"));
        assert!(!hold.last().torn_down.load(Ordering::SeqCst));
        assert_eq!(dsched.registry().find("broken").unwrap().bindings(), 0);
    }

    #[test]
    fn test_switch_moves_held_bios() {
        let (dsched, device) = setup();
        let a = HoldPolicy::new("a");
        let b = HoldPolicy::new("b");
        dsched.register(a.clone()).unwrap();
        dsched.register(b.clone()).unwrap();
        let binding = dsched.disk_create(Disk::new("da0", device), Some("a")).unwrap();
        let first_generation = binding.generation().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        for tid in 1..=3 {
            dsched.queue("da0", counted_bio(&dsched, tid, &log)).unwrap();
        }
        assert_eq!(binding.queued(), 3);

        dsched.switch("da0", "b").unwrap();
        assert_eq!(binding.policy_name().as_deref(), Some("b"));
        assert!(binding.generation().unwrap() > first_generation);
        assert!(a.last().torn_down.load(Ordering::SeqCst));
        assert_eq!(a.last().queued(), 0);
        assert_eq!(b.last().queued(), 3);
        // Fresh tdios for the new binding generation
        assert_eq!(b.last().new_tdios.lock().len(), 3);
        assert!(log.lock().is_empty(), "no bio completed by the switch");

        assert_eq!(dsched.registry().find("a").unwrap().bindings(), 0);
        assert_eq!(dsched.registry().find("b").unwrap().bindings(), 1);

        // Switching to the bound policy is a no-op
        dsched.switch("da0", "b").unwrap();
        assert_eq!(b.disks.lock().len(), 1);
    }

    #[test]
    fn test_queue_rejected_while_switching() {
        let (dsched, device) = setup();
        dsched.register(HoldPolicy::new("hold")).unwrap();
        let binding = dsched.disk_create(Disk::new("da0", device.clone()), Some("hold")).unwrap();

        let old = binding.begin_switch().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let rejected = dsched.queue("da0", counted_bio(&dsched, 1, &log)).unwrap_err();
        assert!(rejected.is_retryable());
        assert!(matches!(rejected.error(), Error::Switching(_)));

        let err = dsched.switch("da0", NOOP_POLICY).unwrap_err();
        assert!(matches!(err, Error::SwitchInProgress(_)));
        assert!(matches!(dsched.disk_destroy("da0"), Err(Error::SwitchInProgress(_))));

        binding.install(old);
        dsched.queue("da0", rejected.into_bio()).unwrap();
        assert_eq!(binding.queued(), 1);
        assert!(log.lock().is_empty());
        assert_eq!(device.pending(), 0);
    }

    #[test]
    fn test_destroy_cancels_each_bio_once() {
        let (dsched, device) = setup();
        let hold = HoldPolicy::new("hold");
        dsched.register(hold.clone()).unwrap();
        dsched.disk_create(Disk::new("da0", device), Some("hold")).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();
        for tid in 0..5 {
            let bio = counted_bio(&dsched, tid % 2, &log);
            ids.push(bio.id());
            dsched.queue("da0", bio).unwrap();
        }

        dsched.disk_destroy("da0").unwrap();
        let completions = log.lock();
        assert_eq!(completions.len(), 5);
        for id in &ids {
            assert_eq!(completions.iter().filter(|c| c.id == *id).count(), 1);
        }
        assert!(completions.iter().all(|c| c.status == BioStatus::Cancelled && c.resid == 4096));
        drop(completions);

        assert_eq!(hold.last().queued(), 0);
        assert!(hold.last().torn_down.load(Ordering::SeqCst));
        assert!(matches!(dsched.disk_destroy("da0"), Err(Error::DiskNotFound(_))));
        let rejected = dsched.queue("da0", Bio::read(0, 1)).unwrap_err();
        assert!(rejected.error().is_not_found());
    }

    #[test]
    fn test_unregister_refused_while_bound() {
        let (dsched, device) = setup();
        let hold: Arc<dyn Policy> = HoldPolicy::new("hold");
        dsched.register(hold.clone()).unwrap();
        dsched.disk_create(Disk::new("da0", device), Some("hold")).unwrap();

        assert!(matches!(dsched.unregister(&hold), Err(Error::PolicyBusy { .. })));
        dsched.disk_destroy("da0").unwrap();
        dsched.unregister(&hold).unwrap();
        assert!(dsched.registry().find("hold").is_none());
    }

    #[test]
    fn test_bio_without_context_goes_raw() {
        let (dsched, device) = setup();
        dsched.register(HoldPolicy::new("hold")).unwrap();
        let binding = dsched.disk_create(Disk::new("da0", device.clone()), Some("hold")).unwrap();

        dsched.queue("da0", Bio::read(0, 512)).unwrap();
        dsched.queue("da0", Bio::flush()).unwrap();
        assert_eq!(binding.queued(), 0);
        assert_eq!(device.pending(), 2);
        assert_eq!(dsched.stats().no_tdctx, 1);
    }

    #[test]
    fn test_exit_thread_destroys_tdio() {
        let (dsched, device) = setup();
        let hold = HoldPolicy::new("hold");
        dsched.register(hold.clone()).unwrap();
        dsched.disk_create(Disk::new("da0", device.clone()), Some("hold")).unwrap();
        dsched.new_thread(ThreadId(9));

        let log = Arc::new(Mutex::new(Vec::new()));
        let bio = counted_bio(&dsched, 9, &log);
        let ctx = bio.owner().unwrap().clone();
        dsched.queue("da0", bio).unwrap();
        let tdio_id = ctx.tdios()[0].id();

        dsched.exit_thread(ThreadId(9));
        assert_eq!(*hold.last().destroyed.lock(), vec![tdio_id]);
        assert!(ctx.is_dead());

        // Late bios of the dead context bypass the policy
        let mut late = Bio::read(0, 512);
        late.set_owner(ctx);
        dsched.queue("da0", late).unwrap();
        assert_eq!(device.pending(), 1);
        assert_eq!(dsched.stats().nthreads, 0);
    }

    #[test]
    fn test_disk_update_applies_serial_tunable() {
        let mut config = DschedConfig::default();
        config.set_tunable("WD-1234", "hold");
        let dsched = Dsched::new(config);
        dsched.register(HoldPolicy::new("hold")).unwrap();
        let binding = dsched
            .disk_create(Disk::new("da0", Arc::new(QueueDevice::new())), None)
            .unwrap();
        assert_eq!(binding.policy_name().as_deref(), Some(NOOP_POLICY));

        dsched.disk_update("da0", "WD-1234").unwrap();
        assert_eq!(binding.policy_name().as_deref(), Some("hold"));
        assert_eq!(binding.disk().serial().as_deref(), Some("WD-1234"));

        dsched.disk_update("da0", "OTHER").unwrap();
        assert_eq!(binding.policy_name().as_deref(), Some("hold"));
        assert!(dsched.disk_update("da7", "x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_disks_listing() {
        let (dsched, device) = setup();
        dsched.disk_create(Disk::new("da1", device.clone()), None).unwrap();
        dsched
            .disk_create(Disk::new("da0", device).with_serial("S0"), None)
            .unwrap();

        let disks = dsched.disks();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].name, "da0");
        assert_eq!(disks[0].serial.as_deref(), Some("S0"));
        assert_eq!(disks[1].policy.as_deref(), Some(NOOP_POLICY));
    }

    #[test]
    fn test_from_config_applies_depth_and_weight() {
        let mut config = Config::default();
        config.dsched.max_tag_queue_depth = 4;
        config.bfq.default_weight = 3;
        let dsched = Dsched::from_config(&config).unwrap();
        let device = Arc::new(QueueDevice::new());

        let binding = dsched.disk_create(Disk::new("da0", device.clone()), None).unwrap();
        assert_eq!(binding.disk().max_tag_queue_depth(), 4);
        let explicit = dsched
            .disk_create(Disk::new("da1", device).with_max_tag_queue_depth(2), None)
            .unwrap();
        assert_eq!(explicit.disk().max_tag_queue_depth(), 2);

        assert_eq!(dsched.new_thread(ThreadId(1)).weight(), 3);

        config.bfq.default_weight = 0;
        assert!(matches!(Dsched::from_config(&config), Err(Error::InvalidWeight(0))));
    }
}
