//! Policy registry
//!
//! Global table of named policies in registration order. A policy object
//! may register more than once under its name (each registration is
//! counted); a different object claiming a taken name is a conflict.
//! Disk bindings are counted separately and keep a policy from being
//! removed.

use crate::policy::Policy;
use dsched_common::{Error, PolicyId, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// A registered policy
pub struct PolicyEntry {
    id: PolicyId,
    policy: Arc<dyn Policy>,
    registrations: AtomicUsize,
    bindings: AtomicUsize,
}

impl PolicyEntry {
    #[must_use]
    pub const fn id(&self) -> PolicyId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.policy.name()
    }

    #[must_use]
    pub const fn policy(&self) -> &Arc<dyn Policy> {
        &self.policy
    }

    /// Number of outstanding registrations
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.registrations.load(Ordering::Acquire)
    }

    /// Number of disks bound to this policy
    #[must_use]
    pub fn bindings(&self) -> usize {
        self.bindings.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn info(&self) -> PolicyInfo {
        PolicyInfo {
            id: self.id,
            name: self.name().to_string(),
            ref_count: self.ref_count(),
            bindings: self.bindings(),
        }
    }
}

impl std::fmt::Debug for PolicyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEntry")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("registrations", &self.ref_count())
            .field("bindings", &self.bindings())
            .finish()
    }
}

/// Listing row for management tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyInfo {
    pub id: PolicyId,
    pub name: String,
    pub ref_count: usize,
    pub bindings: usize,
}

fn same_policy(a: &Arc<dyn Policy>, b: &Arc<dyn Policy>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Table of registered policies
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    entries: RwLock<Vec<Arc<PolicyEntry>>>,
    next_id: AtomicU32,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy under its name
    ///
    /// Re-registering the same object increments its reference count.
    /// Fails with [`Error::PolicyConflict`] if another object owns the name;
    /// the registry is unchanged on failure.
    pub fn register(&self, policy: Arc<dyn Policy>) -> Result<Arc<PolicyEntry>> {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter().find(|e| e.name() == policy.name()) {
            if !same_policy(&entry.policy, &policy) {
                warn!(policy = policy.name(), "refusing conflicting policy registration");
                return Err(Error::PolicyConflict(policy.name().to_string()));
            }
            let refs = entry.registrations.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(policy = entry.name(), refs, "policy registered again");
            return Ok(entry.clone());
        }

        let entry = Arc::new(PolicyEntry {
            id: PolicyId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            policy,
            registrations: AtomicUsize::new(1),
            bindings: AtomicUsize::new(0),
        });
        info!(policy = entry.name(), id = %entry.id, "policy registered");
        entries.push(entry.clone());
        Ok(entry)
    }

    /// Drop one registration of a policy
    ///
    /// The entry disappears with its last registration. That last
    /// registration cannot be dropped while a disk is bound to the policy.
    pub fn unregister(&self, policy: &Arc<dyn Policy>) -> Result<()> {
        let mut entries = self.entries.write();
        let Some(pos) = entries.iter().position(|e| e.name() == policy.name()) else {
            return Err(Error::PolicyNotFound(policy.name().to_string()));
        };
        let entry = &entries[pos];
        if !same_policy(&entry.policy, policy) {
            return Err(Error::PolicyConflict(policy.name().to_string()));
        }

        if entry.ref_count() > 1 {
            entry.registrations.fetch_sub(1, Ordering::AcqRel);
            debug!(policy = entry.name(), refs = entry.ref_count(), "policy registration dropped");
            return Ok(());
        }
        let bindings = entry.bindings();
        if bindings > 0 {
            return Err(Error::PolicyBusy {
                name: entry.name().to_string(),
                bindings,
            });
        }

        let entry = entries.remove(pos);
        entry.registrations.store(0, Ordering::Release);
        info!(policy = entry.name(), "policy unregistered");
        Ok(())
    }

    /// Look up a policy by name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<PolicyEntry>> {
        self.entries.read().iter().find(|e| e.name() == name).cloned()
    }

    /// The entry registered after `cursor`, or the first one for `None`
    ///
    /// Entries registered or removed between calls may be skipped; use
    /// [`PolicyRegistry::for_each`] or [`PolicyRegistry::list`] for a
    /// consistent walk.
    #[must_use]
    pub fn enumerate(&self, cursor: Option<PolicyId>) -> Option<Arc<PolicyEntry>> {
        let entries = self.entries.read();
        match cursor {
            None => entries.first().cloned(),
            Some(id) => entries.iter().find(|e| e.id > id).cloned(),
        }
    }

    /// Walk every entry in registration order under the registry lock
    pub fn for_each(&self, mut f: impl FnMut(&Arc<PolicyEntry>)) {
        for entry in self.entries.read().iter() {
            f(entry);
        }
    }

    /// Consistent snapshot in registration order
    #[must_use]
    pub fn list(&self) -> Vec<PolicyInfo> {
        self.entries.read().iter().map(|e| e.info()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Look up a policy and count a disk binding against it
    pub(crate) fn acquire(&self, name: &str) -> Result<Arc<PolicyEntry>> {
        let entries = self.entries.read();
        let entry = entries
            .iter()
            .find(|e| e.name() == name)
            .ok_or_else(|| Error::PolicyNotFound(name.to_string()))?;
        entry.bindings.fetch_add(1, Ordering::AcqRel);
        Ok(entry.clone())
    }

    /// Drop a disk binding taken with `acquire`
    pub(crate) fn release(&self, entry: &PolicyEntry) {
        let _entries = self.entries.read();
        let prev = entry.bindings.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "policy binding released twice");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bio::Bio;
    use crate::context::ThreadIo;
    use crate::disk::Disk;
    use crate::policy::{DiskPolicy, QueueOutcome};

    /// Policy that passes everything through, named at will
    pub(crate) struct NamedPolicy(pub &'static str);

    struct PassDisk;

    impl DiskPolicy for PassDisk {
        fn teardown(&self) {}
        fn cancel_all(&self) {}
        fn bio_queue(&self, _tdio: &Arc<ThreadIo>, bio: Bio) -> QueueOutcome {
            QueueOutcome::Passthrough(bio)
        }
    }

    impl Policy for NamedPolicy {
        fn name(&self) -> &str {
            self.0
        }

        fn prepare(&self, _disk: &Arc<Disk>) -> Result<Arc<dyn DiskPolicy>> {
            Ok(Arc::new(PassDisk))
        }
    }

    #[test]
    fn test_register_idempotent_for_same_ops() {
        let registry = PolicyRegistry::new();
        let ops_a: Arc<dyn Policy> = Arc::new(NamedPolicy("bfq"));

        let first = registry.register(ops_a.clone()).unwrap();
        let second = registry.register(ops_a.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_conflict_leaves_registry_unchanged() {
        let registry = PolicyRegistry::new();
        let ops_a: Arc<dyn Policy> = Arc::new(NamedPolicy("bfq"));
        let ops_b: Arc<dyn Policy> = Arc::new(NamedPolicy("bfq"));

        registry.register(ops_a.clone()).unwrap();
        let err = registry.register(ops_b.clone()).unwrap_err();
        assert!(matches!(err, Error::PolicyConflict(ref name) if name == "bfq"));

        let entry = registry.find("bfq").unwrap();
        assert!(same_policy(entry.policy(), &ops_a));
        assert_eq!(entry.ref_count(), 1);
        assert!(matches!(registry.unregister(&ops_b), Err(Error::PolicyConflict(_))));
    }

    #[test]
    fn test_unregister_counts_down_and_refuses_bound() {
        let registry = PolicyRegistry::new();
        let ops: Arc<dyn Policy> = Arc::new(NamedPolicy("fq"));
        registry.register(ops.clone()).unwrap();
        registry.register(ops.clone()).unwrap();

        let entry = registry.acquire("fq").unwrap();
        registry.unregister(&ops).unwrap();
        assert_eq!(entry.ref_count(), 1);

        let err = registry.unregister(&ops).unwrap_err();
        assert!(matches!(err, Error::PolicyBusy { bindings: 1, .. }));
        assert!(registry.find("fq").is_some());

        registry.release(&entry);
        registry.unregister(&ops).unwrap();
        assert!(registry.find("fq").is_none());
        assert!(matches!(registry.unregister(&ops), Err(Error::PolicyNotFound(_))));
    }

    #[test]
    fn test_enumerate_in_insertion_order() {
        let registry = PolicyRegistry::new();
        for name in ["noop", "bfq", "fq"] {
            registry.register(Arc::new(NamedPolicy(name))).unwrap();
        }

        let mut names = Vec::new();
        let mut cursor = None;
        while let Some(entry) = registry.enumerate(cursor) {
            names.push(entry.name().to_string());
            cursor = Some(entry.id());
        }
        assert_eq!(names, ["noop", "bfq", "fq"]);

        let mut walked = Vec::new();
        registry.for_each(|e| walked.push(e.name().to_string()));
        assert_eq!(walked, names);
        assert_eq!(registry.list()[1].name, "bfq");
    }

    #[test]
    fn test_acquire_unknown_policy() {
        let registry = PolicyRegistry::new();
        assert!(matches!(registry.acquire("missing"), Err(Error::PolicyNotFound(_))));
    }
}
