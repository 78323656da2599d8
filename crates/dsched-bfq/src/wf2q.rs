//! B-WF2Q+ fair queue
//!
//! Each queued context gets a virtual eligible time `ve` and a virtual
//! deadline `vd = ve + budget / weight`. `get_next` serves the eligible
//! context (`ve <= virtual_time`) with the earliest deadline; when nothing is
//! eligible the virtual clock jumps to the smallest `ve`.
//!
//! Virtual times are integers. The truncating division is part of the
//! accounting and keeps the ordering deterministic. Sums saturate at
//! `u64::MAX`, so a huge budget only pushes its context to the back.

use crate::augtree::AugmentedFairTree;
use dsched_common::{Error, Result};
use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroU32;

/// Scheduling state of one context
///
/// The entity belongs to its context, not to the queue. The queue copies
/// `ve`/`vd` into the tree on insert, so `update_vd` is only meaningful while
/// the entity is not linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wf2qEntity {
    ve: u64,
    vd: u64,
    budget: u64,
    weight: NonZeroU32,
}

impl Wf2qEntity {
    /// Create an entity; a zero weight is rejected
    pub fn new(budget: u64, weight: u32) -> Result<Self> {
        Ok(Self {
            ve: 0,
            vd: 0,
            budget,
            weight: NonZeroU32::new(weight).ok_or(Error::InvalidWeight(weight))?,
        })
    }

    #[must_use]
    pub const fn ve(&self) -> u64 {
        self.ve
    }

    #[must_use]
    pub const fn vd(&self) -> u64 {
        self.vd
    }

    #[must_use]
    pub const fn budget(&self) -> u64 {
        self.budget
    }

    #[must_use]
    pub const fn weight(&self) -> u32 {
        self.weight.get()
    }

    pub const fn set_budget(&mut self, budget: u64) {
        self.budget = budget;
    }

    pub fn set_weight(&mut self, weight: u32) -> Result<()> {
        self.weight = NonZeroU32::new(weight).ok_or(Error::InvalidWeight(weight))?;
        Ok(())
    }

    /// Charge the service actually received in this round
    pub fn update_vd(&mut self, service: u64) {
        self.vd = self.ve.saturating_add(service / u64::from(self.weight.get()));
    }
}

/// Fair queue of contexts keyed by `K`
#[derive(Debug)]
pub struct FairQueue<K> {
    tree: AugmentedFairTree<K>,
    linked: HashMap<K, usize>,
    virtual_time: u64,
    next_seq: u64,
}

impl<K: Copy + Eq + Hash> Default for FairQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash> FairQueue<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: AugmentedFairTree::new(),
            linked: HashMap::new(),
            virtual_time: 0,
            next_seq: 0,
        }
    }

    /// Number of linked contexts
    #[must_use]
    pub const fn len(&self) -> usize {
        self.tree.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.linked.contains_key(key)
    }

    #[must_use]
    pub const fn virtual_time(&self) -> u64 {
        self.virtual_time
    }

    /// Advance the virtual clock by the service just handed out
    pub const fn advance_virtual_time(&mut self, delta: u64) {
        self.virtual_time = self.virtual_time.saturating_add(delta);
    }

    /// Link a context
    ///
    /// The context may not become eligible before its previous deadline:
    /// `ve = max(virtual_time, vd)`, then `vd = ve + budget / weight`.
    pub fn insert(&mut self, key: K, entity: &mut Wf2qEntity) -> Result<()> {
        if self.linked.contains_key(&key) {
            return Err(Error::AlreadyQueued);
        }
        entity.ve = self.virtual_time.max(entity.vd);
        entity.vd = entity
            .ve
            .saturating_add(entity.budget / u64::from(entity.weight.get()));

        let seq = self.next_seq;
        self.next_seq += 1;
        let idx = self.tree.insert(key, entity.ve, entity.vd, seq);
        self.linked.insert(key, idx);
        Ok(())
    }

    /// Unlink a context; returns whether it was linked
    pub fn remove(&mut self, key: &K) -> bool {
        match self.linked.remove(key) {
            Some(idx) => {
                self.tree.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Unlink and return the eligible context with the earliest deadline
    ///
    /// Never fails on a non-empty queue: if nothing is eligible the virtual
    /// clock is moved to the smallest eligible time and the search repeats.
    pub fn get_next(&mut self) -> Option<K> {
        let idx = match self.tree.eligible_min_vd(self.virtual_time) {
            Some(idx) => idx,
            None => {
                let first = self.tree.leftmost()?;
                let (ve, _) = self.tree.times(first);
                self.virtual_time = self.virtual_time.max(ve);
                self.tree.eligible_min_vd(self.virtual_time)?
            }
        };
        let key = self.tree.remove(idx);
        self.linked.remove(&key);
        Some(key)
    }

    /// Deadline a linked context was queued with
    #[must_use]
    pub fn queued_times(&self, key: &K) -> Option<(u64, u64)> {
        self.linked.get(key).map(|&idx| self.tree.times(idx))
    }

    #[cfg(test)]
    pub(crate) fn validate(&self) {
        self.tree.validate();
        assert_eq!(self.linked.len(), self.tree.len());
        for (key, &idx) in &self.linked {
            assert!(self.tree.key(idx) == key, "index points at a foreign node");
        }
    }
}
