//! Budget fair queueing
//!
//! Each thread (tdio) is served for a whole budget at a time: the fair
//! queue picks the next tdio, its bios are dispatched until the budget is
//! used up, the slice times out or the tdio runs dry. A tdio that runs dry
//! before its budget is used may be anticipated: dispatching pauses for a
//! short while in the hope it issues its next bio.
//!
//! ```text
//!   bio_queue ──▶ tdio queue ──▶ FairQueue ──get_next──▶ active tdio
//!                                    ▲                        │
//!                                    └──── expire / requeue ◀─┤
//!                                                             ▼
//!                                              device (request polling)
//! ```
//!
//! Planning happens under the per-disk mutex; bios reach the device only
//! after it is released. Completions feed service back through `bio_done`
//! and trigger the next round through `polling`.

use crate::budget::{BfqTdio, ExpireReason, PeakRate, expire};
use crate::helper::{Helper, TimerTarget};
use crate::wf2q::FairQueue;
use dsched_common::{BfqConfig, BioCmd, Result, TdioId};
use dsched_core::{Bio, BioCompletion, Disk, DiskPolicy, Policy, QueueOutcome, ThreadIo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Registry name of the BFQ policy
pub const BFQ_POLICY: &str = "bfq";

/// The BFQ policy
#[derive(Debug, Clone, Default)]
pub struct BfqPolicy {
    config: BfqConfig,
}

impl BfqPolicy {
    #[must_use]
    pub const fn new(config: BfqConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &BfqConfig {
        &self.config
    }
}

impl Policy for BfqPolicy {
    fn name(&self) -> &str {
        BFQ_POLICY
    }

    fn prepare(&self, disk: &Arc<Disk>) -> Result<Arc<dyn DiskPolicy>> {
        let ctx = BfqDisk::new(disk.clone(), self.config.clone())?;
        Ok(ctx)
    }
}

struct BfqState {
    wf2q: FairQueue<TdioId>,
    tdios: HashMap<TdioId, BfqTdio>,
    active: Option<TdioId>,
    /// Budget left in the active tdio's slice
    remaining: u64,
    /// Anticipated tdio and the epoch of its timer
    blockon: Option<(TdioId, u64)>,
    as_epoch: u64,
    peak: PeakRate,
    as_hits: u64,
    as_misses: u64,
    fake_timeouts: u64,
    closed: bool,
}

impl BfqState {
    fn is_blocked_on(&self, id: TdioId) -> bool {
        self.blockon.is_some_and(|(blocked, _)| blocked == id)
    }

    /// Total weight of tdios with work: queued ones and the active one
    fn backlogged_weight(&self) -> u64 {
        let weight: u64 = self
            .tdios
            .iter()
            .filter(|(id, tdio)| !tdio.queue.is_empty() || self.active == Some(**id))
            .map(|(_, tdio)| u64::from(tdio.entity.weight()))
            .sum();
        weight.max(1)
    }

    /// Every held bio, in service order first
    fn take_all(&mut self) -> Vec<Bio> {
        let mut bios = Vec::new();
        while let Some(id) = self.wf2q.get_next() {
            if let Some(tdio) = self.tdios.get_mut(&id) {
                bios.extend(tdio.queue.drain(..));
            }
        }
        for tdio in self.tdios.values_mut() {
            bios.extend(tdio.queue.drain(..));
        }
        self.active = None;
        self.blockon = None;
        bios
    }
}

/// Put a tdio with pending bios back into the fair queue
fn link(wf2q: &mut FairQueue<TdioId>, id: TdioId, tdio: &mut BfqTdio) {
    if let Err(err) = tdio.entity.set_weight(tdio.tdio.weight()) {
        warn!(tdio = %id, %err, "bfq keeping previous weight");
    }
    if let Err(err) = wf2q.insert(id, &mut tdio.entity) {
        warn!(tdio = %id, %err, "bfq tdio already queued");
    }
}

fn counter(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// BFQ state of one disk
pub struct BfqDisk {
    disk: Arc<Disk>,
    config: BfqConfig,
    state: Mutex<BfqState>,
    helper: Helper,
    /// A dispatch round was requested
    pending: AtomicBool,
    /// A thread is running dispatch rounds
    dispatching: AtomicBool,
    this: Weak<Self>,
}

impl BfqDisk {
    fn new(disk: Arc<Disk>, config: BfqConfig) -> Result<Arc<Self>> {
        let state = BfqState {
            wf2q: FairQueue::new(),
            tdios: HashMap::new(),
            active: None,
            remaining: 0,
            blockon: None,
            as_epoch: 0,
            peak: PeakRate::new(config.max_budget),
            as_hits: 0,
            as_misses: 0,
            fake_timeouts: 0,
            closed: false,
        };
        let ctx = Arc::new_cyclic(|this| Self {
            disk,
            config,
            state: Mutex::new(state),
            helper: Helper::new(),
            pending: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
            this: this.clone(),
        });
        ctx.helper
            .start(&format!("bfq-{}", ctx.disk.name()), Arc::downgrade(&ctx))?;
        info!(disk = ctx.disk.name(), anticipatory = ctx.config.anticipatory, "bfq attached");
        Ok(ctx)
    }

    /// Run dispatch rounds until no more are requested
    ///
    /// Only one thread plans at a time; a request arriving meanwhile is
    /// picked up by that thread before it leaves.
    fn dispatch(&self) {
        self.pending.store(true, Ordering::Release);
        loop {
            if self.dispatching.swap(true, Ordering::AcqRel) {
                return;
            }
            while self.pending.swap(false, Ordering::AcqRel) {
                let planned = self.plan(&mut self.state.lock());
                self.submit(planned);
            }
            self.dispatching.store(false, Ordering::Release);
            if !self.pending.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn submit(&self, planned: Vec<Bio>) {
        if planned.is_empty() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            for bio in planned {
                self.disk.strategy_raw(bio);
            }
            return;
        };
        let policy: Arc<dyn DiskPolicy> = this;
        for bio in planned {
            self.disk.strategy_request_polling(bio, policy.clone());
        }
    }

    /// Pick the bios to send while tag slots are free
    fn plan(&self, state: &mut BfqState) -> Vec<Bio> {
        let mut planned = Vec::new();
        if state.closed || state.blockon.is_some() {
            return planned;
        }
        let config = &self.config;
        let now = Instant::now();

        while self.disk.free_slots() > 0 {
            let Some(id) = state.active else {
                let Some(next) = state.wf2q.get_next() else {
                    trace!(disk = self.disk.name(), "bfq has no eligible tdio");
                    break;
                };
                match state.tdios.get_mut(&next) {
                    Some(tdio) => {
                        tdio.begin_service(now);
                        state.remaining = tdio.entity.budget();
                        state.active = Some(next);
                        trace!(tdio = %next, budget = state.remaining, "bfq tdio selected");
                    }
                    None => warn!(tdio = %next, "bfq queue held an unknown tdio"),
                }
                continue;
            };
            let Some(tdio) = state.tdios.get_mut(&id) else {
                state.active = None;
                continue;
            };

            if tdio.maybe_timeout {
                tdio.entity
                    .update_vd(tdio.entity.budget().saturating_sub(state.remaining));
                expire(tdio, &mut state.peak, config, ExpireReason::Timeout);
                tdio.maybe_timeout = false;
                if !tdio.queue.is_empty() {
                    link(&mut state.wf2q, id, tdio);
                }
                state.active = None;
                continue;
            }

            let front = tdio
                .queue
                .front()
                .map(|bio| (bio.cmd().is_read_write(), bio.size()));
            match front {
                Some((false, _)) => {
                    if !self.disk.try_reserve_tag() {
                        break;
                    }
                    if let Some(bio) = tdio.queue.pop_front() {
                        tdio.bio_dispatched += 1;
                        planned.push(bio);
                    }
                }
                // Out of budget, unless a single bio exceeds a fresh budget
                Some((true, size))
                    if size > state.remaining && state.remaining != tdio.entity.budget() =>
                {
                    tdio.entity
                        .update_vd(tdio.entity.budget().saturating_sub(state.remaining));
                    expire(tdio, &mut state.peak, config, ExpireReason::OutOfBudget);
                    link(&mut state.wf2q, id, tdio);
                    state.active = None;
                }
                Some((true, size)) => {
                    if !self.disk.try_reserve_tag() {
                        break;
                    }
                    if size > state.remaining {
                        tdio.entity.set_budget(size);
                        state.remaining = 0;
                    } else {
                        state.remaining -= size;
                    }
                    if let Some(bio) = tdio.queue.pop_front() {
                        tdio.bio_dispatched += 1;
                        planned.push(bio);
                    }
                    // Normalised by the total backlogged weight, not raw bytes
                    let weight = state.backlogged_weight();
                    state.wf2q.advance_virtual_time(size / weight);
                }
                None => {
                    if state.remaining == 0 || !config.anticipatory || !tdio.as_switch {
                        let used = tdio.entity.budget().saturating_sub(state.remaining);
                        tdio.entity.set_budget(used);
                        tdio.entity.update_vd(used);
                        expire(tdio, &mut state.peak, config, ExpireReason::OutOfBudget);
                        state.active = None;
                    } else {
                        state.as_epoch += 1;
                        state.blockon = Some((id, state.as_epoch));
                        let wait = if tdio.is_seeky(config) {
                            config.t_wait_min()
                        } else {
                            config.t_wait()
                        };
                        self.helper.arm(state.as_epoch, wait);
                        trace!(tdio = %id, ?wait, remaining = state.remaining, "bfq anticipating");
                        break;
                    }
                }
            }
        }
        planned
    }
}

impl TimerTarget for BfqDisk {
    /// The anticipated tdio stayed idle
    fn as_timeout(&self, epoch: u64) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.blockon {
                Some((id, armed)) if armed == epoch => {
                    state.as_misses += 1;
                    state.blockon = None;
                    state.active = None;
                    if let Some(tdio) = state.tdios.get_mut(&id) {
                        tdio.entity
                            .update_vd(tdio.entity.budget().saturating_sub(state.remaining));
                        let reason = if tdio.maybe_timeout {
                            ExpireReason::Timeout
                        } else {
                            ExpireReason::TooIdle
                        };
                        expire(tdio, &mut state.peak, &self.config, reason);
                        if !tdio.queue.is_empty() {
                            link(&mut state.wf2q, id, tdio);
                        }
                    }
                }
                _ => {
                    state.fake_timeouts += 1;
                    trace!(disk = self.disk.name(), epoch, "bfq fake anticipation timeout");
                }
            }
        }
        self.dispatch();
    }
}

impl DiskPolicy for BfqDisk {
    fn teardown(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.blockon = None;
        }
        self.helper.kill();
        debug!(disk = self.disk.name(), "bfq torn down");
    }

    fn cancel_all(&self) {
        let bios = self.state.lock().take_all();
        if !bios.is_empty() {
            info!(disk = self.disk.name(), count = bios.len(), "bfq cancelling queued bios");
        }
        for bio in bios {
            bio.cancel();
        }
    }

    fn drain(&self) -> Vec<Bio> {
        self.state.lock().take_all()
    }

    fn bio_queue(&self, tdio: &Arc<ThreadIo>, bio: Bio) -> QueueOutcome {
        if bio.cmd() == BioCmd::Flush {
            return QueueOutcome::Passthrough(bio);
        }
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return QueueOutcome::Rejected(bio);
            }
            let id = tdio.id();
            // Released concurrently; its slot is gone or about to be
            if tdio.is_retired() {
                trace!(tdio = %id, "bfq tdio retired, passing through");
                return QueueOutcome::Passthrough(bio);
            }
            let entry = match state.tdios.entry(id) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => match BfqTdio::new(tdio.clone(), self.config.min_budget) {
                    Ok(new) => e.insert(new),
                    Err(err) => {
                        warn!(tdio = %id, %err, "bfq cannot schedule tdio, passing through");
                        return QueueOutcome::Passthrough(bio);
                    }
                },
            };
            entry.record_push(&bio, Instant::now(), &self.config);
            let was_empty = entry.queue.is_empty();
            entry.queue.push_back(bio);

            if was_empty {
                if state.active != Some(id) {
                    link(&mut state.wf2q, id, entry);
                } else if state.is_blocked_on(id) {
                    state.as_hits += 1;
                    state.blockon = None;
                    self.helper.disarm();
                    trace!(tdio = %id, "bfq anticipation hit");
                }
            }
        }
        self.dispatch();
        QueueOutcome::Queued
    }

    fn new_tdio(&self, tdio: &Arc<ThreadIo>) {
        let mut state = self.state.lock();
        if tdio.is_retired() {
            return;
        }
        if let Entry::Vacant(e) = state.tdios.entry(tdio.id()) {
            match BfqTdio::new(tdio.clone(), self.config.min_budget) {
                Ok(new) => {
                    e.insert(new);
                }
                Err(err) => warn!(tdio = %tdio.id(), %err, "bfq cannot schedule tdio"),
            }
        }
    }

    fn destroy_tdio(&self, tdio: &ThreadIo) {
        let id = tdio.id();
        let orphans = {
            let mut state = self.state.lock();
            state.wf2q.remove(&id);
            if state.active == Some(id) {
                state.active = None;
                state.remaining = 0;
            }
            if state.is_blocked_on(id) {
                state.blockon = None;
                self.helper.disarm();
            }
            state
                .tdios
                .remove(&id)
                .map(|t| t.queue)
                .unwrap_or_default()
        };
        debug!(disk = self.disk.name(), tdio = %id, orphans = orphans.len(), "bfq tdio destroyed");
        for bio in orphans {
            self.disk.strategy_raw(bio);
        }
        self.dispatch();
    }

    fn bio_done(&self, completion: &BioCompletion) {
        let Some(object) = &completion.dsched else {
            return;
        };
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(tdio) = state.tdios.get_mut(&object.tdio) else {
            return;
        };
        tdio.bio_completed += 1;
        if state.active != Some(object.tdio) {
            return;
        }

        let now = Instant::now();
        tdio.service_received = tdio.service_received.saturating_add(completion.size);
        tdio.last_done = Some(now);
        if !tdio.maybe_timeout
            && now.saturating_duration_since(tdio.service_start) >= self.config.slice_timeout()
        {
            tdio.maybe_timeout = true;
            trace!(tdio = %object.tdio, "bfq slice may time out");
        }
    }

    fn polling(&self) {
        self.dispatch();
    }

    fn queued(&self) -> usize {
        self.state.lock().tdios.values().map(|t| t.queue.len()).sum()
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        let state = self.state.lock();
        vec![
            ("as_hits", state.as_hits),
            ("as_misses", state.as_misses),
            ("as_fake_timeouts", state.fake_timeouts),
            ("peak_rate", state.peak.rate),
            ("max_budget", state.peak.max_budget),
            ("tdios", counter(state.tdios.len())),
            ("queued", counter(state.tdios.values().map(|t| t.queue.len()).sum())),
            ("virtual_time", state.wf2q.virtual_time()),
        ]
    }
}
