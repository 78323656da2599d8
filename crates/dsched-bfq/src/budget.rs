//! Per-thread BFQ state and budget feedback
//!
//! When a thread's service slice ends it is "expired" and gets a new budget
//! depending on why the slice ended:
//!
//! | reason        | new budget                                        |
//! |---------------|---------------------------------------------------|
//! | `Timeout`     | service received in the slice, at least min       |
//! | `TooIdle`     | min, or service received if bios are in flight   |
//! | `OutOfBudget` | doubled below the threshold, else one step more   |
//!
//! Rates are bytes per microsecond in fixed point with `FIXPOINT_SHIFT`
//! fractional bits.

use crate::wf2q::Wf2qEntity;
use dsched_common::{BfqConfig, Result};
use dsched_core::{Bio, ThreadIo};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const FIXPOINT_SHIFT: u32 = 10;

/// Slices shorter than this say nothing about a thread's speed
const MIN_SLOW_SAMPLE: Duration = Duration::from_millis(20);

/// Slices shorter than this say nothing about the disk's speed
const MIN_RATE_SAMPLE: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpireReason {
    Timeout,
    TooIdle,
    OutOfBudget,
}

/// Exponentially weighted average with 1/8 decay
///
/// The first sample only primes the average.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Ewma {
    samples: u64,
    total: u64,
    avg: u64,
}

impl Ewma {
    pub(crate) fn sample(&mut self, value: u64) {
        if self.samples == 0 {
            self.samples = 1;
            return;
        }
        self.samples = (7 * self.samples + 256) / 8;
        self.total = self
            .total
            .saturating_mul(7)
            .saturating_add(value.saturating_mul(256))
            / 8;
        self.avg = (self.total + self.samples / 2) / self.samples;
    }

    pub(crate) const fn samples(&self) -> u64 {
        self.samples
    }

    pub(crate) const fn avg(&self) -> u64 {
        self.avg
    }
}

/// BFQ's view of one tdio
pub(crate) struct BfqTdio {
    pub(crate) tdio: Arc<ThreadIo>,
    pub(crate) entity: Wf2qEntity,
    pub(crate) queue: VecDeque<Bio>,
    pub(crate) service_received: u64,
    pub(crate) service_start: Instant,
    pub(crate) last_done: Option<Instant>,
    last_pushed: Option<Instant>,
    /// The slice ran out while bios were in flight
    pub(crate) maybe_timeout: bool,
    /// Anticipation is worthwhile for this thread
    pub(crate) as_switch: bool,
    pub(crate) bio_dispatched: u64,
    pub(crate) bio_completed: u64,
    seek: Ewma,
    last_seek_end: u64,
    think_time: Ewma,
}

impl BfqTdio {
    pub(crate) fn new(tdio: Arc<ThreadIo>, budget: u64) -> Result<Self> {
        let entity = Wf2qEntity::new(budget, tdio.weight())?;
        Ok(Self {
            tdio,
            entity,
            queue: VecDeque::new(),
            service_received: 0,
            service_start: Instant::now(),
            last_done: None,
            last_pushed: None,
            maybe_timeout: false,
            as_switch: true,
            bio_dispatched: 0,
            bio_completed: 0,
            seek: Ewma::default(),
            last_seek_end: 0,
            think_time: Ewma::default(),
        })
    }

    /// Update seek and think-time statistics for a bio about to be queued
    pub(crate) fn record_push(&mut self, bio: &Bio, now: Instant, config: &BfqConfig) {
        if bio.cmd().is_read_write() {
            self.seek.sample(bio.offset().abs_diff(self.last_seek_end));
            self.last_seek_end = bio.offset().saturating_add(bio.size());
        }

        // Think time from the previous push; completions from an older
        // slice make the sample meaningless
        let stale = self.last_done.is_some_and(|done| done < self.service_start);
        match self.last_pushed {
            Some(pushed) if !stale => {
                let usec = now.saturating_duration_since(pushed).as_micros();
                self.think_time.sample(u64::try_from(usec).unwrap_or(u64::MAX));
            }
            None => self.think_time.sample(0),
            Some(_) => {}
        }
        self.last_pushed = Some(now);

        let thinks_too_long = self.think_time.samples() > config.valid_min_samples
            && self.think_time.avg() > config.t_wait_us
            && self.service_received > self.entity.budget() / 8;
        self.as_switch = !thinks_too_long;
    }

    pub(crate) const fn seek_valid(&self, config: &BfqConfig) -> bool {
        self.seek.samples() >= config.valid_min_samples
    }

    pub(crate) const fn is_seeky(&self, config: &BfqConfig) -> bool {
        self.seek_valid(config) && self.seek.avg() > config.seek_threshold
    }

    pub(crate) const fn in_flight(&self) -> u64 {
        self.bio_dispatched.saturating_sub(self.bio_completed)
    }

    /// Start a service slice
    pub(crate) const fn begin_service(&mut self, now: Instant) {
        self.service_received = 0;
        self.service_start = now;
        self.maybe_timeout = false;
    }

    /// Time from slice start to the last completion in the slice
    fn slice_elapsed(&self) -> Option<Duration> {
        self.last_done?.checked_duration_since(self.service_start)
    }
}

/// Peak disk rate estimator and the max budget derived from it
#[derive(Debug, Clone)]
pub(crate) struct PeakRate {
    pub(crate) rate: u64,
    samples: u64,
    pub(crate) max_budget: u64,
}

impl PeakRate {
    pub(crate) const fn new(max_budget: u64) -> Self {
        Self {
            rate: 0,
            samples: 0,
            max_budget,
        }
    }

    fn update(&mut self, tdio: &BfqTdio, config: &BfqConfig) {
        let Some(elapsed) = tdio.slice_elapsed() else {
            return;
        };
        if elapsed < MIN_RATE_SAMPLE || elapsed > config.slice_timeout() {
            return;
        }
        let usec = micros(elapsed);
        let rate = fixpoint(tdio.service_received) / usec;
        self.rate = rate.saturating_add(self.rate.saturating_mul(7)) / 8;
        self.samples += 1;

        if self.samples > config.valid_min_samples {
            self.samples = config.valid_min_samples;
            if config.auto_max_budget {
                let slice_us = micros(config.slice_timeout());
                self.max_budget = (slice_us.saturating_mul(self.rate) >> FIXPOINT_SHIFT).max(config.min_budget);
                debug!(max_budget = self.max_budget, peak_rate = self.rate, "bfq max budget updated");
            }
        }
    }
}

const fn fixpoint(value: u64) -> u64 {
    value.saturating_mul(1 << FIXPOINT_SHIFT)
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX).max(1)
}

/// A thread is slow if at its speed so far it would not use 2/3 of its
/// budget within a slice
fn is_slow(tdio: &BfqTdio, config: &BfqConfig) -> bool {
    let Some(elapsed) = tdio.slice_elapsed() else {
        return false;
    };
    if elapsed < MIN_SLOW_SAMPLE {
        return false;
    }
    // Widened so huge budgets cannot overflow
    let expect = u128::from(tdio.service_received) * u128::from(micros(config.slice_timeout()))
        / u128::from(micros(elapsed));
    expect.saturating_mul(3) < u128::from(tdio.entity.budget()) * 2
}

/// End the tdio's slice and assign its next budget
pub(crate) fn expire(tdio: &mut BfqTdio, peak: &mut PeakRate, config: &BfqConfig, reason: ExpireReason) {
    let service = tdio.service_received;
    let budget = tdio.entity.budget();
    let budget_left = budget.saturating_sub(service);
    let rate_sample = tdio.seek_valid(config) && !tdio.is_seeky(config);

    let next = match reason {
        ExpireReason::Timeout => {
            if rate_sample {
                peak.update(tdio, config);
            }
            service.max(config.min_budget)
        }
        ExpireReason::TooIdle => {
            if is_slow(tdio, config) {
                tdio.entity.update_vd(budget_left);
            }
            if tdio.in_flight() > 0 {
                service.max(config.min_budget)
            } else {
                config.min_budget
            }
        }
        ExpireReason::OutOfBudget => {
            if rate_sample {
                peak.update(tdio, config);
            }
            if budget < config.budget_multiple_threshold {
                peak.max_budget.min(budget.saturating_mul(2))
            } else {
                peak.max_budget.min(budget.saturating_add(config.budget_inc_step))
            }
        }
    };
    debug!(
        tdio = %tdio.tdio.id(),
        ?reason,
        service,
        budget = next,
        "bfq tdio expired"
    );
    tdio.entity.set_budget(next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsched_common::{IoOwner, ThreadId};
    use dsched_core::IoContextTracker;

    fn tdio(budget: u64) -> BfqTdio {
        let tracker = IoContextTracker::new(Arc::default());
        let tdio = tracker.alloc_tdio(IoOwner::Thread(ThreadId(1)), Arc::from("da0"), 1, 1);
        BfqTdio::new(tdio, budget).unwrap()
    }

    fn config() -> BfqConfig {
        BfqConfig {
            min_budget: 1000,
            max_budget: 64_000,
            budget_multiple_threshold: 8000,
            budget_inc_step: 2000,
            ..BfqConfig::default()
        }
    }

    #[test]
    fn test_ewma_first_sample_primes() {
        let mut avg = Ewma::default();
        avg.sample(1_000_000);
        assert_eq!(avg.samples(), 1);
        assert_eq!(avg.avg(), 0);

        avg.sample(800);
        assert_eq!(avg.samples(), 32);
        assert_eq!(avg.avg(), 800);

        for _ in 0..64 {
            avg.sample(100);
        }
        assert!(avg.samples() > 200);
        assert!((100..=110).contains(&avg.avg()));
    }

    #[test]
    fn test_out_of_budget_grows_budget() {
        let config = config();
        let mut peak = PeakRate::new(config.max_budget);

        let mut t = tdio(4000);
        expire(&mut t, &mut peak, &config, ExpireReason::OutOfBudget);
        assert_eq!(t.entity.budget(), 8000, "doubled below threshold");
        expire(&mut t, &mut peak, &config, ExpireReason::OutOfBudget);
        assert_eq!(t.entity.budget(), 10_000, "stepped above threshold");

        let mut t = tdio(63_000);
        expire(&mut t, &mut peak, &config, ExpireReason::OutOfBudget);
        assert_eq!(t.entity.budget(), 64_000, "capped at max budget");
    }

    #[test]
    fn test_timeout_and_too_idle_budgets() {
        let config = config();
        let mut peak = PeakRate::new(config.max_budget);

        let mut t = tdio(20_000);
        t.service_received = 5000;
        expire(&mut t, &mut peak, &config, ExpireReason::Timeout);
        assert_eq!(t.entity.budget(), 5000);

        t.service_received = 10;
        expire(&mut t, &mut peak, &config, ExpireReason::Timeout);
        assert_eq!(t.entity.budget(), config.min_budget);

        let mut t = tdio(20_000);
        t.service_received = 3000;
        t.bio_dispatched = 2;
        t.bio_completed = 1;
        expire(&mut t, &mut peak, &config, ExpireReason::TooIdle);
        assert_eq!(t.entity.budget(), 3000, "bios in flight keep received service");

        t.bio_completed = 2;
        expire(&mut t, &mut peak, &config, ExpireReason::TooIdle);
        assert_eq!(t.entity.budget(), config.min_budget);
    }

    #[test]
    fn test_slow_tdio_detection() {
        let config = config();
        let mut t = tdio(30_000);
        let start = Instant::now();
        t.begin_service(start);
        t.last_done = Some(start + Duration::from_millis(10));
        t.service_received = 1;
        assert!(!is_slow(&t, &config), "too short to judge");

        // 50 bytes in 50ms extrapolates to 100 bytes per 100ms slice
        t.last_done = Some(start + Duration::from_millis(50));
        t.service_received = 50;
        assert!(is_slow(&t, &config));

        // 30000 bytes in 50ms keeps up with the budget
        t.service_received = 30_000;
        assert!(!is_slow(&t, &config));
    }

    #[test]
    fn test_huge_budgets_saturate() {
        let config = BfqConfig {
            max_budget: u64::MAX,
            budget_multiple_threshold: u64::MAX,
            ..config()
        };
        let mut peak = PeakRate::new(config.max_budget);

        let mut t = tdio(u64::MAX);
        let start = Instant::now();
        t.begin_service(start);
        t.last_done = Some(start + Duration::from_millis(50));
        t.service_received = u64::MAX;
        assert!(!is_slow(&t, &config));

        expire(&mut t, &mut peak, &config, ExpireReason::OutOfBudget);
        assert_eq!(t.entity.budget(), u64::MAX);

        // Doubled below the threshold
        let mut t = tdio(u64::MAX / 2 + 1);
        expire(&mut t, &mut peak, &config, ExpireReason::OutOfBudget);
        assert_eq!(t.entity.budget(), u64::MAX);
    }

    #[test]
    fn test_peak_rate_sets_max_budget() {
        let config = BfqConfig {
            valid_min_samples: 2,
            ..config()
        };
        let mut peak = PeakRate::new(config.max_budget);
        let mut t = tdio(10_000);
        let start = Instant::now();
        t.begin_service(start);
        t.last_done = Some(start + Duration::from_millis(10));
        t.service_received = 10_240;

        // Absurd samples are ignored
        let mut short = tdio(10_000);
        short.begin_service(start);
        short.last_done = Some(start + Duration::from_micros(500));
        short.service_received = 10_240;
        peak.update(&short, &config);
        assert_eq!(peak.rate, 0);

        for _ in 0..3 {
            peak.update(&t, &config);
        }
        assert!(peak.rate > 0);
        // rate is in 1/1024 bytes per microsecond; 100ms slice
        assert_eq!(peak.max_budget, ((100_000 * peak.rate) >> FIXPOINT_SHIFT).max(config.min_budget));
    }

    #[test]
    fn test_seeky_detection() {
        let config = BfqConfig {
            valid_min_samples: 3,
            seek_threshold: 4096,
            ..config()
        };
        let mut t = tdio(10_000);
        let now = Instant::now();
        for i in 0..8u64 {
            t.record_push(&Bio::read(i << 30, 512), now, &config);
        }
        assert!(t.is_seeky(&config));

        let mut t = tdio(10_000);
        let mut offset = 0;
        for _ in 0..8 {
            t.record_push(&Bio::read(offset, 512), now, &config);
            offset += 512;
        }
        assert!(t.seek_valid(&config));
        assert!(!t.is_seeky(&config));
    }
}
