//! Configuration types for dsched
//!
//! Configuration is read from a toml file. Every section has defaults, so an
//! empty file yields a working noop setup:
//!
//! ```toml
//! [dsched]
//! default_policy = "bfq"
//!
//! # dsched.policy.<disk | disk head | serial | default> = "<policy>"
//! [dsched.policy]
//! da0 = "bfq"
//! "mapper-root" = "noop"
//!
//! [bfq]
//! anticipatory = true
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default tag queue depth of a disk
pub const DEFAULT_MAX_TAG_QUEUE_DEPTH: u32 = 32;

/// Root configuration for dsched
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Framework configuration
    pub dsched: DschedConfig,
    /// BFQ policy configuration
    pub bfq: BfqConfig,
}

impl Config {
    /// Parse a configuration from toml text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check the configuration for values the schedulers cannot work with
    pub fn validate(&self) -> Result<()> {
        self.dsched.validate()?;
        self.bfq.validate()
    }
}

/// Framework configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DschedConfig {
    /// Policy used for disks without a matching tunable
    pub default_policy: String,
    /// Requests a disk accepts in flight
    pub max_tag_queue_depth: u32,
    /// Policy tunables, keyed by disk name, disk head, serial or `default`
    #[serde(rename = "policy")]
    pub policies: BTreeMap<String, String>,
}

impl Default for DschedConfig {
    fn default() -> Self {
        Self {
            default_policy: "noop".to_string(),
            max_tag_queue_depth: DEFAULT_MAX_TAG_QUEUE_DEPTH,
            policies: BTreeMap::new(),
        }
    }
}

impl DschedConfig {
    fn validate(&self) -> Result<()> {
        if self.default_policy.is_empty() {
            return Err(Error::InvalidConfig("default_policy must not be empty".into()));
        }
        if self.max_tag_queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "max_tag_queue_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Look up the `dsched.policy.<key>` tunable
    #[must_use]
    pub fn tunable(&self, key: &str) -> Option<&str> {
        self.policies.get(key).map(String::as_str)
    }

    /// Set the `dsched.policy.<key>` tunable
    pub fn set_tunable(&mut self, key: impl Into<String>, policy: impl Into<String>) {
        self.policies.insert(key.into(), policy.into());
    }
}

/// BFQ policy configuration
///
/// Budgets are in bytes, `seek_threshold` in bytes of distance between the
/// end of one request and the start of the next.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BfqConfig {
    /// Upper bound of a per-thread budget (starting value if auto-tuned)
    pub max_budget: u64,
    /// Lower bound and initial value of a per-thread budget
    pub min_budget: u64,
    /// Additive budget growth once the budget passes the threshold
    pub budget_inc_step: u64,
    /// Budgets below this value double on expiry
    pub budget_multiple_threshold: u64,
    /// Weight assigned to new I/O contexts
    pub default_weight: u32,
    /// Wall-clock length of a service slice
    pub slice_timeout_ms: u64,
    /// Anticipation wait for a thread that emptied its queue
    pub t_wait_us: u64,
    /// Anticipation wait for seeky threads
    pub t_wait_min_us: u64,
    /// Anticipatory scheduling switch
    pub anticipatory: bool,
    /// Derive max_budget from the measured peak rate
    pub auto_max_budget: bool,
    /// Average seek distance above which a thread is seeky
    pub seek_threshold: u64,
    /// Samples needed before averages are trusted
    pub valid_min_samples: u64,
}

impl Default for BfqConfig {
    fn default() -> Self {
        Self {
            max_budget: 512 * 1024,
            min_budget: 100 * 1024,
            budget_inc_step: 50 * 1024,
            budget_multiple_threshold: 200 * 1024,
            default_weight: 1,
            slice_timeout_ms: 100,
            t_wait_us: 5_000,
            t_wait_min_us: 1_000,
            anticipatory: true,
            auto_max_budget: true,
            seek_threshold: 1024 * 1024,
            valid_min_samples: 80,
        }
    }
}

impl BfqConfig {
    fn validate(&self) -> Result<()> {
        if self.default_weight == 0 {
            return Err(Error::InvalidWeight(0));
        }
        if self.min_budget > self.max_budget {
            return Err(Error::InvalidConfig(format!(
                "min_budget {} exceeds max_budget {}",
                self.min_budget, self.max_budget
            )));
        }
        if self.slice_timeout_ms == 0 {
            return Err(Error::InvalidConfig("slice_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn slice_timeout(&self) -> Duration {
        Duration::from_millis(self.slice_timeout_ms)
    }

    #[must_use]
    pub const fn t_wait(&self) -> Duration {
        Duration::from_micros(self.t_wait_us)
    }

    #[must_use]
    pub const fn t_wait_min(&self) -> Duration {
        Duration::from_micros(self.t_wait_min_us)
    }
}
