//! dsched Core - Pluggable disk I/O scheduling framework
//!
//! This crate provides the framework side of disk scheduling:
//!
//! - **PolicyRegistry**: named, reference-counted scheduling policies
//! - **DiskBinding**: one active policy per disk, with runtime switching
//! - **IoContextTracker**: per-process and per-thread I/O contexts
//! - **Dsched**: the facade tying them together and routing bios
//!
//! Policies implement [`Policy`] and [`DiskPolicy`]; the built-in
//! [`NoopPolicy`] passes every bio straight to the device.

pub mod bio;
pub mod context;
pub mod device;
pub mod disk;
pub mod framework;
pub mod noop;
pub mod policy;
pub mod registry;
pub mod stats;

pub use bio::{Bio, BioCompletion, DschedObject};
pub use context::{IoContextTracker, Issuer, ThreadCtx, ThreadIo};
pub use device::{DiskDevice, DispatchRecord, QueueDevice};
pub use disk::{Disk, DiskBinding};
pub use framework::{DiskInfo, Dsched, QueueRejected};
pub use noop::{NOOP_POLICY, NoopPolicy};
pub use policy::{DiskPolicy, Policy, QueueOutcome};
pub use registry::{PolicyEntry, PolicyInfo, PolicyRegistry};
pub use stats::{DschedStats, DschedStatsSnapshot};
