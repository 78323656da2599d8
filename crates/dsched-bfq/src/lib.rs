//! dsched BFQ - Budget fair queueing policy
//!
//! This crate provides:
//!
//! - **AugmentedFairTree**: AVL tree keyed by virtual eligible time,
//!   augmented with the subtree minimum deadline
//! - **FairQueue**: B-WF2Q+ selection of the eligible context with the
//!   earliest virtual deadline
//! - **BfqPolicy**: per-thread budgets, slice timeouts and anticipatory
//!   scheduling on top of the fair queue

pub mod augtree;
mod budget;
mod helper;
pub mod policy;
pub mod wf2q;

pub use augtree::AugmentedFairTree;
pub use policy::{BFQ_POLICY, BfqDisk, BfqPolicy};
pub use wf2q::{FairQueue, Wf2qEntity};
