//! dsched Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions and configuration
//! structures used by the scheduling framework and its policies.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BfqConfig, Config, DschedConfig};
pub use error::{Error, ErrorKind, Result};
pub use types::*;
