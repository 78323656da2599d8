//! Error types for dsched
//!
//! Registry and binding errors are returned synchronously to the caller.
//! Each variant maps onto one of the coarse [`ErrorKind`]s and onto the errno
//! value a kernel-style caller expects.

use thiserror::Error;

/// Common result type for dsched operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for dsched
#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("disk not found: {0}")]
    DiskNotFound(String),

    // Registration errors
    #[error("policy {0} is already registered with different operations")]
    PolicyConflict(String),

    #[error("disk already attached: {0}")]
    DiskExists(String),

    #[error("fair queue entry already linked")]
    AlreadyQueued,

    // Lifecycle errors
    #[error("policy {name} is still bound to {bindings} disk(s)")]
    PolicyBusy { name: String, bindings: usize },

    #[error("policy switch already in progress on disk {0}")]
    SwitchInProgress(String),

    #[error("disk {0} is switching policies, retry the request")]
    Switching(String),

    // Argument errors
    #[error("invalid weight {0}: must be at least 1")]
    InvalidWeight(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Busy,
    Invalid,
    Retry,
    Internal,
}

impl Error {
    /// Classify the error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PolicyNotFound(_) | Self::DiskNotFound(_) => ErrorKind::NotFound,
            Self::PolicyConflict(_) | Self::DiskExists(_) | Self::AlreadyQueued => {
                ErrorKind::Conflict
            }
            Self::PolicyBusy { .. } | Self::SwitchInProgress(_) => ErrorKind::Busy,
            Self::Switching(_) => ErrorKind::Retry,
            Self::InvalidWeight(_) | Self::InvalidConfig(_) | Self::Config(_) => {
                ErrorKind::Invalid
            }
            Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if the request can be retried unchanged
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retry)
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    /// errno equivalent of this error
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => match self.kind() {
                ErrorKind::NotFound => libc::ENOENT,
                ErrorKind::Conflict => libc::EEXIST,
                ErrorKind::Busy => libc::EBUSY,
                ErrorKind::Invalid => libc::EINVAL,
                ErrorKind::Retry => libc::EAGAIN,
                ErrorKind::Internal => libc::EIO,
            },
        }
    }
}
