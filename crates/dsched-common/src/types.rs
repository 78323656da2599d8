//! Core type definitions for dsched
//!
//! Identifiers handed out by the framework and the small value types that
//! describe a bio's command and completion status.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Process identifier of an I/O issuer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("pid:{_0}")]
pub struct ProcId(pub u32);

/// Thread identifier of an I/O issuer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("tid:{_0}")]
pub struct ThreadId(pub u64);

/// Unique identifier for a bio
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("bio:{_0}")]
pub struct BioId(pub u64);

/// Identifier of a per-thread, per-disk I/O context
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("tdio:{_0}")]
pub struct TdioId(pub u64);

/// Identifier assigned to a policy at registration
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct PolicyId(pub u32);

/// The issuer of an I/O: either a whole process or a lone kernel thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum IoOwner {
    #[display("{_0}")]
    Proc(ProcId),
    #[display("{_0}")]
    Thread(ThreadId),
}

/// Command carried by a bio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Display)]
pub enum BioCmd {
    #[default]
    Read,
    Write,
    Flush,
    Other,
}

impl BioCmd {
    /// Data transfer commands are the ones a fair policy accounts for
    #[must_use]
    pub const fn is_read_write(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }
}

/// Final status reported to the issuer of a bio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BioStatus {
    /// Transfer completed
    Success,
    /// The bio was cancelled before reaching the device (ENXIO)
    Cancelled,
    /// The device failed the request with the given errno
    Error(i32),
}

impl BioStatus {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// errno equivalent, 0 on success
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Cancelled => libc::ENXIO,
            Self::Error(errno) => errno,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(ProcId(7).to_string(), "pid:7");
        assert_eq!(IoOwner::Thread(ThreadId(3)).to_string(), "tid:3");
        assert_eq!(TdioId(12).to_string(), "tdio:12");
    }

    #[test]
    fn test_bio_cmd_classification() {
        assert!(BioCmd::Read.is_read_write());
        assert!(BioCmd::Write.is_read_write());
        assert!(!BioCmd::Flush.is_read_write());
        assert!(!BioCmd::Other.is_read_write());
    }

    #[test]
    fn test_status_errno() {
        assert_eq!(BioStatus::Success.errno(), 0);
        assert_eq!(BioStatus::Cancelled.errno(), libc::ENXIO);
        assert_eq!(BioStatus::Error(libc::EIO).errno(), libc::EIO);
    }
}
