//! Orepool Core Types and Data Structures
//!
//! This module defines the data model shared by every Orepool component:
//! mining jobs, submitted shares and their verdicts, share targets and
//! difficulty arithmetic, hardware classes, and the pluggable proof-of-work
//! hash backend.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod hardware;
pub mod job;
pub mod pow;
pub mod share;
pub mod target;

pub use hardware::{HardwareClass, HardwareProfile};
pub use job::{Job, JobId};
pub use pow::{PowHash, Sha256d};
pub use share::{
    BlockFound, PayoutEntry, PayoutStatus, RejectReason, Share, ShareVerdict,
};
pub use target::{Target, GLOBAL_MAX_SHARE_TARGET, GLOBAL_MIN_SHARE_TARGET};

/// Hash type used throughout the system
pub type Hash = [u8; 32];

/// Core error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid job field: {0}")]
    InvalidJob(String),

    #[error("Invalid extranonce: {0}")]
    InvalidExtranonce(String),

    #[error("Hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Opaque connection identifier, unique within the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{:x}", self.0)
    }
}

/// Protocol variant spoken by a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// Stratum V1: newline-delimited JSON-RPC
    V1,
    /// Stratum V2: length-prefixed binary frames over a Noise channel
    V2,
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVariant::V1 => write!(f, "v1"),
            ProtocolVariant::V2 => write!(f, "v2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(0xbeef).to_string(), "conn-beef");
    }
}
