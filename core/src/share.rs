//! Shares, verdicts, and payout records

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::Hash;

/// Why a submission was not credited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The referenced job has been superseded by a new previous-block hash
    Stale,
    /// The same proof was already submitted for this job
    Duplicate,
    /// The reconstructed header does not hash below the session target
    LowDifficulty,
    /// The submission is malformed or fails proof reconstruction
    InvalidProof,
    /// The session never authorized a worker
    Unauthorized,
    /// The referenced job id was never issued
    UnknownJob,
    /// The session exceeded its submission rate budget
    RateLimited,
}

impl RejectReason {
    /// Stable Stratum V1 error code for this rejection
    pub fn v1_error_code(&self) -> i32 {
        match self {
            RejectReason::Stale => 21,
            RejectReason::Duplicate => 22,
            RejectReason::LowDifficulty => 23,
            RejectReason::Unauthorized => 24,
            RejectReason::InvalidProof | RejectReason::UnknownJob | RejectReason::RateLimited => 20,
        }
    }

    /// Stratum V2 SubmitShares.Error reason tag
    pub fn v2_reason_tag(&self) -> &'static str {
        match self {
            RejectReason::Stale => "stale-share",
            RejectReason::Duplicate => "duplicate-share",
            RejectReason::LowDifficulty => "difficulty-too-low",
            RejectReason::InvalidProof => "invalid-share",
            RejectReason::Unauthorized => "unauthorized-worker",
            RejectReason::UnknownJob => "invalid-job-id",
            RejectReason::RateLimited => "rate-limited",
        }
    }

    /// Human-readable message sent alongside the V1 error code
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::Stale => "Stale share",
            RejectReason::Duplicate => "Duplicate share",
            RejectReason::LowDifficulty => "Share above target",
            RejectReason::InvalidProof => "Invalid proof",
            RejectReason::Unauthorized => "Unauthorized worker",
            RejectReason::UnknownJob => "Unknown job",
            RejectReason::RateLimited => "Share rate limit exceeded",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.v2_reason_tag())
    }
}

/// Outcome of share validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareVerdict {
    Accepted,
    Rejected(RejectReason),
}

impl ShareVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ShareVerdict::Accepted)
    }
}

/// A validated submission, immutable once created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    /// Worker label of the submitter
    pub worker: String,

    /// Job the proof was built against
    pub job_id: JobId,

    /// Miner-chosen extranonce bytes
    pub extranonce2: Vec<u8>,

    /// Header timestamp carried by the submission
    pub ntime: u32,

    /// Header nonce
    pub nonce: u32,

    /// Unix time the submission was received
    pub submitted_at: u64,

    /// Session share target at the moment of submission, in difficulty units.
    /// This is the difficulty the share is credited at, never a later one.
    pub credited_difficulty: u64,

    /// Validation outcome
    pub verdict: ShareVerdict,

    /// Whether the proof also met the network target
    pub block_candidate: bool,

    /// Proof hash, little-endian, when the proof was evaluated
    pub hash: Option<Hash>,
}

/// Emitted when a share meets the network target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFound {
    /// Hash of the found block (little-endian)
    pub block_hash: Hash,

    /// Height the block was found at
    pub height: u64,

    /// Coinbase reward in the smallest currency unit
    pub reward: u64,

    /// The share that discovered the block
    pub share: Share,

    /// Storage sequence of the discovering share; the upper bound of the
    /// reward window
    pub share_seq: u64,
}

/// Lifecycle of a payout entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutStatus {
    Pending,
    Sent,
    Confirmed,
    Failed,
}

/// One recipient's slice of a distributed block reward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutEntry {
    /// Recipient account (worker label up to the first separator)
    pub recipient: String,

    /// Amount in the smallest currency unit
    pub amount: u64,

    /// Hash of the block this payout derives from
    pub source_block: Hash,

    /// Current status
    pub status: PayoutStatus,
}
