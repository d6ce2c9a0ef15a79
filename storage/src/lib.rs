//! Orepool Persistence Port
//!
//! This module defines the storage interface the pool core consumes for
//! shares, found blocks, and payouts, plus an in-memory implementation used
//! for tests and single-node deployments. Batch operations are
//! all-or-nothing at batch granularity; every stored share receives a
//! monotonic sequence number that downstream consumers (the PPLNS window
//! read in particular) use as the deterministic tie-break.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use orepool_core::{Hash, PayoutEntry, Share};

pub mod memory;

pub use memory::MemoryShareStore;

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    #[error("Batch rejected: {0}")]
    BatchRejected(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// A share as persisted: the validated share plus its storage sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredShare {
    /// Monotonic insertion sequence assigned by the store
    pub seq: u64,
    /// The validated share
    pub share: Share,
}

/// Metadata recorded for a found block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block hash (little-endian)
    pub hash: Hash,
    /// Height the block was found at
    pub height: u64,
    /// Coinbase reward in the smallest currency unit
    pub reward: u64,
    /// Worker that found the block
    pub found_by: String,
    /// Sequence number of the discovering share
    pub share_seq: u64,
    /// Unix time of discovery
    pub found_at: u64,
}

/// Result of a reverse window read: the shares, newest first, and the
/// cumulative credited difficulty actually gathered
#[derive(Debug, Clone)]
pub struct ShareWindow {
    /// Accepted shares ordered newest-first (submission time descending,
    /// ties broken by descending sequence)
    pub shares: Vec<StoredShare>,
    /// Sum of credited difficulty over `shares`
    pub total_difficulty: u64,
}

/// The persistence port consumed by the pool core.
///
/// Implementations must honor `deadline` on every call and must apply
/// `insert_shares` and `insert_payouts` atomically per batch.
#[async_trait]
pub trait ShareStore: Send + Sync {
    /// Insert a batch of validated shares; all-or-nothing
    async fn insert_shares(
        &self,
        batch: Vec<Share>,
        deadline: Duration,
    ) -> Result<Vec<u64>, StorageError>;

    /// Read accepted shares backwards from `upper_bound_seq` (inclusive)
    /// until `cumulative_difficulty` is reached or the log is exhausted.
    ///
    /// The read stops with the share that crosses the bound included, so
    /// the caller can apply fractional credit at the window edge.
    async fn read_shares_reverse_until(
        &self,
        upper_bound_seq: u64,
        cumulative_difficulty: u64,
        deadline: Duration,
    ) -> Result<ShareWindow, StorageError>;

    /// Insert a batch of payout entries; all-or-nothing
    async fn insert_payouts(
        &self,
        payouts: Vec<PayoutEntry>,
        deadline: Duration,
    ) -> Result<(), StorageError>;

    /// Record a found block
    async fn record_block(
        &self,
        block: BlockRecord,
        deadline: Duration,
    ) -> Result<(), StorageError>;

    /// Read a recipient's payout history over the last `window` entries
    async fn read_payout_history(
        &self,
        recipient: &str,
        window: usize,
        deadline: Duration,
    ) -> Result<Vec<PayoutEntry>, StorageError>;
}

/// Shared handle alias used across the pool
pub type ShareStoreHandle = Arc<dyn ShareStore>;

/// Log a batch outcome at debug level; kept here so every implementation
/// reports insertions the same way
pub(crate) fn log_batch(kind: &str, len: usize) {
    debug!("stored {} batch of {}", kind, len);
}
