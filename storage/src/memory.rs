//! In-memory share store
//!
//! Keeps the full share log, payouts, and block records in process memory
//! behind tokio RwLocks. Suitable for tests and small single-node pools;
//! durable backends implement the same port.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use orepool_core::{PayoutEntry, Share, ShareVerdict};

use crate::{log_batch, BlockRecord, ShareStore, ShareWindow, StorageError, StoredShare};

pub struct MemoryShareStore {
    /// Share log in insertion order; seq equals position + 1
    shares: RwLock<Vec<StoredShare>>,

    /// Payout entries in insertion order
    payouts: RwLock<Vec<PayoutEntry>>,

    /// Found-block records
    blocks: RwLock<Vec<BlockRecord>>,

    /// Next sequence number to hand out
    next_seq: AtomicU64,
}

impl MemoryShareStore {
    pub fn new() -> Self {
        MemoryShareStore {
            shares: RwLock::new(Vec::new()),
            payouts: RwLock::new(Vec::new()),
            blocks: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Number of stored shares, for tests and stats
    pub async fn share_count(&self) -> usize {
        self.shares.read().await.len()
    }

    pub async fn block_count(&self) -> usize {
        self.blocks.read().await.len()
    }
}

impl Default for MemoryShareStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShareStore for MemoryShareStore {
    async fn insert_shares(
        &self,
        batch: Vec<Share>,
        _deadline: Duration,
    ) -> Result<Vec<u64>, StorageError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        // Sequence numbers are reserved and applied under one write lock so
        // a batch lands contiguously or not at all
        let mut log = self.shares.write().await;
        let mut seqs = Vec::with_capacity(batch.len());
        for share in batch {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            seqs.push(seq);
            log.push(StoredShare { seq, share });
        }
        log_batch("share", seqs.len());
        Ok(seqs)
    }

    async fn read_shares_reverse_until(
        &self,
        upper_bound_seq: u64,
        cumulative_difficulty: u64,
        _deadline: Duration,
    ) -> Result<ShareWindow, StorageError> {
        let log = self.shares.read().await;

        let mut window = Vec::new();
        let mut total: u64 = 0;

        // The log is already in insertion order; walk it backwards from the
        // upper bound. Only accepted shares count toward the window.
        for stored in log.iter().rev() {
            if stored.seq > upper_bound_seq {
                continue;
            }
            if !matches!(stored.share.verdict, ShareVerdict::Accepted) {
                continue;
            }

            total = total.saturating_add(stored.share.credited_difficulty);
            window.push(stored.clone());

            // Include the boundary-crossing share and stop
            if total >= cumulative_difficulty {
                break;
            }
        }

        Ok(ShareWindow {
            shares: window,
            total_difficulty: total,
        })
    }

    async fn insert_payouts(
        &self,
        payouts: Vec<PayoutEntry>,
        _deadline: Duration,
    ) -> Result<(), StorageError> {
        if payouts.is_empty() {
            return Ok(());
        }
        let mut log = self.payouts.write().await;
        log_batch("payout", payouts.len());
        log.extend(payouts);
        Ok(())
    }

    async fn record_block(
        &self,
        block: BlockRecord,
        _deadline: Duration,
    ) -> Result<(), StorageError> {
        self.blocks.write().await.push(block);
        Ok(())
    }

    async fn read_payout_history(
        &self,
        recipient: &str,
        window: usize,
        _deadline: Duration,
    ) -> Result<Vec<PayoutEntry>, StorageError> {
        let log = self.payouts.read().await;
        Ok(log
            .iter()
            .rev()
            .filter(|entry| entry.recipient == recipient)
            .take(window)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orepool_core::{JobId, PayoutStatus, RejectReason};

    fn share(worker: &str, difficulty: u64, accepted: bool) -> Share {
        Share {
            worker: worker.to_string(),
            job_id: JobId(1),
            extranonce2: vec![0, 0, 0, 0],
            ntime: 0x5f5e1000,
            nonce: 42,
            submitted_at: 1_700_000_000,
            credited_difficulty: difficulty,
            verdict: if accepted {
                ShareVerdict::Accepted
            } else {
                ShareVerdict::Rejected(RejectReason::Stale)
            },
            block_candidate: false,
            hash: None,
        }
    }

    const DEADLINE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_insert_assigns_monotonic_seqs() {
        let store = MemoryShareStore::new();
        let seqs = store
            .insert_shares(vec![share("a", 10, true), share("b", 20, true)], DEADLINE)
            .await
            .unwrap();
        assert_eq!(seqs, vec![1, 2]);

        let more = store
            .insert_shares(vec![share("c", 30, true)], DEADLINE)
            .await
            .unwrap();
        assert_eq!(more, vec![3]);
    }

    #[tokio::test]
    async fn test_reverse_window_includes_boundary_share() {
        let store = MemoryShareStore::new();
        // Oldest first: (a,40), (b,30), (a,40); reading backwards from the
        // last share, a 100-difficulty window crosses into the first share
        store
            .insert_shares(
                vec![share("a", 40, true), share("b", 30, true), share("a", 40, true)],
                DEADLINE,
            )
            .await
            .unwrap();

        let window = store.read_shares_reverse_until(3, 100, DEADLINE).await.unwrap();
        assert_eq!(window.shares.len(), 3);
        assert_eq!(window.total_difficulty, 110);
        // Newest first
        assert_eq!(window.shares[0].seq, 3);
        assert_eq!(window.shares[2].seq, 1);
    }

    #[tokio::test]
    async fn test_reverse_window_skips_rejected_and_later_shares() {
        let store = MemoryShareStore::new();
        store
            .insert_shares(
                vec![
                    share("a", 40, true),
                    share("b", 30, false),
                    share("a", 15, true),
                    share("c", 99, true),
                ],
                DEADLINE,
            )
            .await
            .unwrap();

        // Upper bound 3 excludes seq 4; rejected seq 2 never counts
        let window = store.read_shares_reverse_until(3, 1000, DEADLINE).await.unwrap();
        let seqs: Vec<u64> = window.shares.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![3, 1]);
        assert_eq!(window.total_difficulty, 55);
    }

    #[tokio::test]
    async fn test_payout_history_filters_by_recipient() {
        let store = MemoryShareStore::new();
        let entry = |recipient: &str, amount: u64| PayoutEntry {
            recipient: recipient.to_string(),
            amount,
            source_block: [0u8; 32],
            status: PayoutStatus::Pending,
        };
        store
            .insert_payouts(vec![entry("a", 1), entry("b", 2), entry("a", 3)], DEADLINE)
            .await
            .unwrap();

        let history = store.read_payout_history("a", 10, DEADLINE).await.unwrap();
        assert_eq!(history.len(), 2);
        // Newest first
        assert_eq!(history[0].amount, 3);

        let capped = store.read_payout_history("a", 1, DEADLINE).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_record_block() {
        let store = MemoryShareStore::new();
        store
            .record_block(
                BlockRecord {
                    hash: [9u8; 32],
                    height: 77,
                    reward: 625_000_000,
                    found_by: "a".into(),
                    share_seq: 1,
                    found_at: 1_700_000_000,
                },
                DEADLINE,
            )
            .await
            .unwrap();
        assert_eq!(store.block_count().await, 1);
    }
}
