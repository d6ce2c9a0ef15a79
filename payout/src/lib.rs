//! PPLNS reward allocation
//!
//! When a block is found, the reward (minus the pool fee) is split over
//! the last N units of credited difficulty, walking the share log
//! backwards from the discovering share. The share that crosses the
//! window boundary is credited fractionally with whatever capacity
//! remains. Amounts are truncated to the smallest currency unit and the
//! truncation residual accumulates to the operator's dust account.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use orepool_core::{Hash, PayoutEntry, PayoutStatus};
use orepool_storage::ShareWindow;

/// Payout errors
#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Allocation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PplnsConfig {
    /// Window size N, in units of credited difficulty
    pub window_n: u64,
    /// Pool fee as a fraction in [0, 1]
    pub fee_fraction: f64,
    /// Entries below this amount are carried as dust instead of paid
    pub minimum_payout: u64,
}

impl Default for PplnsConfig {
    fn default() -> Self {
        PplnsConfig {
            window_n: 100_000,
            fee_fraction: 0.01,
            minimum_payout: 0,
        }
    }
}

impl PplnsConfig {
    pub fn validate(&self) -> Result<(), PayoutError> {
        if self.window_n == 0 {
            return Err(PayoutError::InvalidConfig("window_n must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.fee_fraction) {
            return Err(PayoutError::InvalidConfig(
                "fee_fraction must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Result of one allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Deterministic payout list, sorted by recipient
    pub payouts: Vec<PayoutEntry>,
    /// Truncation and sub-minimum residual owed to the operator account
    pub dust: u64,
    /// Reward remaining after the fee deduction
    pub distributable: u64,
}

impl Allocation {
    fn empty() -> Allocation {
        Allocation {
            payouts: Vec::new(),
            dust: 0,
            distributable: 0,
        }
    }
}

/// Sliding-difficulty-window allocator
pub struct PplnsAllocator {
    config: PplnsConfig,
}

impl PplnsAllocator {
    pub fn new(config: PplnsConfig) -> Result<PplnsAllocator, PayoutError> {
        config.validate()?;
        Ok(PplnsAllocator { config })
    }

    pub fn window_n(&self) -> u64 {
        self.config.window_n
    }

    /// Split a block reward over the windowed shares.
    ///
    /// `window` must come from the storage port's reverse read ending at
    /// the discovering share: newest first, insertion order as tie-break.
    /// A zero reward, an empty window, or zero credited difficulty all
    /// yield an empty allocation rather than an error.
    pub fn allocate(&self, reward: u64, window: &ShareWindow, source_block: Hash) -> Allocation {
        if reward == 0 || window.shares.is_empty() || window.total_difficulty == 0 {
            debug!("empty allocation: reward {} over {} shares", reward, window.shares.len());
            return Allocation::empty();
        }

        let n = self.config.window_n;

        // Accumulate per recipient; the boundary share is clipped to the
        // remaining window capacity
        let mut credited: BTreeMap<String, u64> = BTreeMap::new();
        let mut consumed: u64 = 0;
        for stored in &window.shares {
            if consumed >= n {
                break;
            }
            let available = n - consumed;
            let credit = stored.share.credited_difficulty.min(available);
            if credit == 0 {
                continue;
            }
            consumed += credit;
            *credited
                .entry(account_of(&stored.share.worker).to_string())
                .or_insert(0) += credit;
        }
        if consumed == 0 {
            return Allocation::empty();
        }

        // Fee off the top, truncated to the smallest unit
        let distributable = (reward as f64 * (1.0 - self.config.fee_fraction)).floor() as u64;

        let mut payouts = Vec::with_capacity(credited.len());
        let mut paid: u64 = 0;
        for (recipient, share_sum) in credited {
            let amount = (distributable as u128 * share_sum as u128 / n as u128) as u64;
            if amount < self.config.minimum_payout || amount == 0 {
                continue;
            }
            paid += amount;
            payouts.push(PayoutEntry {
                recipient,
                amount,
                source_block,
                status: PayoutStatus::Pending,
            });
        }

        let dust = distributable - paid;
        info!(
            "allocated {} to {} recipients ({} dust)",
            paid,
            payouts.len(),
            dust
        );
        Allocation {
            payouts,
            dust,
            distributable,
        }
    }
}

/// Recipient identity: the worker label up to the first rig separator
fn account_of(worker: &str) -> &str {
    worker.split('.').next().unwrap_or(worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orepool_core::{JobId, Share, ShareVerdict};
    use orepool_storage::StoredShare;

    fn stored(seq: u64, worker: &str, difficulty: u64) -> StoredShare {
        StoredShare {
            seq,
            share: Share {
                worker: worker.to_string(),
                job_id: JobId(1),
                extranonce2: vec![],
                ntime: 0,
                nonce: 0,
                submitted_at: 1_700_000_000,
                credited_difficulty: difficulty,
                verdict: ShareVerdict::Accepted,
                block_candidate: false,
                hash: None,
            },
        }
    }

    fn window(shares: Vec<StoredShare>) -> ShareWindow {
        let total = shares.iter().map(|s| s.share.credited_difficulty).sum();
        ShareWindow {
            shares,
            total_difficulty: total,
        }
    }

    fn allocator(n: u64, fee: f64) -> PplnsAllocator {
        PplnsAllocator::new(PplnsConfig {
            window_n: n,
            fee_fraction: fee,
            minimum_payout: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_fractional_boundary_split() {
        // Reverse time order: (A,40), (B,30), (A,40); cumulative 40/70/110.
        // The last share is clipped to 30. Reward 10 coins at 1% fee.
        let allocator = allocator(100, 0.01);
        let window = window(vec![
            stored(3, "a.rig1", 40),
            stored(2, "b.rig1", 30),
            stored(1, "a.rig2", 40),
        ]);
        let allocation = allocator.allocate(1_000_000_000, &window, [9u8; 32]);

        assert_eq!(allocation.distributable, 990_000_000);
        assert_eq!(allocation.payouts.len(), 2);
        // Sorted by recipient: a then b
        assert_eq!(allocation.payouts[0].recipient, "a");
        assert_eq!(allocation.payouts[0].amount, 693_000_000);
        assert_eq!(allocation.payouts[1].recipient, "b");
        assert_eq!(allocation.payouts[1].amount, 297_000_000);
        assert_eq!(allocation.dust, 0);
        assert_eq!(allocation.payouts[0].status, PayoutStatus::Pending);
    }

    #[test]
    fn test_truncation_residual_goes_to_dust() {
        // 3-way split of 100 after zero fee: 33 each, 1 dust
        let allocator = allocator(3, 0.0);
        let window = window(vec![
            stored(3, "a", 1),
            stored(2, "b", 1),
            stored(1, "c", 1),
        ]);
        let allocation = allocator.allocate(100, &window, [0u8; 32]);
        let paid: u64 = allocation.payouts.iter().map(|p| p.amount).sum();
        assert_eq!(paid, 99);
        assert_eq!(allocation.dust, 1);
        // P4: payouts plus dust equal the post-fee reward exactly
        assert_eq!(paid + allocation.dust, allocation.distributable);
    }

    #[test]
    fn test_underfilled_window_leaves_remainder_as_dust() {
        // Only 50 of N=100 present: half the distributable is paid out
        let allocator = allocator(100, 0.0);
        let window = window(vec![stored(1, "a", 50)]);
        let allocation = allocator.allocate(1000, &window, [0u8; 32]);
        assert_eq!(allocation.payouts.len(), 1);
        assert_eq!(allocation.payouts[0].amount, 500);
        assert_eq!(allocation.dust, 500);
    }

    #[test]
    fn test_zero_reward_is_empty() {
        let allocator = allocator(100, 0.01);
        let window = window(vec![stored(1, "a", 50)]);
        assert_eq!(allocator.allocate(0, &window, [0u8; 32]), Allocation::empty());
    }

    #[test]
    fn test_empty_window_is_empty() {
        let allocator = allocator(100, 0.01);
        let empty = ShareWindow {
            shares: vec![],
            total_difficulty: 0,
        };
        assert_eq!(
            allocator.allocate(1000, &empty, [0u8; 32]),
            Allocation::empty()
        );
    }

    #[test]
    fn test_zero_credited_difficulty_is_empty() {
        let allocator = allocator(100, 0.01);
        let window = window(vec![stored(1, "a", 0), stored(2, "b", 0)]);
        assert_eq!(
            allocator.allocate(1000, &window, [0u8; 32]),
            Allocation::empty()
        );
    }

    #[test]
    fn test_minimum_payout_carries_to_dust() {
        let allocator = PplnsAllocator::new(PplnsConfig {
            window_n: 100,
            fee_fraction: 0.0,
            minimum_payout: 200,
        })
        .unwrap();
        // b's 10% slice of 1000 falls under the 200 minimum
        let window = window(vec![stored(2, "a", 90), stored(1, "b", 10)]);
        let allocation = allocator.allocate(1000, &window, [0u8; 32]);
        assert_eq!(allocation.payouts.len(), 1);
        assert_eq!(allocation.payouts[0].recipient, "a");
        assert_eq!(allocation.payouts[0].amount, 900);
        assert_eq!(allocation.dust, 100);
    }

    #[test]
    fn test_workers_of_same_account_merge() {
        let allocator = allocator(100, 0.0);
        let window = window(vec![
            stored(2, "acct.rig1", 50),
            stored(1, "acct.rig2", 50),
        ]);
        let allocation = allocator.allocate(1000, &window, [0u8; 32]);
        assert_eq!(allocation.payouts.len(), 1);
        assert_eq!(allocation.payouts[0].recipient, "acct");
        assert_eq!(allocation.payouts[0].amount, 1000);
    }

    #[test]
    fn test_deterministic_order() {
        let allocator = allocator(100, 0.0);
        let window = window(vec![
            stored(3, "zeta", 20),
            stored(2, "alpha", 20),
            stored(1, "mid", 20),
        ]);
        let allocation = allocator.allocate(600, &window, [0u8; 32]);
        let names: Vec<&str> = allocation
            .payouts
            .iter()
            .map(|p| p.recipient.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_config_validation() {
        assert!(PplnsAllocator::new(PplnsConfig {
            window_n: 0,
            fee_fraction: 0.01,
            minimum_payout: 0,
        })
        .is_err());
        assert!(PplnsAllocator::new(PplnsConfig {
            window_n: 1,
            fee_fraction: 1.5,
            minimum_payout: 0,
        })
        .is_err());
    }
}
