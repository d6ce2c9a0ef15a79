//! Per-session variable difficulty
//!
//! Each session's recent inter-share intervals drive a retarget loop that
//! keeps the device near the configured share cadence. Lock nesting is
//! always engine map first, then the single miner entry.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use log::debug;

use orepool_core::{
    ConnectionId, HardwareClass, GLOBAL_MAX_SHARE_TARGET, GLOBAL_MIN_SHARE_TARGET,
};
use orepool_util::SampleWindow;

use crate::classifier::classify_by_hashrate;

/// Retarget tuning
#[derive(Debug, Clone)]
pub struct VardiffConfig {
    /// Desired interval between shares from one device
    pub target_share_time: Duration,
    /// Minimum spacing between retargets of one session
    pub retarget_window: Duration,
    /// Minimum recorded intervals before a retarget
    pub min_shares: usize,
    /// Per-retarget clamp factor F; one step moves at most F×
    pub adjustment_factor: f64,
    /// Consecutive observations past a class boundary before reclassifying
    pub reclassify_after: u32,
}

impl Default for VardiffConfig {
    fn default() -> Self {
        VardiffConfig {
            target_share_time: Duration::from_secs(10),
            retarget_window: Duration::from_secs(60),
            min_shares: 5,
            adjustment_factor: 2.0,
            reclassify_after: 3,
        }
    }
}

/// Length cap on the interval history
const INTERVAL_WINDOW: usize = 100;

/// What a recorded share changed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetargetDecision {
    /// New share target in difficulty units
    pub new_target: u64,
    /// Set when the observed hashrate moved the session to a new class
    pub reclassified: Option<HardwareClass>,
}

/// Per-miner retarget state
struct MinerVardiff {
    class: HardwareClass,
    current_target: u64,
    intervals: SampleWindow,
    last_share: Option<Instant>,
    last_retarget: Instant,
    /// Smoothed observed hashrate in H/s
    hashrate_ema: f64,
    /// Consecutive observations on the other side of a class boundary
    boundary_streak: u32,
}

impl MinerVardiff {
    fn new(class: HardwareClass) -> Self {
        let baseline = class.profile().baseline_target;
        MinerVardiff {
            class,
            current_target: baseline,
            intervals: SampleWindow::new(INTERVAL_WINDOW),
            last_share: None,
            last_retarget: Instant::now(),
            hashrate_ema: 0.0,
            boundary_streak: 0,
        }
    }
}

/// Engine holding every session's retarget state
pub struct VardiffEngine {
    config: VardiffConfig,
    miners: RwLock<HashMap<ConnectionId, Mutex<MinerVardiff>>>,
}

impl VardiffEngine {
    pub fn new(config: VardiffConfig) -> Self {
        VardiffEngine {
            config,
            miners: RwLock::new(HashMap::new()),
        }
    }

    /// Track a session from authorization; returns its starting target
    pub fn register(&self, id: ConnectionId, class: HardwareClass) -> u64 {
        let state = MinerVardiff::new(class);
        let target = state.current_target;
        self.miners.write().unwrap().insert(id, Mutex::new(state));
        target
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.miners.write().unwrap().remove(&id);
    }

    pub fn tracked_count(&self) -> usize {
        self.miners.read().unwrap().len()
    }

    /// Record one counted share (accepted, or stale for smoothing) and run
    /// the retarget policy.
    ///
    /// Returns a decision only when the target actually moved; the caller
    /// pushes the change to the session and its peer.
    pub fn record_share(&self, id: ConnectionId, credited_difficulty: u64) -> Option<RetargetDecision> {
        self.record_share_at(id, credited_difficulty, Instant::now())
    }

    /// Test seam: record with an explicit timestamp
    pub fn record_share_at(
        &self,
        id: ConnectionId,
        credited_difficulty: u64,
        now: Instant,
    ) -> Option<RetargetDecision> {
        let miners = self.miners.read().unwrap();
        let entry = miners.get(&id)?;
        let mut miner = entry.lock().unwrap();

        if let Some(last) = miner.last_share {
            let interval = now.saturating_duration_since(last);
            miner.intervals.push(interval);

            // One share at difficulty d represents ~d·2^32 hashes
            let secs = interval.as_secs_f64().max(1e-6);
            let observed = credited_difficulty as f64 * 4_294_967_296.0 / secs;
            miner.hashrate_ema = if miner.hashrate_ema == 0.0 {
                observed
            } else {
                0.9 * miner.hashrate_ema + 0.1 * observed
            };
        }
        miner.last_share = Some(now);

        let reclassified = self.maybe_reclassify(&mut miner);
        let retargeted = self.maybe_retarget(&mut miner, now);

        match (retargeted, reclassified) {
            (None, None) => None,
            (new_target, reclassified) => Some(RetargetDecision {
                new_target: new_target.unwrap_or(miner.current_target),
                reclassified,
            }),
        }
    }

    /// Current target for a tracked session
    pub fn current_target(&self, id: ConnectionId) -> Option<u64> {
        let miners = self.miners.read().unwrap();
        miners.get(&id).map(|m| m.lock().unwrap().current_target)
    }

    /// Estimated hashrate for a tracked session
    pub fn estimated_hashrate(&self, id: ConnectionId) -> Option<f64> {
        let miners = self.miners.read().unwrap();
        miners.get(&id).map(|m| m.lock().unwrap().hashrate_ema)
    }

    fn maybe_retarget(&self, miner: &mut MinerVardiff, now: Instant) -> Option<u64> {
        if now.saturating_duration_since(miner.last_retarget) < self.config.retarget_window {
            return None;
        }
        if miner.intervals.len() < self.config.min_shares {
            return None;
        }
        let average = miner.intervals.average()?;
        let average_secs = average.as_secs_f64().max(1e-6);

        let factor = self.config.adjustment_factor.max(1.0);
        let ratio = (self.config.target_share_time.as_secs_f64() / average_secs)
            .clamp(1.0 / factor, factor);

        // Deadband: close enough, leave the device alone
        if ratio > 0.9 && ratio < 1.1 {
            return None;
        }

        let proposed = (miner.current_target as f64 * ratio).round() as u64;
        let clamped = miner
            .class
            .clamp_target(proposed)
            .clamp(GLOBAL_MIN_SHARE_TARGET, GLOBAL_MAX_SHARE_TARGET);

        if clamped == miner.current_target {
            return None;
        }

        debug!(
            "retarget {} -> {} (ratio {:.3}, class {})",
            miner.current_target, clamped, ratio, miner.class
        );
        miner.current_target = clamped;
        miner.last_retarget = now;
        miner.intervals.clear();
        Some(clamped)
    }

    fn maybe_reclassify(&self, miner: &mut MinerVardiff) -> Option<HardwareClass> {
        if miner.hashrate_ema <= 0.0 {
            return None;
        }
        let observed_class = classify_by_hashrate(miner.hashrate_ema);
        if observed_class == miner.class {
            miner.boundary_streak = 0;
            return None;
        }

        miner.boundary_streak += 1;
        if miner.boundary_streak < self.config.reclassify_after {
            return None;
        }

        debug!(
            "reclassify {} -> {} at {:.0} H/s",
            miner.class, observed_class, miner.hashrate_ema
        );
        miner.class = observed_class;
        miner.boundary_streak = 0;

        // Entering a faster class bumps the target up to the new floor
        let min_target = observed_class.profile().min_target;
        if miner.current_target < min_target {
            miner.current_target = min_target;
        }
        Some(observed_class)
    }
}
