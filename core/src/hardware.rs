//! Hardware classes for connected mining devices
//!
//! Each class carries a baseline share target and the bounds the vardiff
//! engine is allowed to move a session within. Profiles are immutable and
//! process-wide.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Class of mining hardware behind a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareClass {
    Cpu,
    Gpu,
    Fpga,
    AsicGeneric,
    AsicOfficial,
    Unknown,
}

impl fmt::Display for HardwareClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareClass::Cpu => "cpu",
            HardwareClass::Gpu => "gpu",
            HardwareClass::Fpga => "fpga",
            HardwareClass::AsicGeneric => "asic-generic",
            HardwareClass::AsicOfficial => "asic-official",
            HardwareClass::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Static tuning profile for a hardware class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    /// The class this profile describes
    pub class: HardwareClass,
    /// Initial share target for new sessions, in difficulty units
    pub baseline_target: u64,
    /// Lowest share target vardiff may assign
    pub min_target: u64,
    /// Highest share target vardiff may assign
    pub max_target: u64,
    /// Expected hashrate in hashes per second, used for sanity reporting
    pub expected_hashrate: f64,
}

impl HardwareClass {
    /// The immutable profile for this class
    pub fn profile(&self) -> HardwareProfile {
        match self {
            HardwareClass::Cpu => HardwareProfile {
                class: *self,
                baseline_target: 64,
                min_target: 1,
                max_target: 4_096,
                expected_hashrate: 100_000.0,
            },
            HardwareClass::Gpu => HardwareProfile {
                class: *self,
                baseline_target: 4_096,
                min_target: 256,
                max_target: 262_144,
                expected_hashrate: 10_000_000.0,
            },
            HardwareClass::Fpga => HardwareProfile {
                class: *self,
                baseline_target: 16_384,
                min_target: 1_024,
                max_target: 1_048_576,
                expected_hashrate: 40_000_000.0,
            },
            HardwareClass::AsicGeneric => HardwareProfile {
                class: *self,
                baseline_target: 65_536,
                min_target: 4_096,
                max_target: 16_777_216,
                expected_hashrate: 100_000_000.0,
            },
            HardwareClass::AsicOfficial => HardwareProfile {
                class: *self,
                baseline_target: 262_144,
                min_target: 16_384,
                max_target: 1 << 34,
                expected_hashrate: 500_000_000.0,
            },
            HardwareClass::Unknown => HardwareProfile {
                class: *self,
                baseline_target: 512,
                min_target: 1,
                max_target: 65_536,
                expected_hashrate: 1_000_000.0,
            },
        }
    }

    /// Clamp a share target into this class's bounds and the global bounds
    pub fn clamp_target(&self, target: u64) -> u64 {
        let profile = self.profile();
        target
            .clamp(profile.min_target, profile.max_target)
            .clamp(
                crate::target::GLOBAL_MIN_SHARE_TARGET,
                crate::target::GLOBAL_MAX_SHARE_TARGET,
            )
    }
}
