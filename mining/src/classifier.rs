//! Hardware classification
//!
//! Two optional signals: an observed average hashrate and a declared
//! user-agent string. A positive observed hashrate always wins; the
//! user-agent is scanned case-insensitively against known token tables in
//! strict precedence order (official ASICs, brand ASICs, FPGA vendors, GPU
//! vendors, CPU miners). With neither signal the class stays Unknown.

use once_cell::sync::Lazy;

use orepool_core::HardwareClass;

/// Hashrate cutoffs in hashes per second
const CUTOFF_ASIC_OFFICIAL: f64 = 200_000_000.0;
const CUTOFF_ASIC_GENERIC: f64 = 60_000_000.0;
const CUTOFF_FPGA: f64 = 30_000_000.0;
const CUTOFF_GPU: f64 = 1_000_000.0;

static OFFICIAL_ASIC_TOKENS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["orepool-unit", "antminer", "braiins"]);

static BRAND_ASIC_TOKENS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["whatsminer", "avalon", "innosilicon", "canaan", "asic"]);

static FPGA_TOKENS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["xilinx", "altera", "lattice", "fpga"]);

static GPU_TOKENS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "nvidia", "geforce", "rtx", "radeon", "amdgpu", "cuda", "opencl", "gminer", "t-rex",
    ]
});

static CPU_TOKENS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["cpuminer", "minerd", "xmrig", "cpu"]);

/// Classify by observed hashrate alone
pub fn classify_by_hashrate(hashrate: f64) -> HardwareClass {
    if hashrate >= CUTOFF_ASIC_OFFICIAL {
        HardwareClass::AsicOfficial
    } else if hashrate >= CUTOFF_ASIC_GENERIC {
        HardwareClass::AsicGeneric
    } else if hashrate >= CUTOFF_FPGA {
        HardwareClass::Fpga
    } else if hashrate >= CUTOFF_GPU {
        HardwareClass::Gpu
    } else {
        HardwareClass::Cpu
    }
}

/// Classify by declared user agent; None when no token matches
pub fn classify_by_user_agent(user_agent: &str) -> Option<HardwareClass> {
    let lowered = user_agent.to_lowercase();
    let tables: [(&Lazy<Vec<&'static str>>, HardwareClass); 5] = [
        (&OFFICIAL_ASIC_TOKENS, HardwareClass::AsicOfficial),
        (&BRAND_ASIC_TOKENS, HardwareClass::AsicGeneric),
        (&FPGA_TOKENS, HardwareClass::Fpga),
        (&GPU_TOKENS, HardwareClass::Gpu),
        (&CPU_TOKENS, HardwareClass::Cpu),
    ];
    for (tokens, class) in tables {
        if tokens.iter().any(|token| lowered.contains(token)) {
            return Some(class);
        }
    }
    None
}

/// Full resolution: observed hashrate when positive, then user agent,
/// otherwise Unknown with its conservative baseline
pub fn classify(observed_hashrate: Option<f64>, user_agent: Option<&str>) -> HardwareClass {
    if let Some(hashrate) = observed_hashrate {
        if hashrate > 0.0 {
            return classify_by_hashrate(hashrate);
        }
    }
    if let Some(agent) = user_agent {
        if let Some(class) = classify_by_user_agent(agent) {
            return class;
        }
    }
    HardwareClass::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashrate_cutoffs() {
        assert_eq!(classify_by_hashrate(250e6), HardwareClass::AsicOfficial);
        assert_eq!(classify_by_hashrate(200e6), HardwareClass::AsicOfficial);
        assert_eq!(classify_by_hashrate(100e6), HardwareClass::AsicGeneric);
        assert_eq!(classify_by_hashrate(45e6), HardwareClass::Fpga);
        assert_eq!(classify_by_hashrate(5e6), HardwareClass::Gpu);
        assert_eq!(classify_by_hashrate(200_000.0), HardwareClass::Cpu);
    }

    #[test]
    fn test_hashrate_beats_user_agent() {
        // Observed rate wins even when the agent claims a CPU miner
        assert_eq!(
            classify(Some(250e6), Some("cpuminer/2.5")),
            HardwareClass::AsicOfficial
        );
    }

    #[test]
    fn test_user_agent_precedence() {
        // "antminer" (official) outranks the generic "asic" token
        assert_eq!(
            classify_by_user_agent("Antminer S19 asic fw2"),
            Some(HardwareClass::AsicOfficial)
        );
        assert_eq!(
            classify_by_user_agent("WhatsMiner M30"),
            Some(HardwareClass::AsicGeneric)
        );
        assert_eq!(
            classify_by_user_agent("xilinx-loader/1.1"),
            Some(HardwareClass::Fpga)
        );
        assert_eq!(
            classify_by_user_agent("T-Rex/0.26 CUDA"),
            Some(HardwareClass::Gpu)
        );
        assert_eq!(
            classify_by_user_agent("cpuminer-opt/3.8"),
            Some(HardwareClass::Cpu)
        );
    }

    #[test]
    fn test_case_insensitive_matching() {
        assert_eq!(
            classify_by_user_agent("ANTMINER"),
            Some(HardwareClass::AsicOfficial)
        );
    }

    #[test]
    fn test_no_signal_is_unknown() {
        assert_eq!(classify(None, None), HardwareClass::Unknown);
        assert_eq!(classify(Some(0.0), Some("mystery/1.0")), HardwareClass::Unknown);
    }
}
