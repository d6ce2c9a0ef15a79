//! Pool configuration
//!
//! Layered from an optional `Orepool.toml` plus `OREPOOL_`-prefixed
//! environment overrides. Key names are kebab-case, matching the file
//! format; every section carries serde defaults so a minimal file runs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One listener endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EndpointConfig {
    /// Listen port; absent disables the endpoint
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ListenConfig {
    /// Stratum V1 only
    pub v1: EndpointConfig,
    /// Stratum V2 only
    pub v2: EndpointConfig,
    /// Both variants behind protocol detection
    pub dual: EndpointConfig,
    /// Bind host for every listener
    pub host: String,
    /// Responder static key, 32 bytes hex; generated fresh when absent
    pub noise_key: Option<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            v1: EndpointConfig { port: Some(3333) },
            v2: EndpointConfig { port: Some(3336) },
            dual: EndpointConfig { port: None },
            host: "0.0.0.0".to_string(),
            noise_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConnectionsConfig {
    pub max_total: usize,
    pub max_per_address: usize,
    /// Seconds of silence before the reaper closes a session
    pub idle_timeout: u64,
    /// Registry shards; must be a power of two
    pub shard_count: usize,
    /// Seconds a sticky deny lasts
    pub ban_duration: u64,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        ConnectionsConfig {
            max_total: 50_000,
            max_per_address: 32,
            idle_timeout: 600,
            shard_count: 16,
            ban_duration: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VardiffSection {
    /// Desired seconds between shares per device
    pub target_share_time: u64,
    /// Minimum seconds between retargets of one session
    pub retarget_window: u64,
    /// Intervals required before a retarget
    pub min_shares: usize,
    /// Per-step adjustment clamp factor
    pub adjustment_factor: f64,
}

impl Default for VardiffSection {
    fn default() -> Self {
        VardiffSection {
            target_share_time: 10,
            retarget_window: 60,
            min_shares: 5,
            adjustment_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SharePipelineConfig {
    /// Validation workers; 0 means one per core
    pub workers: usize,
    pub queue_size: usize,
    pub batch_size: usize,
    /// Batch flush window in milliseconds
    pub batch_timeout: u64,
    pub max_per_second_per_session: f64,
}

impl Default for SharePipelineConfig {
    fn default() -> Self {
        SharePipelineConfig {
            workers: 0,
            queue_size: 1024,
            batch_size: 100,
            batch_timeout: 10,
            max_per_second_per_session: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PplnsSection {
    /// Window size N in credited difficulty
    pub window_n: u64,
}

impl Default for PplnsSection {
    fn default() -> Self {
        PplnsSection { window_n: 100_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PoolSection {
    /// Pool fee as a fraction in [0, 1]
    pub fee_fraction: f64,
    /// Address the coinbase pays
    pub payout_address: String,
    /// scriptPubKey for the payout address; looked up via the node when
    /// absent
    pub payout_script: Option<String>,
    /// Entries below this amount carry over as dust
    pub minimum_payout: u64,
    /// Marker embedded in the coinbase
    pub coinbase_tag: String,
    /// Miner extranonce width for V1 sessions
    pub extranonce2_size: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        PoolSection {
            fee_fraction: 0.01,
            payout_address: String::new(),
            payout_script: None,
            minimum_payout: 0,
            coinbase_tag: "/orepool/".to_string(),
            extranonce2_size: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RpcSection {
    pub url: String,
    pub user: String,
    pub password: String,
    /// Per-call deadline in seconds
    pub timeout: u64,
    /// Template poll cadence in seconds
    pub poll_interval: u64,
}

impl Default for RpcSection {
    fn default() -> Self {
        RpcSection {
            url: "http://127.0.0.1:8332".to_string(),
            user: String::new(),
            password: String::new(),
            timeout: 30,
            poll_interval: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RecoverySection {
    pub check_interval: u64,
    pub check_hosts: Vec<String>,
    pub check_timeout: u64,
    pub failures_for_offline: u32,
    pub successes_for_online: u32,
    pub max_restarts_per_hour: u32,
    pub startup_timeout: u64,
    /// Service names in restart priority order
    pub order: Vec<String>,
}

impl Default for RecoverySection {
    fn default() -> Self {
        RecoverySection {
            check_interval: 30,
            check_hosts: vec!["1.1.1.1:53".to_string(), "8.8.8.8:53".to_string()],
            check_timeout: 5,
            failures_for_offline: 3,
            successes_for_online: 2,
            max_restarts_per_hour: 10,
            startup_timeout: 30,
            order: vec!["chain-rpc".to_string(), "job-provider".to_string()],
        }
    }
}

/// Complete pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PoolConfig {
    pub listen: ListenConfig,
    pub connections: ConnectionsConfig,
    pub vardiff: VardiffSection,
    pub share_pipeline: SharePipelineConfig,
    pub pplns: PplnsSection,
    pub pool: PoolSection,
    pub rpc: RpcSection,
    pub recovery: RecoverySection,
}

impl PoolConfig {
    /// Load from an optional file plus OREPOOL_* environment overrides
    pub fn load(path: Option<&Path>) -> Result<PoolConfig, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        } else {
            builder = builder.add_source(config::File::with_name("Orepool").required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("OREPOOL")
                .separator("__")
                .try_parsing(true),
        );
        let loaded: PoolConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.connections.shard_count.is_power_of_two() || self.connections.shard_count == 0 {
            return Err(ConfigError::Invalid(format!(
                "connections.shard-count must be a power of two, got {}",
                self.connections.shard_count
            )));
        }
        if !(0.0..=1.0).contains(&self.pool.fee_fraction) {
            return Err(ConfigError::Invalid(
                "pool.fee-fraction must be within [0, 1]".to_string(),
            ));
        }
        if self.listen.v1.port.is_none()
            && self.listen.v2.port.is_none()
            && self.listen.dual.port.is_none()
        {
            return Err(ConfigError::Invalid(
                "no listener configured; set one of listen.v1.port, listen.v2.port, listen.dual.port"
                    .to_string(),
            ));
        }
        if self.pool.payout_address.is_empty() && self.pool.payout_script.is_none() {
            return Err(ConfigError::Invalid(
                "pool.payout-address or pool.payout-script is required".to_string(),
            ));
        }
        if self.vardiff.adjustment_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "vardiff.adjustment-factor must be at least 1".to_string(),
            ));
        }
        if self.pplns.window_n == 0 {
            return Err(ConfigError::Invalid(
                "pplns.window-n must be positive".to_string(),
            ));
        }
        if self.pool.extranonce2_size == 0 || self.pool.extranonce2_size > 16 {
            return Err(ConfigError::Invalid(
                "pool.extranonce2-size must be within [1, 16]".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connections.idle_timeout)
    }

    /// Effective worker count; 0 resolves to the core count
    pub fn pipeline_workers(&self) -> usize {
        if self.share_pipeline.workers == 0 {
            num_cpus::get()
        } else {
            self.share_pipeline.workers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PoolConfig {
        PoolConfig {
            pool: PoolSection {
                payout_address: "bc1qpool".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_needs_only_an_address() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_shard_count_must_be_power_of_two() {
        let mut config = valid();
        config.connections.shard_count = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fee_fraction_bounds() {
        let mut config = valid();
        config.pool.fee_fraction = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_some_listener_required() {
        let mut config = valid();
        config.listen.v1.port = None;
        config.listen.v2.port = None;
        config.listen.dual.port = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payout_address_required() {
        let config = PoolConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kebab_case_keys_deserialize() {
        let toml = r#"
            [connections]
            max-total = 100
            max-per-address = 3
            shard-count = 8

            [pool]
            payout-address = "addr"
            fee-fraction = 0.02

            [vardiff]
            target-share-time = 12

            [share-pipeline]
            queue-size = 64
        "#;
        let config: PoolConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.connections.max_total, 100);
        assert_eq!(config.connections.max_per_address, 3);
        assert_eq!(config.pool.fee_fraction, 0.02);
        assert_eq!(config.vardiff.target_share_time, 12);
        assert_eq!(config.share_pipeline.queue_size, 64);
        assert!(config.validate().is_ok());
    }
}
