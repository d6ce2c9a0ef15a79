//! Orepool - Main Entry Point
//!
//! Parses command-line arguments, loads the layered configuration, and
//! hands control to the pool coordinator. Exit codes: 0 clean shutdown,
//! 1 fatal configuration error, 2 fatal persistence error on startup,
//! 3 chain RPC unreachable after bounded retries.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info};

mod config;
mod coordinator;

use crate::config::PoolConfig;
use crate::coordinator::{PoolCoordinator, StartupError};

/// Command line arguments for the Orepool server
#[derive(Parser)]
#[clap(name = "orepool")]
#[clap(about = "Orepool - a dual-stratum mining pool server")]
struct Cli {
    /// Sets a custom config file
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the V1 listen port
    #[clap(long)]
    v1_port: Option<u16>,

    /// Override the V2 listen port
    #[clap(long)]
    v2_port: Option<u16>,

    /// Override the chain RPC URL
    #[clap(long)]
    rpc_url: Option<String>,

    /// Override the pool payout address
    #[clap(long)]
    payout_address: Option<String>,

    /// Verbosity level (0-5)
    #[clap(short, long, default_value = "2")]
    verbosity: u8,
}

/// Initialize logging based on verbosity level
fn init_logging(verbosity: u8) {
    let log_level = match verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    info!("starting orepool");

    let mut pool_config = match PoolConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    // Command-line overrides beat file and environment
    if cli.v1_port.is_some() {
        pool_config.listen.v1.port = cli.v1_port;
    }
    if cli.v2_port.is_some() {
        pool_config.listen.v2.port = cli.v2_port;
    }
    if let Some(url) = cli.rpc_url {
        pool_config.rpc.url = url;
    }
    if let Some(address) = cli.payout_address {
        pool_config.pool.payout_address = address;
    }
    if let Err(e) = pool_config.validate() {
        error!("{}", e);
        process::exit(1);
    }

    let coordinator = match PoolCoordinator::build(pool_config).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("{}", e);
            let code = match e {
                StartupError::Config(_) => 1,
                StartupError::Storage(_) => 2,
                StartupError::RpcUnreachable(_) => 3,
            };
            process::exit(code);
        }
    };

    coordinator.run_until_signal().await;
    info!("orepool stopped");
}
