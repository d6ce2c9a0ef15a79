//! Orepool Mining Layer
//!
//! Everything between the connection layer and the chain: hardware
//! classification, per-session variable difficulty, job generation from
//! block templates, the share validation pipeline, and the Stratum method
//! handlers that tie them to live sessions.

use thiserror::Error;

pub mod classifier;
pub mod handler;
pub mod jobs;
pub mod pipeline;
pub mod vardiff;

pub use classifier::{classify, classify_by_hashrate, classify_by_user_agent};
pub use handler::{HandlerConfig, StratumHandler};
pub use jobs::{JobProvider, JobProviderConfig};
pub use pipeline::{
    PipelineConfig, PipelineCounters, SharePipeline, ShareOutcome, SubmitRequest, Submitter,
};
pub use vardiff::{RetargetDecision, VardiffConfig, VardiffEngine};

/// Mining layer errors
#[derive(Error, Debug)]
pub enum MiningError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chain RPC error: {0}")]
    Rpc(#[from] orepool_rpc::RpcError),

    #[error("Storage error: {0}")]
    Storage(#[from] orepool_storage::StorageError),

    #[error("Template rejected: {0}")]
    BadTemplate(String),

    #[error("Pipeline queue closed")]
    PipelineClosed,
}
