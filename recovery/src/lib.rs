//! Orepool Service Recovery
//!
//! Two cooperating parts: a network watchdog probing external TCP
//! endpoints with hysteresis, and an orchestrator that restarts dependent
//! services in priority order once connectivity returns.

use async_trait::async_trait;
use thiserror::Error;

pub mod orchestrator;
pub mod watchdog;

pub use orchestrator::{OrchestratorConfig, RecoveryOrchestrator, RecoveryReport};
pub use watchdog::{NetworkState, NetworkWatchdog, ReachabilityTracker, WatchdogConfig};

/// Recovery errors
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("A recovery cycle is already in progress")]
    RecoveryInProgress,

    #[error("Service {0} failed to recover")]
    ServiceFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A dependent service the orchestrator can observe and restart
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// Stable service name used for ordering and restart accounting
    fn name(&self) -> &str;

    /// Whether the service currently functions
    async fn is_healthy(&self) -> bool;

    /// Attempt a restart; health is polled separately afterwards
    async fn restart(&self) -> Result<(), RecoveryError>;
}
