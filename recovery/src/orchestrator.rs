//! Ordered service recovery
//!
//! Walks the dependent services in priority order, skipping healthy ones
//! and restarting the rest with bounded retries and exponential backoff.
//! A per-hour restart cap keeps a flapping service from thrashing, and a
//! network-restored notification optionally resets that accounting before
//! the sweep. Only one recovery cycle runs at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::watchdog::NetworkState;
use crate::{ManagedService, RecoveryError};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Restart attempts per service per cycle
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// How long to poll for health after a restart
    pub startup_timeout: Duration,
    /// Health poll cadence within the startup window
    pub health_poll_interval: Duration,
    /// Restart budget per service per hour
    pub max_restarts_per_hour: u32,
    /// Reset the hourly accounting when connectivity is restored
    pub reset_on_restore: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(30),
            health_poll_interval: Duration::from_millis(500),
            max_restarts_per_hour: 10,
            reset_on_restore: true,
        }
    }
}

/// What one recovery cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Services restarted back to health, in order
    pub restarted: Vec<String>,
    /// Services already healthy or out of restart budget
    pub skipped: Vec<String>,
    /// Services that stayed unhealthy after all attempts
    pub failed: Vec<String>,
}

/// Ordered restart driver
pub struct RecoveryOrchestrator {
    config: OrchestratorConfig,
    /// Dependent services in priority order
    services: Vec<Arc<dyn ManagedService>>,
    in_progress: AtomicBool,
    /// Restart timestamps per service within the rolling hour
    restart_log: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RecoveryOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        services: Vec<Arc<dyn ManagedService>>,
    ) -> Arc<RecoveryOrchestrator> {
        Arc::new(RecoveryOrchestrator {
            config,
            services,
            in_progress: AtomicBool::new(false),
            restart_log: Mutex::new(HashMap::new()),
        })
    }

    /// Clear the per-service restart accounting
    pub fn reset_restart_counters(&self) {
        self.restart_log.lock().unwrap().clear();
        debug!("restart counters reset");
    }

    /// Restarts recorded for a service within the last hour
    pub fn restarts_this_hour(&self, service: &str) -> u32 {
        let mut log = self.restart_log.lock().unwrap();
        match log.get_mut(service) {
            Some(stamps) => {
                let hour_ago = Instant::now() - Duration::from_secs(3600);
                stamps.retain(|stamp| *stamp > hour_ago);
                stamps.len() as u32
            }
            None => 0,
        }
    }

    fn record_restart(&self, service: &str) {
        self.restart_log
            .lock()
            .unwrap()
            .entry(service.to_string())
            .or_default()
            .push(Instant::now());
    }

    /// Run one recovery cycle.
    ///
    /// Returns `RecoveryInProgress` without doing anything when another
    /// cycle is active.
    pub async fn run_recovery(&self, reset_counters: bool) -> Result<RecoveryReport, RecoveryError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RecoveryError::RecoveryInProgress);
        }
        let result = self.run_cycle(reset_counters).await;
        self.in_progress.store(false, Ordering::Release);
        Ok(result)
    }

    async fn run_cycle(&self, reset_counters: bool) -> RecoveryReport {
        if reset_counters {
            self.reset_restart_counters();
        }

        let mut report = RecoveryReport::default();
        for service in &self.services {
            let name = service.name().to_string();

            if service.is_healthy().await {
                debug!("{} healthy, skipping", name);
                report.skipped.push(name);
                continue;
            }
            if self.restarts_this_hour(&name) >= self.config.max_restarts_per_hour {
                warn!("{} over its hourly restart budget, skipping", name);
                report.skipped.push(name);
                continue;
            }

            info!("recovering {}", name);
            if self.restart_until_healthy(service.as_ref(), &name).await {
                report.restarted.push(name);
            } else {
                warn!("{} still unhealthy after {} attempts", name, self.config.max_attempts);
                report.failed.push(name);
            }
        }
        report
    }

    /// Up to max_attempts restarts with doubling backoff
    async fn restart_until_healthy(&self, service: &dyn ManagedService, name: &str) -> bool {
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let delay = self
                    .config
                    .base_delay
                    .saturating_mul(1 << attempt.min(16))
                    .min(self.config.max_delay);
                tokio::time::sleep(delay).await;
            }

            self.record_restart(name);
            if let Err(e) = service.restart().await {
                warn!("{} restart attempt {} failed: {}", name, attempt + 1, e);
                continue;
            }

            // Poll for health within the startup window
            let deadline = Instant::now() + self.config.startup_timeout;
            loop {
                if service.is_healthy().await {
                    info!("{} recovered on attempt {}", name, attempt + 1);
                    return true;
                }
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(self.config.health_poll_interval).await;
            }
        }
        false
    }

    /// Watch the network state and recover on restoration
    pub fn spawn(
        self: &Arc<Self>,
        mut network: watch::Receiver<NetworkState>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = network.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *network.borrow();
                        if state == NetworkState::Restored {
                            let reset = orchestrator.config.reset_on_restore;
                            match orchestrator.run_recovery(reset).await {
                                Ok(report) => {
                                    info!(
                                        "recovery cycle done: {} restarted, {} skipped, {} failed",
                                        report.restarted.len(),
                                        report.skipped.len(),
                                        report.failed.len()
                                    );
                                }
                                Err(RecoveryError::RecoveryInProgress) => {
                                    debug!("recovery already running");
                                }
                                Err(e) => warn!("recovery cycle failed: {}", e),
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Service stub that becomes healthy after N restarts
    struct FlakyService {
        name: String,
        restarts_needed: u32,
        restarts: AtomicU32,
        order_log: Arc<Mutex<Vec<String>>>,
    }

    impl FlakyService {
        fn new(name: &str, restarts_needed: u32, order_log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(FlakyService {
                name: name.to_string(),
                restarts_needed,
                restarts: AtomicU32::new(0),
                order_log,
            })
        }
    }

    #[async_trait]
    impl ManagedService for FlakyService {
        fn name(&self) -> &str {
            &self.name
        }

        async fn is_healthy(&self) -> bool {
            self.restarts.load(Ordering::SeqCst) >= self.restarts_needed
        }

        async fn restart(&self) -> Result<(), RecoveryError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            self.order_log.lock().unwrap().push(self.name.clone());
            Ok(())
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            startup_timeout: Duration::from_millis(50),
            health_poll_interval: Duration::from_millis(5),
            max_restarts_per_hour: 10,
            reset_on_restore: true,
        }
    }

    #[tokio::test]
    async fn test_ordered_restart_skips_healthy() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let healthy = FlakyService::new("chain-rpc", 0, order.clone());
        let broken_a = FlakyService::new("job-provider", 1, order.clone());
        let broken_b = FlakyService::new("listener", 1, order.clone());

        let orchestrator = RecoveryOrchestrator::new(
            fast_config(),
            vec![healthy, broken_a, broken_b],
        );
        let report = orchestrator.run_recovery(false).await.unwrap();

        assert_eq!(report.skipped, vec!["chain-rpc"]);
        assert_eq!(report.restarted, vec!["job-provider", "listener"]);
        assert!(report.failed.is_empty());
        // Priority order preserved
        assert_eq!(
            order.lock().unwrap().as_slice(),
            ["job-provider", "listener"]
        );
    }

    #[tokio::test]
    async fn test_retries_with_eventual_success() {
        let order = Arc::new(Mutex::new(Vec::new()));
        // Needs two restarts before reporting healthy
        let flaky = FlakyService::new("svc", 2, order);
        let orchestrator = RecoveryOrchestrator::new(fast_config(), vec![flaky]);
        let report = orchestrator.run_recovery(false).await.unwrap();
        assert_eq!(report.restarted, vec!["svc"]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let hopeless = FlakyService::new("svc", 100, order.clone());
        let orchestrator = RecoveryOrchestrator::new(fast_config(), vec![hopeless]);
        let report = orchestrator.run_recovery(false).await.unwrap();
        assert_eq!(report.failed, vec!["svc"]);
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_hourly_cap_skips() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let service = FlakyService::new("svc", 1, order);
        let mut config = fast_config();
        config.max_restarts_per_hour = 0;
        let orchestrator = RecoveryOrchestrator::new(config, vec![service]);
        let report = orchestrator.run_recovery(false).await.unwrap();
        assert_eq!(report.skipped, vec!["svc"]);
        assert!(report.restarted.is_empty());
    }

    #[tokio::test]
    async fn test_reset_on_restore_reopens_budget() {
        // The service sits at its cap; a reset-on-restore cycle clears the
        // accounting and restarts it
        let order = Arc::new(Mutex::new(Vec::new()));
        let service = FlakyService::new("svc", 1, order);
        let mut config = fast_config();
        config.max_restarts_per_hour = 10;
        let orchestrator = RecoveryOrchestrator::new(config, vec![service]);

        for _ in 0..10 {
            orchestrator.record_restart("svc");
        }
        assert_eq!(orchestrator.restarts_this_hour("svc"), 10);

        let report = orchestrator.run_recovery(true).await.unwrap();
        assert_eq!(report.restarted, vec!["svc"]);
    }

    #[tokio::test]
    async fn test_in_progress_guard() {
        struct SlowService;

        #[async_trait]
        impl ManagedService for SlowService {
            fn name(&self) -> &str {
                "slow"
            }

            async fn is_healthy(&self) -> bool {
                tokio::time::sleep(Duration::from_millis(100)).await;
                true
            }

            async fn restart(&self) -> Result<(), RecoveryError> {
                Ok(())
            }
        }

        let orchestrator =
            RecoveryOrchestrator::new(fast_config(), vec![Arc::new(SlowService)]);

        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_recovery(false).await })
        };
        // Give the first cycle time to take the guard
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = orchestrator.run_recovery(false).await;
        assert!(matches!(second, Err(RecoveryError::RecoveryInProgress)));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_restored_notification_triggers_cycle() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let service = FlakyService::new("svc", 1, order.clone());
        let orchestrator = RecoveryOrchestrator::new(fast_config(), vec![service]);

        let (network_tx, network_rx) = watch::channel(NetworkState::Online);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = orchestrator.spawn(network_rx, shutdown_rx);

        network_tx.send_replace(NetworkState::Restored);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(order.lock().unwrap().as_slice(), ["svc"]);

        drop(network_tx);
        let _ = handle.await;
    }
}
