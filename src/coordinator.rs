//! Pool coordinator
//!
//! Wires every component, owns the process lifecycle, and surfaces the
//! headline counters. Construction runs leaves-first (storage, chain RPC,
//! jobs, pipeline, sessions, listeners, recovery); shutdown walks the same
//! order forwards: stop accepting, flush the share buffer, drain egress
//! within the grace window, close sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use orepool_core::{PayoutEntry, PayoutStatus, Sha256d};
use orepool_mining::{
    HandlerConfig, JobProvider, JobProviderConfig, PipelineConfig, SharePipeline, StratumHandler,
    VardiffConfig, VardiffEngine,
};
use orepool_payout::{PplnsAllocator, PplnsConfig};
use orepool_recovery::{
    ManagedService, NetworkWatchdog, OrchestratorConfig, RecoveryError, RecoveryOrchestrator,
    WatchdogConfig,
};
use orepool_rpc::{ChainRpc, HttpChainRpc, RpcConfig};
use orepool_server::{
    ConnectionManager, DisconnectReason, ListenerConfig, ManagerConfig, PoolListener,
    ServerCounters,
};
use orepool_storage::{MemoryShareStore, ShareStore};

use crate::config::PoolConfig;

/// Fatal startup failures, mapped to process exit codes by main
#[derive(Debug)]
pub enum StartupError {
    /// Exit 1: configuration is unusable at runtime
    Config(String),
    /// Exit 2: persistence failed to initialize
    Storage(String),
    /// Exit 3: the chain RPC stayed unreachable through bounded retries
    RpcUnreachable(String),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(msg) => write!(f, "configuration error: {}", msg),
            StartupError::Storage(msg) => write!(f, "persistence error: {}", msg),
            StartupError::RpcUnreachable(msg) => write!(f, "chain RPC unreachable: {}", msg),
        }
    }
}

/// Startup RPC probe budget
const STARTUP_RPC_ATTEMPTS: u32 = 5;
const STARTUP_RPC_DELAY: Duration = Duration::from_secs(2);

/// Snapshot of the pool's headline counters
#[derive(Debug, Clone, Default)]
pub struct PoolStatus {
    pub active_sessions: usize,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub blocks_found: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub share_queue_depth: u64,
    pub dust_accumulated: u64,
}

/// Top-level wiring and lifecycle
pub struct PoolCoordinator {
    config: PoolConfig,
    manager: Arc<ConnectionManager>,
    handler: Arc<StratumHandler>,
    provider: Arc<JobProvider>,
    pipeline_counters: Arc<orepool_mining::PipelineCounters>,
    server_counters: Arc<ServerCounters>,
    store: Arc<dyn ShareStore>,
    dust_account: Arc<AtomicU64>,

    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolCoordinator {
    /// Build the whole pool. Fails with an exit-code-mapped error.
    pub async fn build(config: PoolConfig) -> Result<PoolCoordinator, StartupError> {
        // Persistence first: everything downstream records through it. A
        // write probe surfaces an unusable backend before any listener
        // opens.
        let store: Arc<dyn ShareStore> = Arc::new(MemoryShareStore::new());
        store
            .insert_shares(Vec::new(), Duration::from_secs(5))
            .await
            .map_err(|e| StartupError::Storage(e.to_string()))?;

        // Chain RPC with a bounded startup probe
        let rpc: Arc<dyn ChainRpc> = Arc::new(
            HttpChainRpc::new(RpcConfig {
                url: config.rpc.url.clone(),
                user: config.rpc.user.clone(),
                password: config.rpc.password.clone(),
                timeout_secs: config.rpc.timeout,
            })
            .map_err(|e| StartupError::RpcUnreachable(e.to_string()))?,
        );
        probe_rpc(rpc.as_ref()).await?;

        let payout_script = resolve_payout_script(&config, rpc.as_ref()).await?;

        let provider = JobProvider::new(
            JobProviderConfig {
                poll_interval: Duration::from_secs(config.rpc.poll_interval),
                extranonce2_size: config.pool.extranonce2_size,
                coinbase_tag: config.pool.coinbase_tag.clone(),
                payout_script_hex: payout_script,
                ..Default::default()
            },
            rpc.clone(),
            Arc::new(Sha256d),
        );

        let (pipeline, submitter, events) = SharePipeline::new(
            PipelineConfig {
                workers: config.pipeline_workers(),
                queue_size: config.share_pipeline.queue_size,
                batch_size: config.share_pipeline.batch_size,
                batch_timeout: Duration::from_millis(config.share_pipeline.batch_timeout),
                max_shares_per_second: config.share_pipeline.max_per_second_per_session,
                store_deadline: Duration::from_secs(5),
            },
            provider.clone(),
            Arc::new(Sha256d),
            store.clone(),
            rpc.clone(),
        );
        let pipeline_counters = pipeline.counters();

        let vardiff = Arc::new(VardiffEngine::new(VardiffConfig {
            target_share_time: Duration::from_secs(config.vardiff.target_share_time),
            retarget_window: Duration::from_secs(config.vardiff.retarget_window),
            min_shares: config.vardiff.min_shares,
            adjustment_factor: config.vardiff.adjustment_factor,
            ..Default::default()
        }));

        let manager = ConnectionManager::new(ManagerConfig {
            shard_count: config.connections.shard_count,
            max_total: config.connections.max_total,
            max_per_address: config.connections.max_per_address,
            idle_timeout: config.idle_timeout(),
            reap_interval: Duration::from_secs(60),
            ban_duration: Duration::from_secs(config.connections.ban_duration),
        });

        let handler = StratumHandler::new(
            HandlerConfig::default(),
            manager.clone(),
            provider.clone(),
            vardiff,
            submitter,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_counters = ServerCounters::new();

        let mut coordinator = PoolCoordinator {
            config,
            manager,
            handler,
            provider,
            pipeline_counters,
            server_counters,
            store,
            dust_account: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
            tasks: Vec::new(),
        };
        coordinator.start(pipeline, events, shutdown_rx).await?;
        Ok(coordinator)
    }

    /// Spawn every long-running task, leaves first
    async fn start(
        &mut self,
        pipeline: Arc<SharePipeline>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<orepool_core::BlockFound>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), StartupError> {
        // Pipeline workers and batch writer
        self.tasks.extend(pipeline.spawn());

        // Job provider poll loop plus the first template
        self.provider
            .refresh()
            .await
            .map_err(|e| StartupError::RpcUnreachable(e.to_string()))?;
        self.tasks.push(self.provider.spawn(shutdown.clone()));

        // Job announcements to live sessions
        {
            let handler = self.handler.clone();
            let mut jobs = self.provider.subscribe();
            let mut task_shutdown = shutdown.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = jobs.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let job = jobs.borrow().clone();
                            if let Some(job) = job {
                                handler.announce_job(&job);
                            }
                        }
                        changed = task_shutdown.changed() => {
                            if changed.is_err() || *task_shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Block-found events drive PPLNS allocation
        {
            let store = self.store.clone();
            let allocator = PplnsAllocator::new(PplnsConfig {
                window_n: self.config.pplns.window_n,
                fee_fraction: self.config.pool.fee_fraction,
                minimum_payout: self.config.pool.minimum_payout,
            })
            .map_err(|e| StartupError::Config(e.to_string()))?;
            let payout_address = self.config.pool.payout_address.clone();
            let dust_account = self.dust_account.clone();
            self.tasks.push(tokio::spawn(async move {
                while let Some(found) = events.recv().await {
                    info!(
                        "distributing block {} at height {}",
                        hex::encode(found.block_hash),
                        found.height
                    );
                    if let Err(e) = allocate_block(
                        &allocator,
                        store.as_ref(),
                        &payout_address,
                        &dust_account,
                        &found,
                    )
                    .await
                    {
                        error!("payout allocation failed: {}", e);
                    }
                }
            }));
        }

        // Connection registry reaper
        self.tasks.push(self.manager.spawn_idle_reaper(shutdown.clone()));

        // Listeners
        let noise_keypair = match &self.config.listen.noise_key {
            Some(hex_key) => orepool_protocol::NoiseKeypair::from_private_hex(hex_key)
                .map_err(|e| StartupError::Config(e.to_string()))?,
            None => orepool_protocol::NoiseKeypair::generate()
                .map_err(|e| StartupError::Config(e.to_string()))?,
        };

        let mut endpoints = Vec::new();
        if let Some(port) = self.config.listen.v1.port {
            endpoints.push((port, true, false));
        }
        if let Some(port) = self.config.listen.v2.port {
            endpoints.push((port, false, true));
        }
        if let Some(port) = self.config.listen.dual.port {
            endpoints.push((port, true, true));
        }
        for (port, accept_v1, accept_v2) in endpoints {
            let bind_addr = format!("{}:{}", self.config.listen.host, port)
                .parse()
                .map_err(|e| StartupError::Config(format!("bad listen address: {}", e)))?;
            let listener = PoolListener::new(
                ListenerConfig {
                    bind_addr,
                    accept_v1,
                    accept_v2,
                    ..Default::default()
                },
                self.manager.clone(),
                self.handler.clone(),
                self.server_counters.clone(),
                accept_v2.then(|| noise_keypair.clone()),
            )
            .map_err(|e| StartupError::Config(e.to_string()))?;
            let listener_shutdown = shutdown.clone();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = listener.run(listener_shutdown).await {
                    error!("listener failed: {}", e);
                }
            }));
        }

        // Recovery: watchdog plus ordered restarts
        let watchdog = NetworkWatchdog::new(WatchdogConfig {
            check_interval: Duration::from_secs(self.config.recovery.check_interval),
            check_hosts: self.config.recovery.check_hosts.clone(),
            check_timeout: Duration::from_secs(self.config.recovery.check_timeout),
            failures_for_offline: self.config.recovery.failures_for_offline,
            successes_for_online: self.config.recovery.successes_for_online,
        });
        let network_rx = watchdog.subscribe();
        self.tasks.push(watchdog.spawn(shutdown.clone()));

        let orchestrator = RecoveryOrchestrator::new(
            OrchestratorConfig {
                max_restarts_per_hour: self.config.recovery.max_restarts_per_hour,
                startup_timeout: Duration::from_secs(self.config.recovery.startup_timeout),
                ..Default::default()
            },
            self.recovery_services(),
        );
        self.tasks.push(orchestrator.spawn(network_rx, shutdown.clone()));

        info!("pool started");
        Ok(())
    }

    /// Dependent services in the configured priority order
    fn recovery_services(&self) -> Vec<Arc<dyn ManagedService>> {
        let mut services: Vec<Arc<dyn ManagedService>> = Vec::new();
        for name in &self.config.recovery.order {
            match name.as_str() {
                "chain-rpc" => services.push(Arc::new(JobSourceService {
                    provider: self.provider.clone(),
                    refresh_on_restart: false,
                })),
                "job-provider" => services.push(Arc::new(JobSourceService {
                    provider: self.provider.clone(),
                    refresh_on_restart: true,
                })),
                other => warn!("unknown recovery service '{}' ignored", other),
            }
        }
        services
    }

    /// Counter snapshot for the observability surface
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            active_sessions: self.manager.active_count(),
            shares_accepted: self.pipeline_counters.accepted.load(Ordering::Relaxed),
            shares_rejected: self
                .pipeline_counters
                .rejected_stale
                .load(Ordering::Relaxed)
                + self
                    .pipeline_counters
                    .rejected_duplicate
                    .load(Ordering::Relaxed)
                + self
                    .pipeline_counters
                    .rejected_low_difficulty
                    .load(Ordering::Relaxed)
                + self.pipeline_counters.rejected_invalid.load(Ordering::Relaxed),
            blocks_found: self.pipeline_counters.blocks_found.load(Ordering::Relaxed),
            bytes_in: self.server_counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.server_counters.bytes_out.load(Ordering::Relaxed),
            share_queue_depth: self.pipeline_counters.queue_depth.load(Ordering::Relaxed),
            dust_accumulated: self.dust_account.load(Ordering::Relaxed),
        }
    }

    /// Run until a shutdown signal, then stop components in forward order
    pub async fn run_until_signal(mut self) {
        let mut status_ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("signal handler failed: {}", e);
                    }
                    break;
                }
                _ = status_ticker.tick() => {
                    let status = self.status();
                    info!(
                        "sessions {} | accepted {} rejected {} | blocks {} | io {}B/{}B | queue {}",
                        status.active_sessions,
                        status.shares_accepted,
                        status.shares_rejected,
                        status.blocks_found,
                        status.bytes_in,
                        status.bytes_out,
                        status.share_queue_depth,
                    );
                }
            }
        }

        info!("shutting down");
        // Ask V2 clients to move before the listeners go away
        self.handler.announce_reconnect("", 0);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Stop accepting, close sessions, let pushers drain within grace
        let _ = self.shutdown_tx.send(true);
        self.manager.close_all(DisconnectReason::Shutdown);

        // The share buffer flushes as workers wind down; one shared grace
        // window bounds the whole teardown
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut stragglers = 0;
        for task in self.tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                stragglers += 1;
            }
        }
        if stragglers > 0 {
            warn!("{} tasks did not stop within the grace window", stragglers);
        }
        info!("shutdown complete");
    }
}

/// Bounded startup probe against the chain RPC
async fn probe_rpc(rpc: &dyn ChainRpc) -> Result<(), StartupError> {
    let mut last_error = String::new();
    for attempt in 1..=STARTUP_RPC_ATTEMPTS {
        match rpc.get_block_count().await {
            Ok(height) => {
                info!("chain RPC reachable at height {}", height);
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "chain RPC probe {}/{} failed: {}",
                    attempt, STARTUP_RPC_ATTEMPTS, e
                );
                last_error = e.to_string();
            }
        }
        tokio::time::sleep(STARTUP_RPC_DELAY).await;
    }
    Err(StartupError::RpcUnreachable(last_error))
}

/// The coinbase needs a scriptPubKey; take it from config or ask the node
async fn resolve_payout_script(
    config: &PoolConfig,
    rpc: &dyn ChainRpc,
) -> Result<String, StartupError> {
    if let Some(script) = &config.pool.payout_script {
        return Ok(script.clone());
    }
    let validated = rpc
        .validate_address(&config.pool.payout_address)
        .await
        .map_err(|e| StartupError::RpcUnreachable(e.to_string()))?;
    if !validated.is_valid {
        return Err(StartupError::Config(format!(
            "payout address {} rejected by the node",
            config.pool.payout_address
        )));
    }
    validated.script_pubkey.ok_or_else(|| {
        StartupError::Config(
            "node did not return a scriptPubKey; set pool.payout-script".to_string(),
        )
    })
}

/// PPLNS allocation and persistence for one found block
async fn allocate_block(
    allocator: &PplnsAllocator,
    store: &dyn ShareStore,
    payout_address: &str,
    dust_total: &AtomicU64,
    found: &orepool_core::BlockFound,
) -> Result<(), orepool_storage::StorageError> {
    let window = store
        .read_shares_reverse_until(found.share_seq, allocator.window_n(), Duration::from_secs(10))
        .await?;

    let allocation = allocator.allocate(found.reward, &window, found.block_hash);
    if allocation.payouts.is_empty() && allocation.dust == 0 {
        info!("empty allocation for block at height {}", found.height);
        return Ok(());
    }

    let mut payouts = allocation.payouts;
    if allocation.dust > 0 {
        // The operator's account absorbs truncation and sub-minimum dust
        dust_total.fetch_add(allocation.dust, Ordering::Relaxed);
        payouts.push(PayoutEntry {
            recipient: payout_address.to_string(),
            amount: allocation.dust,
            source_block: found.block_hash,
            status: PayoutStatus::Pending,
        });
    }

    let count = payouts.len();
    store.insert_payouts(payouts, Duration::from_secs(10)).await?;
    info!(
        "recorded {} payout entries for height {}",
        count, found.height
    );
    Ok(())
}

/// Recovery adapter over the job source. `chain-rpc` health is the
/// provider's view of the chain; `job-provider` restart forces a refresh.
struct JobSourceService {
    provider: Arc<JobProvider>,
    refresh_on_restart: bool,
}

#[async_trait]
impl ManagedService for JobSourceService {
    fn name(&self) -> &str {
        if self.refresh_on_restart {
            "job-provider"
        } else {
            "chain-rpc"
        }
    }

    async fn is_healthy(&self) -> bool {
        self.provider.current_job().is_some()
    }

    async fn restart(&self) -> Result<(), RecoveryError> {
        if self.refresh_on_restart {
            self.provider.request_refresh();
        }
        Ok(())
    }
}
