//! Share validation pipeline
//!
//! Submissions enter a bounded queue and are drained by a worker pool in
//! small batches. Each share is validated in order: job lookup, duplicate
//! check, proof reconstruction, target check, credit stamping. Accepted
//! shares flow to a single batch writer that persists them with a
//! monotonic sequence; a share that also meets the network target is
//! flushed immediately, submitted to the chain, and emitted as a
//! block-found event.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use orepool_core::{
    BlockFound, ConnectionId, Job, JobId, PowHash, RejectReason, Share, ShareVerdict, Target,
};
use orepool_rpc::ChainRpc;
use orepool_storage::{BlockRecord, ShareStore};
use orepool_util::{now_unix, TokenBucket};

use crate::jobs::JobProvider;
use crate::MiningError;

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Validation workers; defaults to the core count
    pub workers: usize,
    /// Bounded submission queue capacity
    pub queue_size: usize,
    /// Max shares per validation batch
    pub batch_size: usize,
    /// Flush window while filling a batch
    pub batch_timeout: Duration,
    /// Per-session accepted-share rate budget
    pub max_shares_per_second: f64,
    /// Deadline passed to the storage port
    pub store_deadline: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workers: num_cpus::get(),
            queue_size: 1024,
            batch_size: 100,
            batch_timeout: Duration::from_millis(10),
            max_shares_per_second: 20.0,
            store_deadline: Duration::from_secs(5),
        }
    }
}

/// One submission, snapshotted at receipt time.
///
/// `share_target` is the session target at submission; it is what the
/// share gets credited at regardless of later retargets.
#[derive(Debug)]
pub struct SubmitRequest {
    pub connection: ConnectionId,
    pub worker: String,
    pub remote_ip: IpAddr,
    pub extranonce1: Vec<u8>,
    pub share_target: u64,
    pub job_id: JobId,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
}

/// Validation result returned to the submitting handler
#[derive(Debug, Clone, Copy)]
pub struct ShareOutcome {
    pub verdict: ShareVerdict,
    pub credited_difficulty: u64,
    pub block_found: bool,
}

impl ShareOutcome {
    fn rejected(reason: RejectReason) -> ShareOutcome {
        ShareOutcome {
            verdict: ShareVerdict::Rejected(reason),
            credited_difficulty: 0,
            block_found: false,
        }
    }
}

/// Atomic pipeline statistics
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub submitted: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected_stale: AtomicU64,
    pub rejected_duplicate: AtomicU64,
    pub rejected_low_difficulty: AtomicU64,
    pub rejected_invalid: AtomicU64,
    pub rate_limited: AtomicU64,
    pub blocks_found: AtomicU64,
    pub queue_depth: AtomicU64,
}

impl PipelineCounters {
    fn count_verdict(&self, verdict: &ShareVerdict) {
        match verdict {
            ShareVerdict::Accepted => self.accepted.fetch_add(1, Ordering::Relaxed),
            ShareVerdict::Rejected(RejectReason::Stale) => {
                self.rejected_stale.fetch_add(1, Ordering::Relaxed)
            }
            ShareVerdict::Rejected(RejectReason::Duplicate) => {
                self.rejected_duplicate.fetch_add(1, Ordering::Relaxed)
            }
            ShareVerdict::Rejected(RejectReason::LowDifficulty) => {
                self.rejected_low_difficulty.fetch_add(1, Ordering::Relaxed)
            }
            ShareVerdict::Rejected(RejectReason::RateLimited) => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed)
            }
            ShareVerdict::Rejected(_) => self.rejected_invalid.fetch_add(1, Ordering::Relaxed),
        };
    }
}

struct QueueItem {
    request: SubmitRequest,
    respond: oneshot::Sender<ShareOutcome>,
}

/// Cloneable submission handle used by the stratum handlers
#[derive(Clone)]
pub struct Submitter {
    tx: mpsc::Sender<QueueItem>,
    buckets: Arc<Mutex<HashMap<ConnectionId, TokenBucket>>>,
    counters: Arc<PipelineCounters>,
    max_rate: f64,
}

impl Submitter {
    /// Validate one submission, waiting for its verdict.
    ///
    /// Submissions from one session are processed in submission order
    /// because the caller (the session's inbound task) awaits each verdict
    /// before reading the next frame.
    pub async fn submit(&self, request: SubmitRequest) -> Result<ShareOutcome, MiningError> {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        // Rate limiting happens before the queue so floods cannot crowd
        // out well-behaved sessions
        let over_rate = {
            let mut buckets = self.buckets.lock().unwrap();
            let bucket = buckets
                .entry(request.connection)
                .or_insert_with(|| TokenBucket::new(self.max_rate, self.max_rate.max(1.0) * 2.0));
            !bucket.try_take()
        };
        if over_rate {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Ok(ShareOutcome::rejected(RejectReason::RateLimited));
        }

        let (respond, verdict) = oneshot::channel();
        self.counters.queue_depth.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(QueueItem { request, respond })
            .await
            .map_err(|_| MiningError::PipelineClosed)?;
        verdict.await.map_err(|_| MiningError::PipelineClosed)
    }

    /// Drop a session's rate-limiter state
    pub fn forget_session(&self, id: ConnectionId) {
        self.buckets.lock().unwrap().remove(&id);
    }
}

enum BatchCmd {
    Store(Share),
    /// Persist a block-discovering share; the ack carries its sequence
    StoreForBlock(Share, oneshot::Sender<Option<u64>>),
}

type DupKey = (Vec<u8>, Vec<u8>, u32, u32);

/// The validating worker pool plus its batch writer
pub struct SharePipeline {
    config: PipelineConfig,
    provider: Arc<JobProvider>,
    pow: Arc<dyn PowHash>,
    store: Arc<dyn ShareStore>,
    rpc: Arc<dyn ChainRpc>,
    counters: Arc<PipelineCounters>,

    queue_rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
    batch_tx: mpsc::Sender<BatchCmd>,
    batch_rx: Mutex<Option<mpsc::Receiver<BatchCmd>>>,
    events_tx: mpsc::UnboundedSender<BlockFound>,

    /// Seen proofs per job, pruned as jobs expire
    dup_sets: Mutex<HashMap<JobId, HashSet<DupKey>>>,
}

impl SharePipeline {
    /// Build the pipeline; returns the submission handle and the
    /// block-found event stream
    pub fn new(
        config: PipelineConfig,
        provider: Arc<JobProvider>,
        pow: Arc<dyn PowHash>,
        store: Arc<dyn ShareStore>,
        rpc: Arc<dyn ChainRpc>,
    ) -> (
        Arc<SharePipeline>,
        Submitter,
        mpsc::UnboundedReceiver<BlockFound>,
    ) {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        let (batch_tx, batch_rx) = mpsc::channel(config.queue_size.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(PipelineCounters::default());

        let submitter = Submitter {
            tx: queue_tx,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            counters: counters.clone(),
            max_rate: config.max_shares_per_second,
        };

        let pipeline = Arc::new(SharePipeline {
            config,
            provider,
            pow,
            store,
            rpc,
            counters,
            queue_rx: Mutex::new(Some(queue_rx)),
            batch_tx,
            batch_rx: Mutex::new(Some(batch_rx)),
            events_tx,
            dup_sets: Mutex::new(HashMap::new()),
        });
        (pipeline, submitter, events_rx)
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.counters.clone()
    }

    /// Spawn the workers and the batch writer.
    ///
    /// The single queue receiver is shared behind an async mutex; a worker
    /// holds it only while collecting a batch, then validates in parallel
    /// with the others.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let queue_rx = self
            .queue_rx
            .lock()
            .unwrap()
            .take()
            .expect("pipeline spawned twice");
        let shared_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

        for worker_id in 0..self.config.workers.max(1) {
            let pipeline = self.clone();
            let rx = shared_rx.clone();
            handles.push(tokio::spawn(async move {
                pipeline.worker_loop(worker_id, rx).await;
            }));
        }

        let batch_rx = self
            .batch_rx
            .lock()
            .unwrap()
            .take()
            .expect("pipeline spawned twice");
        let pipeline = self.clone();
        handles.push(tokio::spawn(async move {
            pipeline.batch_writer_loop(batch_rx).await;
        }));

        handles
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        shared_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem>>>,
    ) {
        debug!("share worker {} running", worker_id);
        loop {
            let batch = {
                let mut rx = shared_rx.lock().await;
                match self.collect_batch(&mut rx).await {
                    Some(batch) => batch,
                    None => break,
                }
            };
            self.counters
                .queue_depth
                .fetch_sub(batch.len() as u64, Ordering::Relaxed);

            for item in batch {
                let outcome = self.process_one(&item.request).await;
                self.counters.count_verdict(&outcome.verdict);
                // The submitter may have given up; that is fine
                let _ = item.respond.send(outcome);
            }
        }
        debug!("share worker {} stopped", worker_id);
    }

    /// Collect up to batch_size items, waiting at most batch_timeout after
    /// the first. Returns None when the queue is closed and empty.
    async fn collect_batch(
        &self,
        rx: &mut mpsc::Receiver<QueueItem>,
    ) -> Option<Vec<QueueItem>> {
        let first = rx.recv().await?;
        let mut batch = Vec::with_capacity(self.config.batch_size);
        batch.push(first);

        let deadline = tokio::time::Instant::now() + self.config.batch_timeout;
        while batch.len() < self.config.batch_size {
            match timeout(deadline.saturating_duration_since(tokio::time::Instant::now()), rx.recv())
                .await
            {
                Ok(Some(item)) => batch.push(item),
                Ok(None) | Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Validate one submission in the order the pipeline guarantees
    async fn process_one(&self, request: &SubmitRequest) -> ShareOutcome {
        // 1. Job lookup: unknown id, then staleness
        let job = match self.provider.lookup(request.job_id) {
            Some(job) => job,
            None => return ShareOutcome::rejected(RejectReason::UnknownJob),
        };
        if self.provider.is_stale(&job) {
            return ShareOutcome::rejected(RejectReason::Stale);
        }

        // Submitted fields must be shaped for this job
        if request.extranonce2.len() != self.provider.extranonce2_size()
            && !request.extranonce2.is_empty()
        {
            return ShareOutcome::rejected(RejectReason::InvalidProof);
        }
        if !job.ntime_in_window(request.ntime) {
            return ShareOutcome::rejected(RejectReason::InvalidProof);
        }

        // 2. Duplicate check on the full proof tuple
        let dup_key: DupKey = (
            request.extranonce1.clone(),
            request.extranonce2.clone(),
            request.ntime,
            request.nonce,
        );
        {
            let mut dup_sets = self.dup_sets.lock().unwrap();
            let seen = dup_sets.entry(request.job_id).or_default();
            if !seen.insert(dup_key) {
                return ShareOutcome::rejected(RejectReason::Duplicate);
            }
        }
        self.prune_dup_sets();

        // 3. Proof reconstruction and hash evaluation
        let coinbase = job.build_coinbase(&request.extranonce1, &request.extranonce2);
        let coinbase_txid = orepool_core::pow::sha256d(&coinbase);
        let merkle_root = job.merkle_root(&coinbase_txid);
        let header = job.serialize_header(&merkle_root, request.ntime, request.nonce);
        let hash = self.pow.pow_hash(&header);

        // 4. Target checks: session target for credit, network for a block
        let share_threshold = Target::from_difficulty(request.share_target);
        if !share_threshold.meets(&hash) {
            return ShareOutcome::rejected(RejectReason::LowDifficulty);
        }
        let block_candidate = job.network_target.meets(&hash);

        // 5. Credit stamping at the submission-time target
        let share = Share {
            worker: request.worker.clone(),
            job_id: request.job_id,
            extranonce2: request.extranonce2.clone(),
            ntime: request.ntime,
            nonce: request.nonce,
            submitted_at: now_unix(),
            credited_difficulty: request.share_target,
            verdict: ShareVerdict::Accepted,
            block_candidate,
            hash: Some(hash),
        };

        if block_candidate {
            self.handle_block_candidate(&job, share.clone(), &coinbase, &header)
                .await;
        } else if self.batch_tx.send(BatchCmd::Store(share)).await.is_err() {
            error!("batch writer gone; share dropped from persistence");
        }

        ShareOutcome {
            verdict: ShareVerdict::Accepted,
            credited_difficulty: request.share_target,
            block_found: block_candidate,
        }
    }

    /// A share met the network target: persist it first (its sequence is
    /// the payout window bound), then submit the block and announce it
    async fn handle_block_candidate(
        &self,
        job: &Arc<Job>,
        share: Share,
        coinbase: &[u8],
        header: &[u8; 80],
    ) {
        let block_hash = self.provider.header_hash(header);
        info!(
            "block candidate at height {} by {} (job {})",
            job.height, share.worker, job.id
        );

        let worker = share.worker.clone();
        let share_for_event = share.clone();
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .batch_tx
            .send(BatchCmd::StoreForBlock(share, ack_tx))
            .await
            .is_err()
        {
            error!("batch writer gone; block share not persisted");
            return;
        }
        let share_seq = match ack_rx.await {
            Ok(Some(seq)) => seq,
            _ => {
                // Persistence failure here poisons payout accounting;
                // surface loudly and skip allocation for this block
                error!("block share persistence failed; payout allocation skipped");
                return;
            }
        };

        match self.provider.assemble_block(job.id, coinbase, header) {
            Some(block_hex) => match self.rpc.submit_block(&block_hex).await {
                Ok(None) => {
                    info!("block at height {} accepted by the chain", job.height);
                }
                Ok(Some(reason)) => {
                    warn!("chain rejected block at height {}: {}", job.height, reason);
                }
                Err(e) => {
                    warn!("submitblock failed at height {}: {}", job.height, e);
                }
            },
            None => {
                warn!("job {} expired before block assembly", job.id);
            }
        }

        self.counters.blocks_found.fetch_add(1, Ordering::Relaxed);
        let record = BlockRecord {
            hash: block_hash,
            height: job.height,
            reward: job.reward,
            found_by: worker,
            share_seq,
            found_at: now_unix(),
        };
        if let Err(e) = self
            .store
            .record_block(record, self.config.store_deadline)
            .await
        {
            error!("failed to record found block: {}", e);
        }

        let event = BlockFound {
            block_hash,
            height: job.height,
            reward: job.reward,
            share: share_for_event,
            share_seq,
        };
        let _ = self.events_tx.send(event);

        // New tip: refresh immediately rather than waiting for the poll
        self.provider.request_refresh();
    }

    /// Drop duplicate-tracking for jobs that no longer resolve
    fn prune_dup_sets(&self) {
        let mut dup_sets = self.dup_sets.lock().unwrap();
        if dup_sets.len() <= 64 {
            return;
        }
        let provider = &self.provider;
        dup_sets.retain(|job_id, _| provider.lookup(*job_id).is_some());
    }

    /// Accumulates accepted shares and writes them in batches.
    ///
    /// One consumer task owns the storage handle; block-discovering shares
    /// force an immediate flush so their sequence is known right away.
    async fn batch_writer_loop(self: Arc<Self>, mut rx: mpsc::Receiver<BatchCmd>) {
        let mut pending: Vec<Share> = Vec::with_capacity(self.config.batch_size);
        let mut acks: Vec<(usize, oneshot::Sender<Option<u64>>)> = Vec::new();

        loop {
            // Idle: wait without a timer. With work pending: flush once the
            // window expires.
            let cmd = if pending.is_empty() {
                rx.recv().await
            } else {
                match timeout(self.config.batch_timeout, rx.recv()).await {
                    Ok(cmd) => cmd,
                    Err(_) => {
                        self.flush(&mut pending, &mut acks).await;
                        continue;
                    }
                }
            };

            let mut urgent = false;
            match cmd {
                Some(BatchCmd::Store(share)) => pending.push(share),
                Some(BatchCmd::StoreForBlock(share, ack)) => {
                    pending.push(share);
                    acks.push((pending.len() - 1, ack));
                    urgent = true;
                }
                None => {
                    // Queue closed: final flush, then exit
                    self.flush(&mut pending, &mut acks).await;
                    break;
                }
            }

            if urgent || pending.len() >= self.config.batch_size {
                self.flush(&mut pending, &mut acks).await;
            }
        }
        debug!("batch writer stopped");
    }

    async fn flush(
        &self,
        pending: &mut Vec<Share>,
        acks: &mut Vec<(usize, oneshot::Sender<Option<u64>>)>,
    ) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        let batch_len = batch.len();
        match self
            .store
            .insert_shares(batch, self.config.store_deadline)
            .await
        {
            Ok(seqs) => {
                for (index, ack) in acks.drain(..) {
                    let _ = ack.send(seqs.get(index).copied());
                }
            }
            Err(e) => {
                // All-or-nothing: the whole batch failed
                error!("share batch of {} failed: {}", batch_len, e);
                for (_, ack) in acks.drain(..) {
                    let _ = ack.send(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobProvider, JobProviderConfig};
    use async_trait::async_trait;
    use orepool_core::Hash;
    use orepool_rpc::{
        BlockTemplate, BlockchainInfo, EstimateSmartFee, MiningInfo, NetworkInfo, RpcError,
        ValidatedAddress,
    };
    use orepool_storage::MemoryShareStore;
    use std::sync::atomic::AtomicBool;

    /// Hash stub returning a fixed digest
    struct FixedPow(Hash);

    impl PowHash for FixedPow {
        fn algorithm(&self) -> &'static str {
            "fixed"
        }

        fn pow_hash(&self, _header: &[u8]) -> Hash {
            self.0
        }
    }

    struct StubChain {
        template: Mutex<BlockTemplate>,
        submitted: AtomicBool,
    }

    impl StubChain {
        fn new(template: BlockTemplate) -> Arc<StubChain> {
            Arc::new(StubChain {
                template: Mutex::new(template),
                submitted: AtomicBool::new(false),
            })
        }

        fn set_template(&self, template: BlockTemplate) {
            *self.template.lock().unwrap() = template;
        }
    }

    fn test_template(prev: &str) -> BlockTemplate {
        BlockTemplate {
            version: 0x2000_0000,
            previous_block_hash: prev.to_string(),
            transactions: vec![],
            coinbase_value: 625_000_000,
            // Network target of 1: only the all-zero proof hash finds a block
            target: format!("{:064x}", 1u32),
            min_time: 1_700_000_000,
            cur_time: 1_700_000_600,
            bits: "1d00ffff".to_string(),
            height: 500,
            rules: vec![],
        }
    }

    #[async_trait]
    impl ChainRpc for StubChain {
        async fn get_block_template(&self) -> Result<BlockTemplate, RpcError> {
            Ok(self.template.lock().unwrap().clone())
        }

        async fn submit_block(&self, _block_hex: &str) -> Result<Option<String>, RpcError> {
            self.submitted.store(true, Ordering::SeqCst);
            Ok(None)
        }

        async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
            Err(RpcError::Transport("unused".into()))
        }

        async fn get_block_count(&self) -> Result<u64, RpcError> {
            Ok(0)
        }

        async fn get_best_block_hash(&self) -> Result<String, RpcError> {
            Err(RpcError::Transport("unused".into()))
        }

        async fn get_difficulty(&self) -> Result<f64, RpcError> {
            Ok(1.0)
        }

        async fn get_mining_info(&self) -> Result<MiningInfo, RpcError> {
            Err(RpcError::Transport("unused".into()))
        }

        async fn validate_address(&self, _a: &str) -> Result<ValidatedAddress, RpcError> {
            Err(RpcError::Transport("unused".into()))
        }

        async fn estimate_smart_fee(&self, _t: u32) -> Result<EstimateSmartFee, RpcError> {
            Err(RpcError::Transport("unused".into()))
        }

        async fn get_network_info(&self) -> Result<NetworkInfo, RpcError> {
            Err(RpcError::Transport("unused".into()))
        }
    }

    struct Fixture {
        submitter: Submitter,
        provider: Arc<JobProvider>,
        store: Arc<MemoryShareStore>,
        chain: Arc<StubChain>,
        events: mpsc::UnboundedReceiver<BlockFound>,
        job_id: JobId,
        _handles: Vec<JoinHandle<()>>,
    }

    async fn fixture(pow_hash: Hash, max_rate: f64) -> Fixture {
        let chain = StubChain::new(test_template(&"11".repeat(32)));
        let provider = JobProvider::new(
            JobProviderConfig {
                payout_script_hex: "76a914000000000000000000000000000000000000000088ac".into(),
                ..Default::default()
            },
            chain.clone(),
            Arc::new(FixedPow(pow_hash)),
        );
        let job = provider.refresh().await.unwrap();
        let store = Arc::new(MemoryShareStore::new());

        let (pipeline, submitter, events) = SharePipeline::new(
            PipelineConfig {
                workers: 2,
                max_shares_per_second: max_rate,
                batch_timeout: Duration::from_millis(5),
                ..Default::default()
            },
            provider.clone(),
            Arc::new(FixedPow(pow_hash)),
            store.clone(),
            chain.clone(),
        );
        let handles = pipeline.spawn();
        Fixture {
            submitter,
            provider,
            store,
            chain,
            events,
            job_id: job.id,
            _handles: handles,
        }
    }

    fn request(fixture: &Fixture, nonce: u32, target: u64) -> SubmitRequest {
        SubmitRequest {
            connection: ConnectionId(1),
            worker: "acct.worker1".into(),
            remote_ip: "10.0.0.1".parse().unwrap(),
            extranonce1: vec![0xaa; 4],
            share_target: target,
            job_id: fixture.job_id,
            extranonce2: vec![0; 4],
            ntime: 1_700_000_700,
            nonce,
        }
    }

    /// A mid-range hash: meets easy share targets, misses the network target
    fn share_only_hash() -> Hash {
        let mut hash = [0u8; 32];
        hash[27] = 0x01;
        hash
    }

    #[tokio::test]
    async fn test_accept_and_persist() {
        let mut fx = fixture(share_only_hash(), 100.0).await;
        let outcome = fx.submitter.submit(request(&fx, 1, 1)).await.unwrap();
        assert!(outcome.verdict.is_accepted());
        assert!(!outcome.block_found);
        assert_eq!(outcome.credited_difficulty, 1);

        // The batch writer flushes within its window
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.store.share_count().await, 1);
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let fx = fixture(share_only_hash(), 100.0).await;
        let first = fx.submitter.submit(request(&fx, 7, 1)).await.unwrap();
        assert!(first.verdict.is_accepted());

        let second = fx.submitter.submit(request(&fx, 7, 1)).await.unwrap();
        assert_eq!(
            second.verdict,
            ShareVerdict::Rejected(RejectReason::Duplicate)
        );
    }

    #[tokio::test]
    async fn test_unknown_job_rejected() {
        let fx = fixture(share_only_hash(), 100.0).await;
        let mut bad = request(&fx, 1, 1);
        bad.job_id = JobId(9999);
        let outcome = fx.submitter.submit(bad).await.unwrap();
        assert_eq!(
            outcome.verdict,
            ShareVerdict::Rejected(RejectReason::UnknownJob)
        );
    }

    #[tokio::test]
    async fn test_low_difficulty_rejected() {
        // All-ones hash misses every threshold
        let fx = fixture([0xff; 32], 100.0).await;
        let outcome = fx.submitter.submit(request(&fx, 1, 1)).await.unwrap();
        assert_eq!(
            outcome.verdict,
            ShareVerdict::Rejected(RejectReason::LowDifficulty)
        );
    }

    #[tokio::test]
    async fn test_block_candidate_submits_and_emits() {
        // All-zero hash meets the network target too
        let mut fx = fixture([0u8; 32], 100.0).await;
        let outcome = fx.submitter.submit(request(&fx, 1, 1)).await.unwrap();
        assert!(outcome.verdict.is_accepted());
        assert!(outcome.block_found);

        let event = tokio::time::timeout(Duration::from_secs(1), fx.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.height, 500);
        assert_eq!(event.share.worker, "acct.worker1");
        // The discovering share was persisted before the event fired
        assert!(fx.store.share_count().await >= 1);
        assert_eq!(fx.store.block_count().await, 1);
    }

    #[tokio::test]
    async fn test_superseded_job_rejected_as_stale() {
        let fx = fixture(share_only_hash(), 100.0).await;

        // The chain tip moves; the provider publishes a clean job and the
        // old one becomes stale, not unknown
        fx.chain.set_template(test_template(&"99".repeat(32)));
        fx.provider.refresh().await.unwrap();

        let outcome = fx.submitter.submit(request(&fx, 1, 1)).await.unwrap();
        assert_eq!(outcome.verdict, ShareVerdict::Rejected(RejectReason::Stale));
    }

    #[tokio::test]
    async fn test_rate_limit_drops_over_budget() {
        let fx = fixture(share_only_hash(), 1.0).await;
        // Burst allows 2; the third in the same instant is over budget
        let mut outcomes = Vec::new();
        for nonce in 0..3 {
            outcomes.push(fx.submitter.submit(request(&fx, nonce, 1)).await.unwrap());
        }
        assert!(outcomes[0].verdict.is_accepted());
        assert!(outcomes[1].verdict.is_accepted());
        assert_eq!(
            outcomes[2].verdict,
            ShareVerdict::Rejected(RejectReason::RateLimited)
        );
    }

    #[tokio::test]
    async fn test_bad_extranonce2_width_rejected() {
        let fx = fixture(share_only_hash(), 100.0).await;
        let mut bad = request(&fx, 1, 1);
        bad.extranonce2 = vec![0; 7];
        let outcome = fx.submitter.submit(bad).await.unwrap();
        assert_eq!(
            outcome.verdict,
            ShareVerdict::Rejected(RejectReason::InvalidProof)
        );
    }

    #[tokio::test]
    async fn test_ntime_outside_window_rejected() {
        let fx = fixture(share_only_hash(), 100.0).await;
        let mut bad = request(&fx, 1, 1);
        bad.ntime = 1; // far below the floor
        let outcome = fx.submitter.submit(bad).await.unwrap();
        assert_eq!(
            outcome.verdict,
            ShareVerdict::Rejected(RejectReason::InvalidProof)
        );
    }
}
