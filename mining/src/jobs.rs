//! Job generation from block templates
//!
//! Polls the chain for templates at a fixed cadence (and immediately after
//! a found block), assembles the coinbase around the extranonce region,
//! derives the coinbase merkle path, and publishes the current job through
//! a watch channel. Readers snapshot the `Arc<Job>` and never hold a lock
//! while hashing. A job is stale once a newer previous-block hash is
//! published; it stays resolvable for a few generations so late
//! submissions reject as stale rather than unknown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use orepool_core::job::merkle_path_for_coinbase;
use orepool_core::pow::sha256d;
use orepool_core::{Hash, Job, JobId, PowHash, Target};
use orepool_rpc::{BlockTemplate, ChainRpc};

use crate::MiningError;

/// Provider tuning
#[derive(Debug, Clone)]
pub struct JobProviderConfig {
    /// Template poll cadence
    pub poll_interval: Duration,
    /// Miner-controlled extranonce width handed out on subscribe
    pub extranonce2_size: usize,
    /// Marker embedded in the coinbase script
    pub coinbase_tag: String,
    /// scriptPubKey paying the pool, hex
    pub payout_script_hex: String,
    /// Server-assigned extranonce width
    pub extranonce1_size: usize,
    /// Generations kept resolvable for stale rejections
    pub job_history: u64,
}

impl Default for JobProviderConfig {
    fn default() -> Self {
        JobProviderConfig {
            poll_interval: Duration::from_secs(5),
            extranonce2_size: 4,
            coinbase_tag: "/orepool/".to_string(),
            payout_script_hex: String::new(),
            extranonce1_size: 4,
            job_history: 8,
        }
    }
}

struct JobEntry {
    job: Arc<Job>,
    /// Raw template transactions for block assembly, in template order
    raw_txs: Vec<String>,
}

/// Builds and publishes mining jobs
pub struct JobProvider {
    config: JobProviderConfig,
    rpc: Arc<dyn ChainRpc>,
    pow: Arc<dyn PowHash>,

    jobs: RwLock<HashMap<JobId, JobEntry>>,
    current: watch::Sender<Option<Arc<Job>>>,

    /// Template backing the current job, for change detection
    last_template: Mutex<Option<BlockTemplate>>,

    /// Monotonic generation number
    generation: AtomicU64,
    next_job_id: AtomicU64,
    refresh_notify: Notify,
}

impl JobProvider {
    pub fn new(
        config: JobProviderConfig,
        rpc: Arc<dyn ChainRpc>,
        pow: Arc<dyn PowHash>,
    ) -> Arc<JobProvider> {
        let (current, _) = watch::channel(None);
        Arc::new(JobProvider {
            config,
            rpc,
            pow,
            jobs: RwLock::new(HashMap::new()),
            current,
            last_template: Mutex::new(None),
            generation: AtomicU64::new(0),
            next_job_id: AtomicU64::new(1),
            refresh_notify: Notify::new(),
        })
    }

    /// Observe job publications; the value is the current job
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Job>>> {
        self.current.subscribe()
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.current.borrow().clone()
    }

    pub fn extranonce2_size(&self) -> usize {
        self.config.extranonce2_size
    }

    pub fn extranonce1_size(&self) -> usize {
        self.config.extranonce1_size
    }

    /// Resolve a job id; stale jobs still resolve
    pub fn lookup(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs.read().unwrap().get(&id).map(|entry| entry.job.clone())
    }

    /// A job is stale when the chain tip moved past its parent
    pub fn is_stale(&self, job: &Job) -> bool {
        match self.current_job() {
            Some(current) => current.prev_hash != job.prev_hash,
            None => true,
        }
    }

    /// Ask the run loop for an immediate refresh (block found, recovery)
    pub fn request_refresh(&self) {
        self.refresh_notify.notify_one();
    }

    /// Fetch a template and publish the job built from it.
    ///
    /// An unchanged template does not mint a new generation; miners keep
    /// their work instead of being renotified every poll.
    pub async fn refresh(&self) -> Result<Arc<Job>, MiningError> {
        let template = self.rpc.get_block_template().await?;
        {
            let mut last = self.last_template.lock().unwrap();
            if last.as_ref() == Some(&template) {
                if let Some(current) = self.current_job() {
                    return Ok(current);
                }
            }
            *last = Some(template.clone());
        }
        let job = self.build_job(&template)?;

        {
            let mut jobs = self.jobs.write().unwrap();
            jobs.insert(
                job.id,
                JobEntry {
                    job: job.clone(),
                    raw_txs: template
                        .transactions
                        .iter()
                        .map(|tx| tx.data.clone())
                        .collect(),
                },
            );

            // Prune generations nobody should reference anymore
            let floor = job.generation.saturating_sub(self.config.job_history);
            jobs.retain(|_, entry| entry.job.generation >= floor);
        }

        if job.clean_jobs {
            info!(
                "new chain tip at height {}, job {} (clean)",
                job.height, job.id
            );
        } else {
            debug!("template refresh at height {}, job {}", job.height, job.id);
        }
        self.current.send_replace(Some(job.clone()));
        Ok(job)
    }

    /// Poll loop; also wakes on request_refresh
    pub fn spawn(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let provider = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(provider.config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = provider.refresh_notify.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if let Err(e) = provider.refresh().await {
                    // Transient chain failures are retried next tick; the
                    // recovery layer handles sustained unreachability
                    warn!("template refresh failed: {}", e);
                }
            }
        })
    }

    fn build_job(&self, template: &BlockTemplate) -> Result<Arc<Job>, MiningError> {
        let prev_hash = parse_hash_be(&template.previous_block_hash)
            .ok_or_else(|| MiningError::BadTemplate("bad previousblockhash".into()))?;
        let bits = u32::from_str_radix(&template.bits, 16)
            .map_err(|_| MiningError::BadTemplate("bad bits".into()))?;
        let target_bytes = parse_hash_be(&template.target)
            .ok_or_else(|| MiningError::BadTemplate("bad target".into()))?;
        let network_target = Target::from_le_bytes(target_bytes);

        let payout_script = hex::decode(&self.config.payout_script_hex)
            .map_err(|_| MiningError::BadTemplate("bad payout script hex".into()))?;
        if payout_script.is_empty() {
            return Err(MiningError::BadTemplate("empty payout script".into()));
        }

        let (coinbase_head, coinbase_tail) = self.split_coinbase(
            template.height,
            template.coinbase_value,
            &payout_script,
        )?;

        // Transaction ids arrive big-endian; merkle math runs little-endian
        let mut txids = Vec::with_capacity(template.transactions.len());
        for tx in &template.transactions {
            let txid = parse_hash_be(&tx.txid)
                .ok_or_else(|| MiningError::BadTemplate(format!("bad txid {}", tx.txid)))?;
            txids.push(txid);
        }
        let merkle_path = merkle_path_for_coinbase(&txids);

        let clean_jobs = match self.current_job() {
            Some(current) => current.prev_hash != prev_hash,
            None => true,
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Job {
            id: JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst)),
            generation,
            prev_hash,
            coinbase_head,
            coinbase_tail,
            merkle_path,
            version: template.version,
            bits,
            time_floor: template.min_time as u32,
            time_ceiling: template.cur_time as u32 + 7200,
            height: template.height,
            algorithm: self.pow.algorithm().to_string(),
            reward: template.coinbase_value,
            network_target,
            clean_jobs,
        };
        Ok(Arc::new(job))
    }

    /// Build the coinbase bytes bracketing the extranonce region
    fn split_coinbase(
        &self,
        height: u64,
        reward: u64,
        payout_script: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), MiningError> {
        let height_push = script_push_height(height);
        let tag = self.config.coinbase_tag.as_bytes();
        let extranonce_len = self.config.extranonce1_size + self.config.extranonce2_size;

        let script_len = height_push.len() + tag.len() + extranonce_len;
        if script_len > 100 {
            return Err(MiningError::BadTemplate(format!(
                "coinbase script {} bytes exceeds consensus limit",
                script_len
            )));
        }

        // Head: everything before the extranonce region
        let mut head = Vec::with_capacity(64);
        head.extend_from_slice(&1u32.to_le_bytes()); // tx version
        head.push(0x01); // one input
        head.extend_from_slice(&[0u8; 32]); // null prevout
        head.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
        head.push(script_len as u8);
        head.extend_from_slice(&height_push);
        head.extend_from_slice(tag);

        // Tail: everything after it
        let mut tail = Vec::with_capacity(48 + payout_script.len());
        tail.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // sequence
        tail.push(0x01); // one output
        tail.extend_from_slice(&reward.to_le_bytes());
        tail.push(payout_script.len() as u8);
        tail.extend_from_slice(payout_script);
        tail.extend_from_slice(&0u32.to_le_bytes()); // locktime

        Ok((head, tail))
    }

    /// Serialize a solved block for submitblock
    pub fn assemble_block(
        &self,
        job_id: JobId,
        coinbase: &[u8],
        header: &[u8; 80],
    ) -> Option<String> {
        let jobs = self.jobs.read().unwrap();
        let entry = jobs.get(&job_id)?;

        let mut block = Vec::with_capacity(
            80 + 9 + coinbase.len() + entry.raw_txs.iter().map(|t| t.len() / 2).sum::<usize>(),
        );
        block.extend_from_slice(header);
        write_varint(&mut block, entry.raw_txs.len() as u64 + 1);
        block.extend_from_slice(coinbase);
        for raw in &entry.raw_txs {
            match hex::decode(raw) {
                Ok(bytes) => block.extend_from_slice(&bytes),
                Err(e) => {
                    error!("template transaction is not hex: {}", e);
                    return None;
                }
            }
        }
        Some(hex::encode(block))
    }

    /// Block hash of a solved header, for logs and records
    pub fn header_hash(&self, header: &[u8; 80]) -> Hash {
        sha256d(header)
    }
}

/// BIP34: minimally-encoded height push
fn script_push_height(height: u64) -> Vec<u8> {
    if height == 0 {
        return vec![0x00];
    }
    let mut bytes = Vec::new();
    let mut value = height;
    while value > 0 {
        bytes.push((value & 0xff) as u8);
        value >>= 8;
    }
    // A set high bit would flip the script number's sign
    if bytes.last().map_or(false, |b| b & 0x80 != 0) {
        bytes.push(0x00);
    }
    let mut push = Vec::with_capacity(bytes.len() + 1);
    push.push(bytes.len() as u8);
    push.extend_from_slice(&bytes);
    push
}

/// Bitcoin-style variable-length integer
fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Decode a 64-hex-char big-endian hash into little-endian bytes
fn parse_hash_be(hex_str: &str) -> Option<Hash> {
    let bytes = hex::decode(hex_str).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash.reverse();
    Some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orepool_core::Sha256d;
    use orepool_rpc::{
        BlockchainInfo, EstimateSmartFee, MiningInfo, NetworkInfo, RpcError, TemplateTransaction,
        ValidatedAddress,
    };
    use std::sync::Mutex;

    /// Chain stub serving canned templates
    struct FakeChain {
        templates: Mutex<Vec<BlockTemplate>>,
    }

    fn template(height: u64, prev: &str) -> BlockTemplate {
        BlockTemplate {
            version: 0x2000_0000,
            previous_block_hash: prev.to_string(),
            transactions: vec![TemplateTransaction {
                data: "0100000000".to_string(),
                txid: "aa".repeat(32),
                hash: None,
                fee: Some(1000),
            }],
            coinbase_value: 625_000_000,
            target: format!("{:064x}", 0xffffu128),
            min_time: 1_700_000_000,
            cur_time: 1_700_000_600,
            bits: "1d00ffff".to_string(),
            height,
            rules: vec!["segwit".to_string()],
        }
    }

    #[async_trait]
    impl ChainRpc for FakeChain {
        async fn get_block_template(&self) -> Result<BlockTemplate, RpcError> {
            let mut templates = self.templates.lock().unwrap();
            if templates.len() > 1 {
                Ok(templates.remove(0))
            } else {
                templates
                    .first()
                    .cloned()
                    .ok_or_else(|| RpcError::Transport("no template".into()))
            }
        }

        async fn submit_block(&self, _block_hex: &str) -> Result<Option<String>, RpcError> {
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

        async fn validate_address(&self, _address: &str) -> Result<ValidatedAddress, RpcError> {
            Err(RpcError::Transport("unused".into()))
        }

        async fn estimate_smart_fee(&self, _t: u32) -> Result<EstimateSmartFee, RpcError> {
            Err(RpcError::Transport("unused".into()))
        }

        async fn get_network_info(&self) -> Result<NetworkInfo, RpcError> {
            Err(RpcError::Transport("unused".into()))
        }
    }

    fn provider_with(templates: Vec<BlockTemplate>) -> Arc<JobProvider> {
        let config = JobProviderConfig {
            payout_script_hex: "76a914000000000000000000000000000000000000000088ac".to_string(),
            ..Default::default()
        };
        JobProvider::new(
            config,
            Arc::new(FakeChain {
                templates: Mutex::new(templates),
            }),
            Arc::new(Sha256d),
        )
    }

    #[tokio::test]
    async fn test_refresh_publishes_job() {
        let provider = provider_with(vec![template(100, &"11".repeat(32))]);
        let job = provider.refresh().await.unwrap();
        assert_eq!(job.height, 100);
        assert_eq!(job.generation, 1);
        assert!(job.clean_jobs, "first job is always clean");
        assert_eq!(provider.current_job().unwrap().id, job.id);
        assert_eq!(provider.lookup(job.id).unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_same_prev_hash_is_not_clean_or_stale() {
        let prev = "22".repeat(32);
        let mut richer = template(100, &prev);
        // Same parent but a larger transaction set: a genuine refresh
        richer.transactions.push(TemplateTransaction {
            data: "0200000000".to_string(),
            txid: "bb".repeat(32),
            hash: None,
            fee: Some(2000),
        });
        richer.transactions.push(TemplateTransaction {
            data: "0300000000".to_string(),
            txid: "cc".repeat(32),
            hash: None,
            fee: Some(3000),
        });
        let provider = provider_with(vec![template(100, &prev), richer]);
        let first = provider.refresh().await.unwrap();
        let second = provider.refresh().await.unwrap();
        assert!(!second.clean_jobs);
        assert!(second.generation > first.generation);
        // Both jobs build on the live tip
        assert!(!provider.is_stale(&first));
        assert!(!provider.is_stale(&second));
    }

    #[tokio::test]
    async fn test_unchanged_template_keeps_current_job() {
        let prev = "77".repeat(32);
        let provider = provider_with(vec![template(100, &prev), template(100, &prev)]);
        let first = provider.refresh().await.unwrap();
        let second = provider.refresh().await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.generation, second.generation);
    }

    #[tokio::test]
    async fn test_new_prev_hash_marks_earlier_job_stale() {
        let provider = provider_with(vec![
            template(100, &"33".repeat(32)),
            template(101, &"44".repeat(32)),
        ]);
        let old = provider.refresh().await.unwrap();
        let new = provider.refresh().await.unwrap();
        assert!(new.clean_jobs);
        assert!(provider.is_stale(&old));
        assert!(!provider.is_stale(&new));
        // Stale jobs still resolve for stale rejections
        assert!(provider.lookup(old.id).is_some());
    }

    #[tokio::test]
    async fn test_coinbase_embeds_extranonce_region() {
        let provider = provider_with(vec![template(840_000, &"55".repeat(32))]);
        let job = provider.refresh().await.unwrap();

        let extranonce1 = [0xaa, 0xbb, 0xcc, 0xdd];
        let extranonce2 = [0x01, 0x02, 0x03, 0x04];
        let coinbase = job.build_coinbase(&extranonce1, &extranonce2);

        // The script length byte covers height push, tag, and extranonces
        let script_len_pos = 4 + 1 + 32 + 4;
        let script_len = coinbase[script_len_pos] as usize;
        let height_push = script_push_height(840_000);
        assert_eq!(
            script_len,
            height_push.len() + "/orepool/".len() + extranonce1.len() + extranonce2.len()
        );

        // The extranonces sit between head and tail
        let head_len = job.coinbase_head.len();
        assert_eq!(&coinbase[head_len..head_len + 4], &extranonce1);
        assert_eq!(&coinbase[head_len + 4..head_len + 8], &extranonce2);
    }

    #[tokio::test]
    async fn test_assemble_block_layout() {
        let provider = provider_with(vec![template(100, &"66".repeat(32))]);
        let job = provider.refresh().await.unwrap();
        let coinbase = job.build_coinbase(&[0; 4], &[0; 4]);
        let header = [0u8; 80];

        let block_hex = provider.assemble_block(job.id, &coinbase, &header).unwrap();
        let block = hex::decode(block_hex).unwrap();
        assert_eq!(&block[..80], &header);
        // Two transactions: coinbase plus the template's one
        assert_eq!(block[80], 2);
        assert_eq!(&block[81..81 + coinbase.len()], &coinbase[..]);
    }

    #[test]
    fn test_script_push_height_minimal_encoding() {
        assert_eq!(script_push_height(0), vec![0x00]);
        assert_eq!(script_push_height(1), vec![0x01, 0x01]);
        assert_eq!(script_push_height(0x80), vec![0x02, 0x80, 0x00]);
        assert_eq!(script_push_height(840_000), vec![0x03, 0x40, 0xd1, 0x0c]);
    }

    #[test]
    fn test_write_varint_widths() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0xfc);
        write_varint(&mut buf, 0xfd);
        write_varint(&mut buf, 0x1_0000);
        assert_eq!(buf[0], 0xfc);
        assert_eq!(buf[1], 0xfd);
        assert_eq!(&buf[2..4], &[0xfd, 0x00]);
        assert_eq!(buf[4], 0xfe);
    }

    #[test]
    fn test_parse_hash_be_reverses() {
        let mut hex_str = String::new();
        hex_str.push_str("01");
        hex_str.push_str(&"00".repeat(31));
        let hash = parse_hash_be(&hex_str).unwrap();
        // Big-endian leading byte lands at the little-endian top
        assert_eq!(hash[31], 0x01);
        assert_eq!(hash[0], 0x00);
    }
}
