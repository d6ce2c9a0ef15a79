//! Mining jobs: the unit of work handed to connected devices
//!
//! A job brackets the extranonce region with a coinbase head and tail and
//! carries the merkle path needed to fold the reconstructed coinbase txid
//! back into the block header. Jobs are immutable once published and shared
//! behind `Arc`.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::pow::sha256d;
use crate::target::Target;
use crate::{CoreError, Hash};

/// Opaque job identifier, unique while the generation that produced it lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl JobId {
    /// Hex rendering used on the V1 wire
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse the V1 wire rendering
    pub fn from_hex(hex: &str) -> Result<JobId, CoreError> {
        u64::from_str_radix(hex, 16)
            .map(JobId)
            .map_err(|_| CoreError::InvalidJob(format!("bad job id: {}", hex)))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A unit of work derived from one block template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Monotonic generation number; a higher generation supersedes lower ones
    pub generation: u64,

    /// Previous block hash (little-endian)
    pub prev_hash: Hash,

    /// Coinbase bytes before the extranonce region
    pub coinbase_head: Vec<u8>,

    /// Coinbase bytes after the extranonce region
    pub coinbase_tail: Vec<u8>,

    /// Merkle path folding the coinbase txid up to the root
    pub merkle_path: Vec<Hash>,

    /// Block version
    pub version: u32,

    /// Encoded network difficulty bits
    pub bits: u32,

    /// Earliest timestamp a submission may carry
    pub time_floor: u32,

    /// Latest timestamp a submission may carry
    pub time_ceiling: u32,

    /// Height of the block being worked on
    pub height: u64,

    /// Proof-of-work algorithm identifier
    pub algorithm: String,

    /// Total coinbase reward in the smallest currency unit
    pub reward: u64,

    /// Network target a block-candidate hash must meet
    pub network_target: Target,

    /// Whether clients must drop work for earlier jobs
    pub clean_jobs: bool,
}

impl Job {
    /// Reassemble the coinbase transaction around the submitted extranonces
    pub fn build_coinbase(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        let mut coinbase = Vec::with_capacity(
            self.coinbase_head.len()
                + extranonce1.len()
                + extranonce2.len()
                + self.coinbase_tail.len(),
        );
        coinbase.extend_from_slice(&self.coinbase_head);
        coinbase.extend_from_slice(extranonce1);
        coinbase.extend_from_slice(extranonce2);
        coinbase.extend_from_slice(&self.coinbase_tail);
        coinbase
    }

    /// Fold a coinbase txid up the merkle path to the root
    pub fn merkle_root(&self, coinbase_txid: &Hash) -> Hash {
        let mut root = *coinbase_txid;
        for branch in &self.merkle_path {
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(&root);
            concat[32..].copy_from_slice(branch);
            root = sha256d(&concat);
        }
        root
    }

    /// Serialize the 80-byte block header for a candidate proof
    pub fn serialize_header(&self, merkle_root: &Hash, ntime: u32, nonce: u32) -> [u8; 80] {
        let mut header = [0u8; 80];
        LittleEndian::write_u32(&mut header[0..4], self.version);
        header[4..36].copy_from_slice(&self.prev_hash);
        header[36..68].copy_from_slice(merkle_root);
        LittleEndian::write_u32(&mut header[68..72], ntime);
        LittleEndian::write_u32(&mut header[72..76], self.bits);
        LittleEndian::write_u32(&mut header[76..80], nonce);
        header
    }

    /// Check a submitted timestamp against the job's window
    pub fn ntime_in_window(&self, ntime: u32) -> bool {
        ntime >= self.time_floor && ntime <= self.time_ceiling
    }
}

/// Derive the merkle path for the coinbase slot from the template txids.
///
/// The path contains, for each tree level, the sibling that pairs with the
/// running coinbase-side node. Odd nodes pair with themselves, per the
/// Bitcoin merkle convention.
pub fn merkle_path_for_coinbase(txids: &[Hash]) -> Vec<Hash> {
    let mut path = Vec::new();
    if txids.is_empty() {
        return path;
    }

    let mut level: Vec<Hash> = txids.to_vec();
    loop {
        path.push(level[0]);
        if level.len() == 1 {
            break;
        }

        // Fold the remaining level in pairs, skipping the coinbase slot
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level[1..].chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(&left);
            concat[32..].copy_from_slice(&right);
            next.push(sha256d(&concat));
        }
        if next.is_empty() {
            break;
        }
        level = next;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job {
            id: JobId(7),
            generation: 1,
            prev_hash: [0x11; 32],
            coinbase_head: vec![0x01, 0x02],
            coinbase_tail: vec![0x03, 0x04],
            merkle_path: vec![[0x22; 32]],
            version: 0x2000_0000,
            bits: 0x1d00ffff,
            time_floor: 1_700_000_000,
            time_ceiling: 1_700_007_200,
            height: 1000,
            algorithm: "sha256d".to_string(),
            reward: 625_000_000,
            network_target: Target::difficulty_one(),
            clean_jobs: true,
        }
    }

    #[test]
    fn test_job_id_hex_roundtrip() {
        let id = JobId(0xdead_beef);
        assert_eq!(id.to_hex(), "00000000deadbeef");
        assert_eq!(JobId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(JobId::from_hex("not-hex").is_err());
    }

    #[test]
    fn test_build_coinbase_splices_extranonces() {
        let job = sample_job();
        let coinbase = job.build_coinbase(&[0xaa], &[0xbb, 0xcc]);
        assert_eq!(coinbase, vec![0x01, 0x02, 0xaa, 0xbb, 0xcc, 0x03, 0x04]);
    }

    #[test]
    fn test_merkle_root_folds_path() {
        let job = sample_job();
        let txid = [0x33; 32];
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&txid);
        concat[32..].copy_from_slice(&[0x22; 32]);
        assert_eq!(job.merkle_root(&txid), sha256d(&concat));
    }

    #[test]
    fn test_merkle_root_empty_path_is_txid() {
        let mut job = sample_job();
        job.merkle_path.clear();
        let txid = [0x44; 32];
        assert_eq!(job.merkle_root(&txid), txid);
    }

    #[test]
    fn test_header_layout() {
        let job = sample_job();
        let root = [0x55; 32];
        let header = job.serialize_header(&root, 1_700_000_100, 0x01020304);
        assert_eq!(&header[4..36], &[0x11; 32]);
        assert_eq!(&header[36..68], &root);
        assert_eq!(LittleEndian::read_u32(&header[0..4]), 0x2000_0000);
        assert_eq!(LittleEndian::read_u32(&header[68..72]), 1_700_000_100);
        assert_eq!(LittleEndian::read_u32(&header[72..76]), 0x1d00ffff);
        assert_eq!(LittleEndian::read_u32(&header[76..80]), 0x01020304);
    }

    #[test]
    fn test_ntime_window() {
        let job = sample_job();
        assert!(job.ntime_in_window(job.time_floor));
        assert!(job.ntime_in_window(job.time_ceiling));
        assert!(!job.ntime_in_window(job.time_floor - 1));
        assert!(!job.ntime_in_window(job.time_ceiling + 1));
    }

    #[test]
    fn test_merkle_path_single_tx_template() {
        // A template with only non-coinbase txid [0xaa] yields that txid as path
        let path = merkle_path_for_coinbase(&[[0xaa; 32]]);
        assert_eq!(path, vec![[0xaa; 32]]);
    }
}
