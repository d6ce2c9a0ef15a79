//! Response shapes for the chain RPC methods the pool consumes

use serde::{Deserialize, Serialize};

/// One transaction in a block template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateTransaction {
    /// Raw transaction hex
    pub data: String,
    /// Transaction id (big-endian hex)
    pub txid: String,
    /// Witness hash when present
    #[serde(default)]
    pub hash: Option<String>,
    /// Fee in the smallest unit
    #[serde(default)]
    pub fee: Option<i64>,
}

/// getblocktemplate result (the fields the pool uses)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,

    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,

    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,

    /// Total coinbase value (subsidy plus fees) in the smallest unit
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,

    /// Block target, big-endian hex
    pub target: String,

    /// Minimum allowed header timestamp
    #[serde(rename = "mintime")]
    pub min_time: u64,

    /// Node's current time, the job's timestamp baseline
    #[serde(rename = "curtime")]
    pub cur_time: u64,

    /// Compact difficulty bits, hex
    pub bits: String,

    pub height: u64,

    /// Consensus rules active for this template
    #[serde(default)]
    pub rules: Vec<String>,
}

/// getblockchaininfo result subset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: String,
    pub difficulty: f64,
    #[serde(rename = "initialblockdownload", default)]
    pub initial_block_download: bool,
}

/// getmininginfo result subset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningInfo {
    pub blocks: u64,
    pub difficulty: f64,
    #[serde(rename = "networkhashps", default)]
    pub network_hash_ps: f64,
    #[serde(rename = "pooledtx", default)]
    pub pooled_tx: u64,
    pub chain: String,
}

/// validateaddress result subset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedAddress {
    #[serde(rename = "isvalid")]
    pub is_valid: bool,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(rename = "scriptPubKey", default)]
    pub script_pubkey: Option<String>,
}

/// estimatesmartfee result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimateSmartFee {
    /// Fee rate in coin units per kvB; absent when the node has no estimate
    #[serde(rename = "feerate", default)]
    pub fee_rate: Option<f64>,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
    pub blocks: i64,
}

/// getnetworkinfo result subset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub version: i64,
    pub subversion: String,
    pub connections: u64,
    #[serde(rename = "networkactive", default = "default_true")]
    pub network_active: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_deserializes_from_node_shape() {
        let raw = r#"{
            "version": 536870912,
            "previousblockhash": "00000000000000000002bf1c330853ba1b6bd9d73d6e3c5066d5bcd84dc1fb37",
            "transactions": [
                {"data": "0100", "txid": "aa00", "fee": 1500}
            ],
            "coinbasevalue": 625012345,
            "target": "0000000000000000000b98ab0000000000000000000000000000000000000000",
            "mintime": 1699999000,
            "curtime": 1700000000,
            "bits": "170b98ab",
            "height": 820000,
            "rules": ["segwit", "taproot"]
        }"#;
        let template: BlockTemplate = serde_json::from_str(raw).unwrap();
        assert_eq!(template.height, 820000);
        assert_eq!(template.transactions.len(), 1);
        assert_eq!(template.transactions[0].fee, Some(1500));
        assert!(template.rules.iter().any(|r| r == "segwit"));
    }

    #[test]
    fn test_estimate_fee_without_estimate() {
        let raw = r#"{"errors":["Insufficient data"],"blocks":2}"#;
        let fee: EstimateSmartFee = serde_json::from_str(raw).unwrap();
        assert!(fee.fee_rate.is_none());
        assert_eq!(fee.blocks, 2);
    }

    #[test]
    fn test_validate_address() {
        let raw = r#"{"isvalid":true,"address":"bc1qexample"}"#;
        let validated: ValidatedAddress = serde_json::from_str(raw).unwrap();
        assert!(validated.is_valid);
    }
}
