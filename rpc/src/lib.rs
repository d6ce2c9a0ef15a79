//! Blockchain JSON-RPC client
//!
//! The pool consumes a Bitcoin-family node over HTTP JSON-RPC 1.0 with
//! basic auth: block templates in, solved blocks out, plus the chain
//! queries the coordinator and recovery layer need. Transient transport
//! failures surface as errors here; retrying is the recovery layer's job,
//! not this client's.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub mod types;

pub use types::{
    BlockTemplate, BlockchainInfo, EstimateSmartFee, MiningInfo, NetworkInfo, TemplateTransaction,
    ValidatedAddress,
};

/// RPC client errors
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("RPC deadline exceeded")]
    DeadlineExceeded,
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RpcError::DeadlineExceeded
        } else {
            RpcError::Transport(err.to_string())
        }
    }
}

/// The chain operations the pool consumes
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Fetch a block template for mining (segwit rules requested)
    async fn get_block_template(&self) -> Result<BlockTemplate, RpcError>;

    /// Submit a serialized solved block; Ok(None) means accepted
    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>, RpcError>;

    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError>;

    async fn get_block_count(&self) -> Result<u64, RpcError>;

    async fn get_best_block_hash(&self) -> Result<String, RpcError>;

    async fn get_difficulty(&self) -> Result<f64, RpcError>;

    async fn get_mining_info(&self) -> Result<MiningInfo, RpcError>;

    async fn validate_address(&self, address: &str) -> Result<ValidatedAddress, RpcError>;

    async fn estimate_smart_fee(&self, conf_target: u32) -> Result<EstimateSmartFee, RpcError>;

    async fn get_network_info(&self) -> Result<NetworkInfo, RpcError>;
}

/// Connection settings for the HTTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Node endpoint, e.g. `http://127.0.0.1:8332`
    pub url: String,
    /// Basic-auth user
    pub user: String,
    /// Basic-auth password
    pub password: String,
    /// Per-call deadline in seconds
    pub timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            url: "http://127.0.0.1:8332".to_string(),
            user: String::new(),
            password: String::new(),
            timeout_secs: 30,
        }
    }
}

/// JSON-RPC 1.0 over HTTP with basic auth
pub struct HttpChainRpc {
    config: RpcConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl HttpChainRpc {
    pub fn new(config: RpcConfig) -> Result<HttpChainRpc, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(HttpChainRpc { config, client })
    }

    /// Issue one JSON-RPC 1.0 call and deserialize its result
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        trace!("rpc call {} {}", method, params);
        let body = json!({
            "jsonrpc": "1.0",
            "id": "orepool",
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.config.url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        // Node errors ride in the JSON body even on non-200 statuses; only
        // bail early when there is no body to parse
        let envelope: RpcEnvelope = match response.json().await {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => return Err(RpcError::HttpStatus(status.as_u16())),
            Err(e) => return Err(RpcError::MalformedResponse(e.to_string())),
        };

        if let Some(error) = envelope.error {
            debug!("rpc {} failed: {} ({})", method, error.message, error.code);
            return Err(RpcError::Node {
                code: error.code,
                message: error.message,
            });
        }

        let result = envelope
            .result
            .ok_or_else(|| RpcError::MalformedResponse("missing result".to_string()))?;
        serde_json::from_value(result).map_err(|e| RpcError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    async fn get_block_template(&self) -> Result<BlockTemplate, RpcError> {
        self.call(
            "getblocktemplate",
            json!([{ "rules": ["segwit"], "capabilities": ["coinbasetxn", "workid"] }]),
        )
        .await
    }

    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>, RpcError> {
        // submitblock returns null on acceptance, a reason string otherwise
        self.call("submitblock", json!([block_hex])).await
    }

    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.call("getblockchaininfo", json!([])).await
    }

    async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", json!([])).await
    }

    async fn get_best_block_hash(&self) -> Result<String, RpcError> {
        self.call("getbestblockhash", json!([])).await
    }

    async fn get_difficulty(&self) -> Result<f64, RpcError> {
        self.call("getdifficulty", json!([])).await
    }

    async fn get_mining_info(&self) -> Result<MiningInfo, RpcError> {
        self.call("getmininginfo", json!([])).await
    }

    async fn validate_address(&self, address: &str) -> Result<ValidatedAddress, RpcError> {
        self.call("validateaddress", json!([address])).await
    }

    async fn estimate_smart_fee(&self, conf_target: u32) -> Result<EstimateSmartFee, RpcError> {
        self.call("estimatesmartfee", json!([conf_target])).await
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, RpcError> {
        self.call("getnetworkinfo", json!([])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_with_error_parses() {
        let raw = r#"{"result":null,"error":{"code":-32601,"message":"Method not found"},"id":"orepool"}"#;
        let envelope: RpcEnvelope = serde_json::from_str(raw).unwrap();
        let error = envelope.error.unwrap();
        assert_eq!(error.code, -32601);
        assert_eq!(error.message, "Method not found");
    }

    #[test]
    fn test_envelope_with_result_parses() {
        let raw = r#"{"result":842000,"error":null,"id":"orepool"}"#;
        let envelope: RpcEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.result, Some(json!(842000)));
        assert!(envelope.error.is_none());
    }

    #[test]
    fn test_default_config() {
        let config = RpcConfig::default();
        assert_eq!(config.timeout_secs, 30);
        assert!(config.url.starts_with("http://"));
    }
}
