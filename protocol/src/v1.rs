//! Stratum V1: newline-delimited JSON-RPC
//!
//! Three shapes travel on a V1 line: requests, responses, and notifications
//! (a request with a null id, pushed server to client). Responses carry
//! either a result or a 3-tuple error `[code, message, traceback-or-null]`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use orepool_core::RejectReason;

use crate::ProtocolError;

/// Longest accepted V1 line, in bytes
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Methods the server handles or pushes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum V1Method {
    /// mining.subscribe
    Subscribe,
    /// mining.authorize
    Authorize,
    /// mining.submit
    Submit,
    /// mining.get_transactions
    GetTransactions,
    /// client.get_version
    GetVersion,
    /// mining.set_difficulty (server push)
    SetDifficulty,
    /// mining.notify (server push)
    Notify,
    /// mining.set_extranonce (server push)
    SetExtranonce,
    /// Anything else
    Unknown(String),
}

impl From<&str> for V1Method {
    fn from(s: &str) -> Self {
        match s {
            "mining.subscribe" => V1Method::Subscribe,
            "mining.authorize" => V1Method::Authorize,
            "mining.submit" => V1Method::Submit,
            "mining.get_transactions" => V1Method::GetTransactions,
            "client.get_version" => V1Method::GetVersion,
            "mining.set_difficulty" => V1Method::SetDifficulty,
            "mining.notify" => V1Method::Notify,
            "mining.set_extranonce" => V1Method::SetExtranonce,
            _ => V1Method::Unknown(s.to_string()),
        }
    }
}

impl V1Method {
    pub fn as_str(&self) -> &str {
        match self {
            V1Method::Subscribe => "mining.subscribe",
            V1Method::Authorize => "mining.authorize",
            V1Method::Submit => "mining.submit",
            V1Method::GetTransactions => "mining.get_transactions",
            V1Method::GetVersion => "client.get_version",
            V1Method::SetDifficulty => "mining.set_difficulty",
            V1Method::Notify => "mining.notify",
            V1Method::SetExtranonce => "mining.set_extranonce",
            V1Method::Unknown(s) => s,
        }
    }
}

/// A client request line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    /// JSON-RPC id; integer or string, null marks a notification
    pub id: Option<Value>,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Vec<Value>,
}

impl StratumRequest {
    /// Parse a single line into a request
    pub fn parse(line: &str) -> Result<StratumRequest, ProtocolError> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn method(&self) -> V1Method {
        V1Method::from(self.method.as_str())
    }
}

/// A server response line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    /// Echoed request id
    pub id: Value,
    /// Result payload, null on error
    pub result: Value,
    /// Error 3-tuple, null on success
    pub error: Value,
}

impl StratumResponse {
    pub fn ok(id: Value, result: Value) -> StratumResponse {
        StratumResponse {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn err(id: Value, code: i32, message: &str) -> StratumResponse {
        StratumResponse {
            id,
            result: Value::Null,
            error: json!([code, message, null]),
        }
    }

    /// Rejection response for a submit, carrying the stable error code
    pub fn reject(id: Value, reason: RejectReason) -> StratumResponse {
        StratumResponse::err(id, reason.v1_error_code(), reason.message())
    }

    /// Serialize to a single line (no trailing newline)
    pub fn to_line(&self) -> String {
        // Serialization of these shapes cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A server-to-client push line (id is always null)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumNotification {
    pub id: Value,
    pub method: String,
    pub params: Vec<Value>,
}

impl StratumNotification {
    pub fn new(method: V1Method, params: Vec<Value>) -> StratumNotification {
        StratumNotification {
            id: Value::Null,
            method: method.as_str().to_string(),
            params,
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Build the mining.subscribe result:
/// `[[["mining.notify", sub_id]], extranonce1_hex, extranonce2_size]`
pub fn subscribe_result(subscription_id: &str, extranonce1: &[u8], extranonce2_size: usize) -> Value {
    json!([
        [["mining.notify", subscription_id]],
        hex::encode(extranonce1),
        extranonce2_size
    ])
}

/// Build a mining.notify push for a job.
///
/// Params: `[job_id, prev_hash, coinb1, coinb2, merkle_branches, version,
/// bits, ntime, clean_jobs]`, all hex-encoded except the flag.
#[allow(clippy::too_many_arguments)]
pub fn notify_params(
    job_id: &str,
    prev_hash: &[u8; 32],
    coinbase_head: &[u8],
    coinbase_tail: &[u8],
    merkle_path: &[[u8; 32]],
    version: u32,
    bits: u32,
    ntime: u32,
    clean_jobs: bool,
) -> Vec<Value> {
    vec![
        json!(job_id),
        json!(hex::encode(prev_hash)),
        json!(hex::encode(coinbase_head)),
        json!(hex::encode(coinbase_tail)),
        json!(merkle_path.iter().map(hex::encode).collect::<Vec<_>>()),
        json!(format!("{:08x}", version)),
        json!(format!("{:08x}", bits)),
        json!(format!("{:08x}", ntime)),
        json!(clean_jobs),
    ]
}

/// Parameters of a mining.submit request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
}

impl SubmitParams {
    /// Parse `["worker", "job-id", "extranonce2", "ntime", "nonce"]`
    pub fn parse(params: &[Value]) -> Result<SubmitParams, ProtocolError> {
        if params.len() < 5 {
            return Err(ProtocolError::MalformedFrame(format!(
                "mining.submit expects 5 params, got {}",
                params.len()
            )));
        }
        let as_str = |i: usize, name: &str| -> Result<&str, ProtocolError> {
            params[i]
                .as_str()
                .ok_or_else(|| ProtocolError::MalformedFrame(format!("{} must be a string", name)))
        };

        let worker = as_str(0, "worker")?.to_string();
        let job_id = as_str(1, "job_id")?.to_string();
        let extranonce2 = hex::decode(as_str(2, "extranonce2")?)
            .map_err(|_| ProtocolError::MalformedFrame("extranonce2 is not hex".into()))?;
        let ntime = u32::from_str_radix(as_str(3, "ntime")?, 16)
            .map_err(|_| ProtocolError::MalformedFrame("ntime is not hex".into()))?;
        let nonce = u32::from_str_radix(as_str(4, "nonce")?, 16)
            .map_err(|_| ProtocolError::MalformedFrame("nonce is not hex".into()))?;

        Ok(SubmitParams {
            worker,
            job_id,
            extranonce2,
            ntime,
            nonce,
        })
    }
}
