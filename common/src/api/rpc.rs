use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::parse_quantity;

pub const JSON_RPC_VERSION: &str = "2.0";

// Outgoing JSON-RPC 2.0 request
// Request ids are per-network prefixed strings ("{network}-{counter}")
// so responses never collide across scanners sharing one HTTP client
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: String, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION,
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

// eth_getLogs filter, serialized with hex quantities
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub from_block: String,
    pub to_block: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Option<String>>,
}

impl LogFilter {
    pub fn for_topic0(from_block: u64, to_block: u64, topic0: &str) -> Self {
        Self {
            from_block: format!("{:#x}", from_block),
            to_block: format!("{:#x}", to_block),
            address: None,
            topics: vec![Some(topic0.to_string())],
        }
    }
}

// A single entry of an eth_getLogs response
// Quantities stay hex encoded until a consumer needs them
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub log_index: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

impl RpcLog {
    pub fn block_number(&self) -> Option<u64> {
        self.block_number.as_deref().and_then(|q| parse_quantity(q).ok())
    }

    pub fn log_index(&self) -> Option<u64> {
        self.log_index.as_deref().and_then(|q| parse_quantity(q).ok())
    }
}

// Reduced eth_getBlockByNumber response: only what the pipeline reads
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: String,
    pub timestamp: String,
}

impl RpcBlock {
    pub fn number(&self) -> Option<u64> {
        parse_quantity(&self.number).ok()
    }

    pub fn timestamp(&self) -> Option<u64> {
        parse_quantity(&self.timestamp).ok()
    }
}

// Reduced eth_getTransactionByHash response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: String,
    #[serde(default)]
    pub block_number: Option<String>,
}

impl RpcTransaction {
    pub fn block_number(&self) -> Option<u64> {
        self.block_number.as_deref().and_then(|q| parse_quantity(q).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = RpcRequest::new(
            "ethereum-42".to_string(),
            "eth_blockNumber",
            json!([]),
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], "ethereum-42");
        assert_eq!(value["method"], "eth_blockNumber");
    }

    #[test]
    fn test_log_filter_hex_quantities() {
        let filter = LogFilter::for_topic0(1000, 1999, "0xddf2");
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["fromBlock"], "0x3e8");
        assert_eq!(value["toBlock"], "0x7cf");
        assert_eq!(value["topics"][0], "0xddf2");
        assert!(value.get("address").is_none());
    }

    #[test]
    fn test_log_deserialization() {
        let log: RpcLog = serde_json::from_value(json!({
            "address": "0xdac17f958d2ee523a2206206994597c13d831ec7",
            "topics": ["0xddf2"],
            "data": "0x",
            "blockNumber": "0x3e8",
            "logIndex": "0x1"
        }))
        .unwrap();
        assert_eq!(log.block_number(), Some(1000));
        assert_eq!(log.log_index(), Some(1));
        assert!(!log.removed);
    }

    #[test]
    fn test_error_response() {
        let resp: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "bsc-1",
            "error": {"code": -32601, "message": "method not found"}
        }))
        .unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, -32601);
    }
}
