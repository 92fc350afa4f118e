use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{sleep, timeout};

use hydrascan_common::{
    api::rpc::{RpcBlock, RpcLog, RpcRequest, RpcResponse, RpcTransaction},
    config::{
        RPC_GLOBAL_RETRIES, RPC_REQUEST_TIMEOUT_SECS, RPC_WALL_CLOCK_TIMEOUT_SECS,
    },
    network::Network,
    utils::{parse_quantity, parse_u256},
};

use crate::registry::NetworkConfig;
use crate::scheduler::{QueueKind, RateLimiter};

use super::{EndpointMark, EndpointRegistry};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("endpoint rejected the request: {0}")]
    Permanent(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("no endpoint available for {0}")]
    NoEndpoints(Network),
    #[error("invalid result shape: {0}")]
    Shape(String),
}

// How an error should be reflected in the endpoint health map
// First matching rule wins
pub fn classify(error: &RpcError) -> Option<EndpointMark> {
    let message = match error {
        RpcError::Timeout => return Some(EndpointMark::Slow),
        RpcError::Permanent(_) => return Some(EndpointMark::PermanentFailed),
        RpcError::RateLimited(_) => return Some(EndpointMark::TempFailed),
        RpcError::Malformed(_) => return Some(EndpointMark::TempFailedSlow),
        RpcError::Transient(m) => m.as_str(),
        RpcError::Node { code, message } => {
            if *code == -32601 {
                return Some(EndpointMark::TempFailedSlow);
            }
            message.as_str()
        }
        RpcError::NoEndpoints(_) | RpcError::Shape(_) => return None,
    };

    if is_timeout_message(message) {
        return Some(EndpointMark::Slow);
    }
    if is_permanent_message(message) {
        return Some(EndpointMark::PermanentFailed);
    }
    if is_network_down_message(message) || message.contains("method not found") {
        return Some(EndpointMark::TempFailedSlow);
    }
    // gas errors and everything else stay temporary
    Some(EndpointMark::TempFailed)
}

pub fn is_timeout_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("timeout") || lower.contains("timed out") || message.contains("ECONNABORTED")
}

pub fn is_permanent_message(message: &str) -> bool {
    const MARKERS: [&str; 6] = [
        "Unauthorized",
        "API key disabled",
        "sanctioned",
        "certificate",
        "Must be authenticated",
        "Please specify an address",
    ];
    MARKERS.iter().any(|m| message.contains(m))
}

pub fn is_network_down_message(message: &str) -> bool {
    const MARKERS: [&str; 4] = ["ENOTFOUND", "ECONNREFUSED", "ECONNRESET", "dns error"];
    MARKERS.iter().any(|m| message.contains(m))
}

pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
}

// Backoff after the whole endpoint list failed once
pub fn global_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2) * attempt
}

// Capped exponential backoff for rate-limit rejections
pub fn rate_limit_backoff(attempt: u32) -> Duration {
    let secs = 5u64.saturating_mul(1 << (attempt.saturating_sub(1).min(16)));
    Duration::from_secs(secs.min(30))
}

// JSON-RPC over HTTP with endpoint rotation and tiered failure state
// One instance per network; the endpoint registry, scheduler and HTTP
// connection pool are shared across all of them
pub struct RpcClient {
    network: Network,
    http: reqwest::Client,
    urls: Vec<String>,
    primary: String,
    endpoints: Arc<EndpointRegistry>,
    limiter: Arc<RateLimiter>,
    counter: AtomicU64,
    // endpoint the last request was pinned to, for the watchdog
    current: Mutex<Option<String>>,
}

impl RpcClient {
    pub fn new(
        config: &NetworkConfig,
        endpoints: Arc<EndpointRegistry>,
        limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(RPC_REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            network: config.network,
            http,
            urls: config.rpc_urls.clone(),
            primary: config.primary_url().to_string(),
            endpoints,
            limiter,
            counter: AtomicU64::new(0),
            current: Mutex::new(None),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    // Request ids are unique per network so scanners sharing one HTTP
    // pool never collide
    fn next_request_id(&self) -> String {
        format!("{}-{}", self.network, self.counter.fetch_add(1, Ordering::Relaxed))
    }

    fn set_current(&self, url: Option<String>) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = url;
        }
    }

    // Scanner-level watchdog entry point: a wall-clock deadline may
    // fire before the HTTP timeout does, so the stuck endpoint is
    // demoted from outside and the next attempt rotates past it
    pub fn force_next_rpc(&self) {
        let current = self.current.lock().ok().and_then(|mut g| g.take());
        if let Some(url) = current {
            self.endpoints.force_switch(self.network, &url);
        }
    }

    async fn call_once(&self, url: &str, method: &str, params: &Value) -> Result<Value, RpcError> {
        let request = RpcRequest::new(self.next_request_id(), method, params.clone());
        let http = self.http.clone();
        let url_owned = url.to_string();

        let send = self.limiter.run(QueueKind::Rpc, async move {
            let response = http
                .post(&url_owned)
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        RpcError::Timeout
                    } else if e.is_connect() {
                        RpcError::Transient(format!("ECONNREFUSED: {}", e))
                    } else {
                        RpcError::Transient(e.to_string())
                    }
                })?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(RpcError::Permanent(format!("http status {}", status)));
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(RpcError::RateLimited(format!("http status {}", status)));
            }
            if !status.is_success() {
                return Err(RpcError::Transient(format!("http status {}", status)));
            }

            let parsed: RpcResponse = response
                .json()
                .await
                .map_err(|e| RpcError::Malformed(e.to_string()))?;

            if let Some(error) = parsed.error {
                if is_rate_limit_message(&error.message) {
                    return Err(RpcError::RateLimited(error.message));
                }
                return Err(RpcError::Node {
                    code: error.code,
                    message: error.message,
                });
            }
            parsed
                .result
                .ok_or_else(|| RpcError::Malformed("response carries neither result nor error".to_string()))
        });

        // wall-clock race on top of the HTTP-level timeout
        match timeout(Duration::from_secs(RPC_WALL_CLOCK_TIMEOUT_SECS), send).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    // Rotation backend: walk the current selection, mark failures,
    // then retry globally with backoff
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let mut last_error = RpcError::NoEndpoints(self.network);
        let mut rate_limit_hits = 0u32;

        for attempt in 0..=RPC_GLOBAL_RETRIES {
            if attempt > 0 {
                let backoff = if matches!(last_error, RpcError::RateLimited(_)) {
                    rate_limit_backoff(rate_limit_hits)
                } else {
                    global_backoff(attempt)
                };
                debug!(
                    "{}: retrying {} in {} (attempt {})",
                    self.network,
                    method,
                    humantime::format_duration(backoff),
                    attempt
                );
                sleep(backoff).await;
            }

            let selection = self.endpoints.selection(self.network, &self.urls);
            if selection.is_empty() {
                return Err(RpcError::NoEndpoints(self.network));
            }

            for url in selection {
                self.set_current(Some(url.clone()));
                match self.call_once(&url, method, &params).await {
                    Ok(value) => {
                        counter!("rpc_requests_total", "network" => self.network.to_string(), "outcome" => "ok")
                            .increment(1);
                        return Ok(value);
                    }
                    Err(error) => {
                        counter!("rpc_requests_total", "network" => self.network.to_string(), "outcome" => "error")
                            .increment(1);
                        if matches!(error, RpcError::RateLimited(_)) {
                            rate_limit_hits += 1;
                        }
                        if let Some(mark) = classify(&error) {
                            self.endpoints.mark(self.network, &url, mark);
                        }
                        debug!("{}: {} failed on {}: {}", self.network, method, url, error);
                        last_error = error;
                    }
                }
            }
        }

        Err(last_error)
    }

    // Provider-primary backend: a single canonical endpoint for calls
    // that must stay on one provider (getLogs, tier probing, chunked
    // batch reads governed by the optimizer)
    pub async fn call_primary(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let mut last_error = RpcError::NoEndpoints(self.network);

        for attempt in 0..=RPC_GLOBAL_RETRIES {
            if attempt > 0 {
                let backoff = if matches!(last_error, RpcError::RateLimited(_)) {
                    rate_limit_backoff(attempt)
                } else {
                    global_backoff(attempt)
                };
                sleep(backoff).await;
            }

            self.set_current(Some(self.primary.clone()));
            match self.call_once(&self.primary, method, &params).await {
                Ok(value) => return Ok(value),
                Err(error @ (RpcError::Node { .. } | RpcError::Permanent(_))) => {
                    // the provider answered; retrying the same request
                    // will not change the verdict
                    return Err(error);
                }
                Err(error) => {
                    debug!("{}: primary {} failed: {}", self.network, method, error);
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }

    pub async fn get_block_number(&self) -> Result<u64, RpcError> {
        let value = self.call("eth_blockNumber", json!([])).await?;
        let quantity = value
            .as_str()
            .ok_or_else(|| RpcError::Shape("eth_blockNumber result is not a string".to_string()))?;
        parse_quantity(quantity).map_err(|e| RpcError::Shape(e.to_string()))
    }

    pub async fn get_block_by_number(
        &self,
        number: u64,
        include_tx: bool,
    ) -> Result<Option<RpcBlock>, RpcError> {
        let value = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("{:#x}", number), include_tx]),
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RpcError::Shape(e.to_string()))
    }

    pub async fn get_logs(&self, filter: Value) -> Result<Vec<RpcLog>, RpcError> {
        let value = self.call_primary("eth_getLogs", json!([filter])).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Shape(e.to_string()))
    }

    pub async fn get_code(&self, address: &str) -> Result<String, RpcError> {
        let value = self
            .call("eth_getCode", json!([address, "latest"]))
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Shape("eth_getCode result is not a string".to_string()))
    }

    pub async fn get_balance(&self, address: &str) -> Result<alloy_primitives::U256, RpcError> {
        let value = self
            .call("eth_getBalance", json!([address, "latest"]))
            .await?;
        let quantity = value
            .as_str()
            .ok_or_else(|| RpcError::Shape("eth_getBalance result is not a string".to_string()))?;
        parse_u256(quantity).map_err(|e| RpcError::Shape(e.to_string()))
    }

    pub async fn get_transaction_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<RpcTransaction>, RpcError> {
        let value = self.call("eth_getTransactionByHash", json!([hash])).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RpcError::Shape(e.to_string()))
    }

    pub async fn get_transaction_receipt(&self, hash: &str) -> Result<Value, RpcError> {
        self.call("eth_getTransactionReceipt", json!([hash])).await
    }

    // Raw eth_call against the provider-primary endpoint, used for
    // the aggregator helpers where chunk sizing is learned per provider
    pub async fn eth_call_primary(&self, to: &str, data: &str) -> Result<String, RpcError> {
        let value = self
            .call_primary("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Shape("eth_call result is not a string".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_marks_slow() {
        assert_eq!(classify(&RpcError::Timeout), Some(EndpointMark::Slow));
    }

    #[test]
    fn test_permanent_markers() {
        for message in [
            "Unauthorized",
            "API key disabled",
            "address is sanctioned",
            "certificate has expired",
            "Must be authenticated",
            "Please specify an address",
        ] {
            assert_eq!(
                classify(&RpcError::Node {
                    code: -32000,
                    message: message.to_string()
                }),
                Some(EndpointMark::PermanentFailed),
                "{message}"
            );
        }
    }

    #[test]
    fn test_method_not_found_is_temp_and_slow() {
        assert_eq!(
            classify(&RpcError::Node {
                code: -32601,
                message: "the method does not exist".to_string()
            }),
            Some(EndpointMark::TempFailedSlow)
        );
    }

    #[test]
    fn test_network_down_is_temp_and_slow() {
        assert_eq!(
            classify(&RpcError::Transient("ECONNRESET by peer".to_string())),
            Some(EndpointMark::TempFailedSlow)
        );
    }

    #[test]
    fn test_gas_error_is_temporary_only() {
        assert_eq!(
            classify(&RpcError::Node {
                code: -32000,
                message: "out of gas".to_string()
            }),
            Some(EndpointMark::TempFailed)
        );
    }

    #[test]
    fn test_rate_limit_backoff_is_capped() {
        assert_eq!(rate_limit_backoff(1), Duration::from_secs(5));
        assert_eq!(rate_limit_backoff(2), Duration::from_secs(10));
        assert_eq!(rate_limit_backoff(3), Duration::from_secs(20));
        assert_eq!(rate_limit_backoff(4), Duration::from_secs(30));
        assert_eq!(rate_limit_backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn test_global_backoff_is_linear() {
        assert_eq!(global_backoff(1), Duration::from_secs(2));
        assert_eq!(global_backoff(3), Duration::from_secs(6));
    }
}
