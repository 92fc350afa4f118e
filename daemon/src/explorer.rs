use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;

use hydrascan_common::{
    api::explorer::{
        is_no_data_message, is_rate_limit_message, ContractCreationEntry, ExplorerEnvelope,
        SourceCodeEntry,
    },
    config::{
        EXPLORER_BACKOFF_JITTER_SECS, EXPLORER_DEDICATED_BACKOFF_SECS, EXPLORER_MAX_RETRIES,
        EXPLORER_UNIFIED_BACKOFF_SECS,
    },
    network::Network,
};

use crate::registry::{ExplorerConfig, ExplorerMode};
use crate::scheduler::{QueueKind, RateLimiter};

#[derive(Debug, Error)]
pub enum ExplorerError {
    #[error("explorer rate limited: {0}")]
    RateLimited(String),
    #[error("explorer request failed: {0}")]
    Hard(String),
    #[error("explorer transport failure: {0}")]
    Transport(String),
}

// Outcome of a single response interpretation, before retry policy
#[derive(Debug)]
enum Outcome {
    Data(Value),
    // "No data found" and friends: an empty result set, not a failure
    Empty,
    RateLimited(String),
    Hard(String),
}

fn interpret(envelope: ExplorerEnvelope, module: &str) -> Outcome {
    // module=proxy responses are JSON-RPC shaped and carry no status
    if module == "proxy" {
        if let Some(result) = envelope.result {
            return Outcome::Data(result);
        }
        return Outcome::Hard(
            envelope
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "proxy response without result".to_string()),
        );
    }

    let message = envelope.message.unwrap_or_default();
    match envelope.status.as_deref() {
        Some("1") => match envelope.result {
            Some(result) => Outcome::Data(result),
            None => Outcome::Hard("status 1 without result".to_string()),
        },
        Some("0") => {
            let result_text = envelope
                .result
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or_default();
            if is_no_data_message(&message) || is_no_data_message(result_text) {
                Outcome::Empty
            } else if is_rate_limit_message(&message) || is_rate_limit_message(result_text) {
                Outcome::RateLimited(format!("{} {}", message, result_text))
            } else {
                Outcome::Hard(format!("{} {}", message, result_text))
            }
        }
        _ => Outcome::Hard(format!("response without status: {}", message)),
    }
}

// Uniform explorer request layer for both the unified v2 endpoint
// (mandatory chainid parameter) and per-network dedicated endpoints
pub struct ExplorerClient {
    network: Network,
    http: reqwest::Client,
    config: ExplorerConfig,
    limiter: Arc<RateLimiter>,
    key_index: AtomicUsize,
}

impl ExplorerClient {
    pub fn new(
        network: Network,
        config: ExplorerConfig,
        limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            network,
            http,
            config,
            limiter,
            key_index: AtomicUsize::new(0),
        })
    }

    fn current_key(&self) -> Option<&str> {
        if self.config.api_keys.is_empty() {
            return None;
        }
        let index = self.key_index.load(Ordering::Relaxed) % self.config.api_keys.len();
        Some(&self.config.api_keys[index])
    }

    // Advance the key ring; every retry rotates to spread quota
    fn advance_key(&self) {
        if !self.config.api_keys.is_empty() {
            self.key_index.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = match self.config.mode {
            ExplorerMode::Unified => EXPLORER_UNIFIED_BACKOFF_SECS,
            ExplorerMode::Dedicated => EXPLORER_DEDICATED_BACKOFF_SECS,
        };
        let jitter = rand::thread_rng().gen_range(0..=EXPLORER_BACKOFF_JITTER_SECS * 1000);
        Duration::from_secs(base * attempt as u64) + Duration::from_millis(jitter)
    }

    fn build_query(&self, module: &str, action: &str, params: &[(String, String)]) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = Vec::with_capacity(params.len() + 4);
        query.push(("module".to_string(), module.to_string()));
        query.push(("action".to_string(), action.to_string()));
        if let Some(chain_id) = self.config.chain_id {
            query.push(("chainid".to_string(), chain_id.to_string()));
        }
        if let Some(key) = self.current_key() {
            query.push(("apikey".to_string(), key.to_string()));
        }
        for (name, value) in params {
            // address-bearing parameters go out lowercased
            let value = if name.contains("address") {
                value.to_lowercase()
            } else {
                value.clone()
            };
            query.push((name.clone(), value));
        }
        query
    }

    async fn send(&self, query: &[(String, String)]) -> Result<ExplorerEnvelope, ExplorerError> {
        // proxy mode first, direct fallback on the same call when the
        // proxy itself is unreachable
        if let Some(proxy) = &self.config.proxy_url {
            let http = self.http.clone();
            let proxy = proxy.clone();
            let body = json!({ "target": self.config.base_url, "query": query });
            let attempt = self
                .limiter
                .run(QueueKind::Explorer, async move {
                    let response = http.post(&proxy).json(&body).send().await?;
                    response.json::<ExplorerEnvelope>().await
                })
                .await;
            match attempt {
                Ok(envelope) => return Ok(envelope),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!("{}: explorer proxy unreachable, using direct mode", self.network);
                }
                Err(e) => return Err(ExplorerError::Transport(e.to_string())),
            }
        }

        let http = self.http.clone();
        let base = self.config.base_url.clone();
        let query = query.to_vec();
        self.limiter
            .run(QueueKind::Explorer, async move {
                let response = http.get(&base).query(&query).send().await?;
                response.json::<ExplorerEnvelope>().await
            })
            .await
            .map_err(|e| ExplorerError::Transport(e.to_string()))
    }

    // Uniform request: {module, action, ...params}
    // Returns Ok(empty array) when the explorer reports no matching
    // data, so callers can treat absence as an answer
    pub async fn request(
        &self,
        module: &str,
        action: &str,
        params: &[(String, String)],
    ) -> Result<Value, ExplorerError> {
        let mut last_error = String::new();

        for attempt in 1..=EXPLORER_MAX_RETRIES {
            if attempt > 1 {
                let backoff = self.backoff(attempt);
                debug!(
                    "{}: explorer {}.{} retry {} in {:?}",
                    self.network, module, action, attempt, backoff
                );
                sleep(backoff).await;
            }

            let query = self.build_query(module, action, params);
            match self.send(&query).await {
                Ok(envelope) => match interpret(envelope, module) {
                    Outcome::Data(value) => {
                        counter!("explorer_requests_total", "network" => self.network.to_string(), "outcome" => "ok")
                            .increment(1);
                        return Ok(value);
                    }
                    Outcome::Empty => return Ok(Value::Array(Vec::new())),
                    Outcome::RateLimited(message) => {
                        counter!("explorer_requests_total", "network" => self.network.to_string(), "outcome" => "rate_limited")
                            .increment(1);
                        self.advance_key();
                        last_error = message;
                    }
                    Outcome::Hard(message) => {
                        return Err(ExplorerError::Hard(message));
                    }
                },
                Err(ExplorerError::Transport(message)) => {
                    self.advance_key();
                    last_error = message;
                }
                Err(other) => return Err(other),
            }
        }

        Err(ExplorerError::RateLimited(last_error))
    }

    // Creation metadata for up to 5 comma separated contract addresses
    pub async fn contract_creation(
        &self,
        addresses: &[String],
    ) -> Result<Vec<ContractCreationEntry>, ExplorerError> {
        let joined = addresses.join(",");
        let value = self
            .request(
                "contract",
                "getcontractcreation",
                &[("contractaddresses".to_string(), joined)],
            )
            .await?;
        // rows the explorer cannot shape are dropped, absence is data
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    // Verified source metadata for a single contract
    pub async fn source_code(
        &self,
        address: &str,
    ) -> Result<Vec<SourceCodeEntry>, ExplorerError> {
        let value = self
            .request(
                "contract",
                "getsourcecode",
                &[("address".to_string(), address.to_string())],
            )
            .await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }
}
