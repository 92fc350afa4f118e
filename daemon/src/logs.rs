use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use hydrascan_common::{
    api::rpc::{LogFilter, RpcLog},
    config::{PROVIDER_LOG_HARD_CAP, TRANSFER_TOPIC},
    network::{ActivityLevel, Network, ProviderTier},
    time::get_current_time_in_seconds,
};

use crate::registry::NetworkConfig;
use crate::rpc::{RpcClient, RpcError};

// Watchdog applied on top of the client timeouts; when it fires the
// current endpoint is force-rotated
const GETLOGS_WATCHDOG_SECS: u64 = 120;

// Retries within one batch while the range keeps being rejected
const RANGE_SHRINK_ATTEMPTS: u32 = 6;

// Samples needed before stored density stats may override a profile
const DENSITY_CONFIDENCE_SAMPLES: u64 = 20;

// Smoothing factor of the logs-per-block moving average
const DENSITY_ALPHA: f64 = 0.2;

// Batch sizing parameters for one (activity, tier) pairing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogsProfile {
    pub initial_batch: u64,
    pub min_batch: u64,
    pub max_batch: u64,
    pub target_duration_ms: u64,
    pub target_logs_per_request: usize,
    pub fast_multiplier: f64,
    pub slow_multiplier: f64,
}

impl LogsProfile {
    // Responses faster than this with few logs are under-utilizing
    pub fn fast_response_ms(&self) -> u64 {
        self.target_duration_ms / 2
    }

    pub fn slow_response_ms(&self) -> u64 {
        self.target_duration_ms * 2
    }
}

// The static profile table over density class x provider tier
// Dense chains pair small ranges with patient growth, sparse chains
// the opposite; free tiers stay pinned under the 10-block cap
pub fn profile_for(activity: ActivityLevel, tier: ProviderTier) -> LogsProfile {
    use ActivityLevel::*;
    use ProviderTier::*;

    match (activity, tier) {
        (UltraHigh, Free) => LogsProfile {
            initial_batch: 5,
            min_batch: 1,
            max_batch: 10,
            target_duration_ms: 6_000,
            target_logs_per_request: 2_000,
            fast_multiplier: 1.5,
            slow_multiplier: 0.5,
        },
        (UltraHigh, Payg) => LogsProfile {
            initial_batch: 50,
            min_batch: 10,
            max_batch: 500,
            target_duration_ms: 8_000,
            target_logs_per_request: 4_000,
            fast_multiplier: 1.5,
            slow_multiplier: 0.5,
        },
        (UltraHigh, Growth) => LogsProfile {
            initial_batch: 200,
            min_batch: 20,
            max_batch: 2_000,
            target_duration_ms: 8_000,
            target_logs_per_request: 5_000,
            fast_multiplier: 2.0,
            slow_multiplier: 0.5,
        },
        (High, Free) => LogsProfile {
            initial_batch: 8,
            min_batch: 1,
            max_batch: 10,
            target_duration_ms: 6_000,
            target_logs_per_request: 2_000,
            fast_multiplier: 1.5,
            slow_multiplier: 0.5,
        },
        (High, Payg) => LogsProfile {
            initial_batch: 100,
            min_batch: 10,
            max_batch: 1_000,
            target_duration_ms: 8_000,
            target_logs_per_request: 3_000,
            fast_multiplier: 2.0,
            slow_multiplier: 0.5,
        },
        (High, Growth) => LogsProfile {
            initial_batch: 400,
            min_batch: 40,
            max_batch: 4_000,
            target_duration_ms: 8_000,
            target_logs_per_request: 4_000,
            fast_multiplier: 2.0,
            slow_multiplier: 0.5,
        },
        (Medium, Free) => LogsProfile {
            initial_batch: 10,
            min_batch: 2,
            max_batch: 10,
            target_duration_ms: 6_000,
            target_logs_per_request: 1_500,
            fast_multiplier: 1.5,
            slow_multiplier: 0.6,
        },
        (Medium, Payg) => LogsProfile {
            initial_batch: 250,
            min_batch: 25,
            max_batch: 2_500,
            target_duration_ms: 8_000,
            target_logs_per_request: 2_000,
            fast_multiplier: 2.0,
            slow_multiplier: 0.6,
        },
        (Medium, Growth) => LogsProfile {
            initial_batch: 1_000,
            min_batch: 100,
            max_batch: 10_000,
            target_duration_ms: 9_000,
            target_logs_per_request: 3_000,
            fast_multiplier: 2.5,
            slow_multiplier: 0.6,
        },
        (Low, Free) => LogsProfile {
            initial_batch: 10,
            min_batch: 2,
            max_batch: 10,
            target_duration_ms: 6_000,
            target_logs_per_request: 1_000,
            fast_multiplier: 1.5,
            slow_multiplier: 0.6,
        },
        (Low, Payg) => LogsProfile {
            initial_batch: 500,
            min_batch: 50,
            max_batch: 5_000,
            target_duration_ms: 9_000,
            target_logs_per_request: 1_500,
            fast_multiplier: 2.5,
            slow_multiplier: 0.6,
        },
        (Low, Growth) => LogsProfile {
            initial_batch: 2_000,
            min_batch: 200,
            max_batch: 20_000,
            target_duration_ms: 10_000,
            target_logs_per_request: 2_000,
            fast_multiplier: 3.0,
            slow_multiplier: 0.6,
        },
        (Legacy, Free) => LogsProfile {
            initial_batch: 10,
            min_batch: 2,
            max_batch: 10,
            target_duration_ms: 6_000,
            target_logs_per_request: 500,
            fast_multiplier: 1.5,
            slow_multiplier: 0.7,
        },
        (Legacy, Payg) => LogsProfile {
            initial_batch: 1_000,
            min_batch: 100,
            max_batch: 10_000,
            target_duration_ms: 10_000,
            target_logs_per_request: 1_000,
            fast_multiplier: 3.0,
            slow_multiplier: 0.7,
        },
        (Legacy, Growth) => LogsProfile {
            initial_batch: 5_000,
            min_batch: 500,
            max_batch: 50_000,
            target_duration_ms: 12_000,
            target_logs_per_request: 1_500,
            fast_multiplier: 3.0,
            slow_multiplier: 0.7,
        },
    }
}

// Tier from the two probe outcomes: a 100-block range passing means
// growth, an 11-block range passing on its own means pay-as-you-go,
// neither means the free tier's hard 10-block cap
pub fn tier_from_probes(ok_100: bool, ok_11: bool) -> ProviderTier {
    if ok_100 {
        ProviderTier::Growth
    } else if ok_11 {
        ProviderTier::Payg
    } else {
        ProviderTier::Free
    }
}

// Persisted rolling density stats, one row per network
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DensityStats {
    pub avg_logs_per_block: f64,
    pub total_blocks: u64,
    pub total_logs: u64,
    pub sample_count: u64,
    pub optimal_batch_size: u64,
    pub recommended_profile: String,
    pub last_updated: u64,
}

impl DensityStats {
    pub fn record(&mut self, blocks: u64, logs: usize, hit_target_band: bool) {
        if blocks == 0 {
            return;
        }
        let observed = logs as f64 / blocks as f64;
        if self.sample_count == 0 {
            self.avg_logs_per_block = observed;
        } else {
            self.avg_logs_per_block += (observed - self.avg_logs_per_block) * DENSITY_ALPHA;
        }
        self.total_blocks += blocks;
        self.total_logs += logs as u64;
        self.sample_count += 1;
        if hit_target_band {
            self.optimal_batch_size = blocks;
        }
        self.last_updated = get_current_time_in_seconds();
    }

    pub fn is_confident(&self) -> bool {
        self.sample_count >= DENSITY_CONFIDENCE_SAMPLES && self.optimal_batch_size > 0
    }
}

// Some providers reject an oversized range and suggest a valid one:
// "... Try with this block range [0x3e8, 0x7cf]" — use their hint
pub fn parse_suggested_range(message: &str) -> Option<u64> {
    let open = message.rfind('[')?;
    let close = message[open..].find(']')? + open;
    let inner = &message[open + 1..close];
    let mut parts = inner.split(',').map(str::trim);
    let from = parse_hex_or_dec(parts.next()?)?;
    let to = parse_hex_or_dec(parts.next()?)?;
    if to >= from {
        Some(to - from + 1)
    } else {
        None
    }
}

fn parse_hex_or_dec(raw: &str) -> Option<u64> {
    if let Some(hex_part) = raw.strip_prefix("0x") {
        u64::from_str_radix(hex_part, 16).ok()
    } else {
        raw.parse().ok()
    }
}

pub fn is_range_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("query returned more than")
        || lower.contains("block range")
        || lower.contains("too many results")
        || lower.contains("log response size exceeded")
}

// Pure sizing rule applied after every successful request
pub fn next_batch_size(
    current: u64,
    duration_ms: u64,
    logs: usize,
    profile: &LogsProfile,
    tier_cap: u64,
) -> u64 {
    let factor = if logs >= PROVIDER_LOG_HARD_CAP {
        // hitting the provider cap means logs were truncated
        profile.slow_multiplier
    } else if duration_ms < profile.fast_response_ms()
        && logs < profile.target_logs_per_request / 2
    {
        profile.fast_multiplier
    } else if duration_ms > profile.slow_response_ms() || logs > profile.target_logs_per_request {
        profile.slow_multiplier
    } else {
        1.0
    };

    let next = (current as f64 * factor).round() as u64;
    next.clamp(profile.min_batch, profile.max_batch.min(tier_cap))
}

// Rolling-window Transfer log fetcher with density-driven batch sizing
pub struct AdaptiveLogFetcher {
    network: Network,
    rpc: Arc<RpcClient>,
    profile: LogsProfile,
    tier: ProviderTier,
    tier_cap: u64,
    batch_size: AtomicU64,
    density: Mutex<DensityStats>,
    iterations: AtomicU64,
    dynamically_tuned: bool,
    original_initial: u64,
}

impl AdaptiveLogFetcher {
    // Resolve the profile: static activity class, probed tier, then
    // the learned initial size when the stored stats are confident
    pub async fn start(
        rpc: Arc<RpcClient>,
        config: &NetworkConfig,
        stored: Option<DensityStats>,
    ) -> Result<Self, RpcError> {
        let network = config.network;
        let tier = Self::detect_tier(&rpc).await?;
        let tier_cap = config.tier_caps.cap_for(tier);
        let mut profile = profile_for(network.activity(), tier);
        let original_initial = profile.initial_batch;

        let mut dynamically_tuned = false;
        let density = stored.unwrap_or_default();
        if density.is_confident() {
            let learned = density
                .optimal_batch_size
                .clamp(profile.min_batch, profile.max_batch.min(tier_cap));
            info!(
                "{}: overriding initial batch {} with learned {} ({} samples)",
                network, profile.initial_batch, learned, density.sample_count
            );
            profile.initial_batch = learned;
            dynamically_tuned = true;
        }

        info!(
            "{}: log fetcher ready, tier {} (cap {} blocks), initial batch {}",
            network, tier, tier_cap, profile.initial_batch
        );

        Ok(Self {
            network,
            rpc,
            batch_size: AtomicU64::new(profile.initial_batch),
            profile,
            tier,
            tier_cap,
            density: Mutex::new(density),
            iterations: AtomicU64::new(0),
            dynamically_tuned,
            original_initial,
        })
    }

    async fn detect_tier(rpc: &Arc<RpcClient>) -> Result<ProviderTier, RpcError> {
        let head = rpc.get_block_number().await?;
        let ok_100 = Self::probe(rpc, head.saturating_sub(100), head).await;
        let ok_11 = if ok_100 {
            true
        } else {
            Self::probe(rpc, head.saturating_sub(11), head).await
        };
        Ok(tier_from_probes(ok_100, ok_11))
    }

    async fn probe(rpc: &Arc<RpcClient>, from: u64, to: u64) -> bool {
        let filter = LogFilter::for_topic0(from, to, TRANSFER_TOPIC);
        match serde_json::to_value(&filter) {
            Ok(value) => rpc.get_logs(value).await.is_ok(),
            Err(_) => false,
        }
    }

    pub fn tier(&self) -> ProviderTier {
        self.tier
    }

    pub fn profile(&self) -> &LogsProfile {
        &self.profile
    }

    pub fn is_dynamically_tuned(&self) -> bool {
        self.dynamically_tuned
    }

    pub fn original_initial_batch(&self) -> u64 {
        self.original_initial
    }

    pub fn current_batch_size(&self) -> u64 {
        self.batch_size.load(Ordering::Relaxed)
    }

    pub fn density_snapshot(&self) -> DensityStats {
        let mut snapshot = self
            .density
            .lock()
            .expect("density stats poisoned")
            .clone();
        snapshot.recommended_profile = format!("{}-{}", self.network.activity(), self.tier);
        snapshot
    }

    // True every DENSITY_PERSIST_INTERVAL successful fetches: time to
    // write the single stats row
    pub fn should_persist(&self) -> bool {
        let n = self.iterations.fetch_add(1, Ordering::Relaxed) + 1;
        n % crate::config::DENSITY_PERSIST_INTERVAL == 0
    }

    // Fetch the next sub-range starting at `from`, never crossing
    // `to_max`. Returns the logs in ascending (block, index) order and
    // the last block actually covered.
    pub async fn fetch_batch(
        &self,
        from: u64,
        to_max: u64,
    ) -> Result<(Vec<RpcLog>, u64), RpcError> {
        let mut attempts = 0u32;

        loop {
            let size = self.current_batch_size().max(1);
            let to = to_max.min(from + size - 1);
            let blocks = to - from + 1;
            let filter = LogFilter::for_topic0(from, to, TRANSFER_TOPIC);
            let filter_value =
                serde_json::to_value(&filter).map_err(|e| RpcError::Shape(e.to_string()))?;

            let started = Instant::now();
            let outcome = match timeout(
                Duration::from_secs(GETLOGS_WATCHDOG_SECS),
                self.rpc.get_logs(filter_value),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    // the client-side deadline may still be pending;
                    // rotate away from the stuck endpoint ourselves
                    self.rpc.force_next_rpc();
                    Err(RpcError::Timeout)
                }
            };

            match outcome {
                Ok(mut logs) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    logs.sort_by_key(|l| (l.block_number().unwrap_or(0), l.log_index().unwrap_or(0)));

                    counter!("logs_fetched_total", "network" => self.network.to_string())
                        .increment(logs.len() as u64);
                    histogram!("getlogs_duration_ms", "network" => self.network.to_string())
                        .record(duration_ms as f64);

                    let next =
                        next_batch_size(blocks, duration_ms, logs.len(), &self.profile, self.tier_cap);
                    self.batch_size.store(next, Ordering::Relaxed);

                    let hit_band = duration_ms <= self.profile.slow_response_ms()
                        && duration_ms >= self.profile.fast_response_ms()
                        && logs.len() < PROVIDER_LOG_HARD_CAP;
                    self.density
                        .lock()
                        .expect("density stats poisoned")
                        .record(blocks, logs.len(), hit_band);

                    return Ok((logs, to));
                }
                Err(RpcError::Node { code, message }) if is_range_error(&message) => {
                    attempts += 1;
                    if attempts > RANGE_SHRINK_ATTEMPTS {
                        return Err(RpcError::Node { code, message });
                    }
                    let shrunk = match parse_suggested_range(&message) {
                        // the provider told us what it will accept
                        Some(suggested) => suggested.max(self.profile.min_batch),
                        None => {
                            let reduced =
                                (blocks as f64 * self.profile.slow_multiplier).round() as u64;
                            reduced.max(self.profile.min_batch)
                        }
                    };
                    debug!(
                        "{}: range [{}, {}] rejected, retrying with {} blocks",
                        self.network, from, to, shrunk
                    );
                    self.batch_size.store(shrunk, Ordering::Relaxed);
                }
                Err(error) => return Err(error),
            }
        }
    }
}
