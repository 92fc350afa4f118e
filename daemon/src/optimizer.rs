use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use hydrascan_common::network::Network;

// Batched read operations whose chunk size is learned independently
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Erc20,
    NativeBalance,
    ContractCheck,
    Codehash,
}

// Hard bounds and conservative cold-start default per operation
#[derive(Debug, Clone, Copy)]
pub struct ChunkBounds {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
}

impl Operation {
    pub fn bounds(&self) -> ChunkBounds {
        match self {
            // holders x tokens multiplies the response size, keep small
            Operation::Erc20 => ChunkBounds { initial: 50, min: 5, max: 500 },
            Operation::NativeBalance => ChunkBounds { initial: 100, min: 10, max: 1_000 },
            Operation::ContractCheck => ChunkBounds { initial: 200, min: 10, max: 2_000 },
            Operation::Codehash => ChunkBounds { initial: 150, min: 10, max: 1_500 },
        }
    }
}

// Duration ladder applied after every successful chunk
// The target band is [TARGET_MS, SLOW_MS]
pub const TARGET_MS: u64 = 6_000;
pub const SLOW_MS: u64 = 12_000;
pub const VERY_SLOW_MS: u64 = 20_000;

// samples needed before the learned summary reaches full confidence
const CONFIDENCE_SAMPLES: u64 = 200;

// minimum successes at one size before it can become the learned initial
const MIN_SUCCESSES_FOR_RECOMMENDATION: u64 = 3;

// Multiply the working chunk size according to the observed duration,
// clamped to the operation bounds
pub fn adjust_chunk_size(current: usize, duration_ms: u64, bounds: ChunkBounds) -> usize {
    let factor = if duration_ms < 800 {
        5.0
    } else if duration_ms < 2_000 {
        3.0
    } else if duration_ms < 4_000 {
        2.0
    } else if duration_ms < TARGET_MS {
        1.5
    } else if duration_ms <= SLOW_MS {
        1.0
    } else if duration_ms <= VERY_SLOW_MS {
        0.7
    } else {
        0.5
    };
    let next = (current as f64 * factor).round() as usize;
    next.clamp(bounds.min, bounds.max)
}

// Shrink after a failed chunk; socket errors cut deeper
pub fn reduced_chunk_size(current: usize, is_socket_error: bool, bounds: ChunkBounds) -> usize {
    let factor = if is_socket_error { 0.3 } else { 0.5 };
    let next = (current as f64 * factor).floor() as usize;
    next.max(bounds.min)
}

// One observed chunk execution
#[derive(Debug, Clone, Copy)]
pub struct ChunkOutcome {
    pub chunk_size: usize,
    pub duration_ms: u64,
    pub success: bool,
    pub is_socket_error: bool,
}

// Rolling per-chunk-size metrics, persisted as-is
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeStats {
    pub successes: u64,
    pub failures: u64,
    pub socket_errors: u64,
    pub mean_duration_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    // keyed by chunk size; BTreeMap keeps the persisted form stable
    pub sizes: BTreeMap<usize, SizeStats>,
    pub samples: u64,
}

impl OptimizerState {
    pub fn record(&mut self, outcome: ChunkOutcome) {
        let stats = self.sizes.entry(outcome.chunk_size).or_default();
        if outcome.success {
            let n = stats.successes as f64;
            stats.mean_duration_ms =
                (stats.mean_duration_ms * n + outcome.duration_ms as f64) / (n + 1.0);
            stats.successes += 1;
        } else {
            stats.failures += 1;
            if outcome.is_socket_error {
                stats.socket_errors += 1;
            }
        }
        self.samples += 1;
    }

    // Learned start parameters: the size with the best observed
    // throughput among sizes that succeeded often enough
    pub fn summary(&self, bounds: ChunkBounds) -> StartParams {
        let confidence = (self.samples as f64 / CONFIDENCE_SAMPLES as f64).min(1.0);

        let best = self
            .sizes
            .iter()
            .filter(|(_, stats)| {
                stats.successes >= MIN_SUCCESSES_FOR_RECOMMENDATION
                    && stats.socket_errors * 2 <= stats.successes
                    && stats.mean_duration_ms > 0.0
            })
            .max_by(|(size_a, a), (size_b, b)| {
                let throughput_a = **size_a as f64 / a.mean_duration_ms;
                let throughput_b = **size_b as f64 / b.mean_duration_ms;
                throughput_a
                    .partial_cmp(&throughput_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(size, _)| *size);

        match best {
            Some(size) => StartParams {
                initial: size.clamp(bounds.min, bounds.max),
                max: bounds.max,
                confidence,
            },
            None => StartParams {
                initial: bounds.initial,
                max: bounds.max,
                confidence: 0.0,
            },
        }
    }
}

// What a fresh process starts from: a learned initial when the stored
// session has seen enough samples, the conservative default otherwise
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartParams {
    pub initial: usize,
    pub max: usize,
    pub confidence: f64,
}

// Stateful learner for one (network, operation) pair
// Pure given its state; persistence is a repository concern
pub struct ChunkOptimizer {
    network: Network,
    operation: Operation,
    bounds: ChunkBounds,
    state: Mutex<OptimizerState>,
    recorded_since_flush: Mutex<u64>,
}

impl ChunkOptimizer {
    pub fn new(network: Network, operation: Operation, stored: Option<OptimizerState>) -> Self {
        let bounds = operation.bounds();
        Self {
            network,
            operation,
            bounds,
            state: Mutex::new(stored.unwrap_or_default()),
            recorded_since_flush: Mutex::new(0),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn bounds(&self) -> ChunkBounds {
        self.bounds
    }

    pub fn start_params(&self) -> StartParams {
        let state = self.state.lock().expect("optimizer state poisoned");
        let summary = state.summary(self.bounds);
        if summary.confidence >= 0.5 {
            summary
        } else {
            StartParams {
                initial: self.bounds.initial,
                max: self.bounds.max,
                confidence: summary.confidence,
            }
        }
    }

    // Returns true when enough outcomes accumulated to snapshot
    pub fn record(&self, outcome: ChunkOutcome) -> bool {
        self.state
            .lock()
            .expect("optimizer state poisoned")
            .record(outcome);
        let mut counter = self
            .recorded_since_flush
            .lock()
            .expect("optimizer counter poisoned");
        *counter += 1;
        if *counter >= crate::config::OPTIMIZER_PERSIST_INTERVAL {
            *counter = 0;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> OptimizerState {
        self.state.lock().expect("optimizer state poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: ChunkBounds = ChunkBounds { initial: 100, min: 10, max: 1_000 };

    #[test]
    fn test_adjustment_ladder() {
        assert_eq!(adjust_chunk_size(100, 500, BOUNDS), 500);
        assert_eq!(adjust_chunk_size(100, 1_500, BOUNDS), 300);
        assert_eq!(adjust_chunk_size(100, 3_000, BOUNDS), 200);
        assert_eq!(adjust_chunk_size(100, 5_000, BOUNDS), 150);
        // inside the target band: hold
        assert_eq!(adjust_chunk_size(100, 8_000, BOUNDS), 100);
        assert_eq!(adjust_chunk_size(100, 15_000, BOUNDS), 70);
        assert_eq!(adjust_chunk_size(100, 30_000, BOUNDS), 50);
    }

    #[test]
    fn test_adjustment_respects_bounds() {
        // a fast response at the cap must not grow past the cap
        assert_eq!(adjust_chunk_size(1_000, 100, BOUNDS), 1_000);
        assert_eq!(adjust_chunk_size(10, 60_000, BOUNDS), 10);
    }

    #[test]
    fn test_reduction_factors() {
        assert_eq!(reduced_chunk_size(100, false, BOUNDS), 50);
        assert_eq!(reduced_chunk_size(100, true, BOUNDS), 30);
        assert_eq!(reduced_chunk_size(12, true, BOUNDS), 10);
    }

    #[test]
    fn test_cold_start_uses_defaults() {
        let optimizer = ChunkOptimizer::new(Network::Ethereum, Operation::NativeBalance, None);
        let params = optimizer.start_params();
        assert_eq!(params.initial, Operation::NativeBalance.bounds().initial);
        assert_eq!(params.confidence, 0.0);
    }

    #[test]
    fn test_confidence_grows_monotonically() {
        let mut state = OptimizerState::default();
        let mut last = 0.0;
        for _ in 0..CONFIDENCE_SAMPLES + 50 {
            state.record(ChunkOutcome {
                chunk_size: 100,
                duration_ms: 2_000,
                success: true,
                is_socket_error: false,
            });
            let confidence = state.summary(BOUNDS).confidence;
            assert!(confidence >= last);
            last = confidence;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn test_summary_prefers_best_throughput() {
        let mut state = OptimizerState::default();
        for _ in 0..10 {
            // 100 per 2s = 50/s
            state.record(ChunkOutcome { chunk_size: 100, duration_ms: 2_000, success: true, is_socket_error: false });
            // 400 per 4s = 100/s
            state.record(ChunkOutcome { chunk_size: 400, duration_ms: 4_000, success: true, is_socket_error: false });
        }
        assert_eq!(state.summary(BOUNDS).initial, 400);
    }

    #[test]
    fn test_summary_skips_socket_heavy_sizes() {
        let mut state = OptimizerState::default();
        for _ in 0..10 {
            state.record(ChunkOutcome { chunk_size: 100, duration_ms: 2_000, success: true, is_socket_error: false });
        }
        for _ in 0..4 {
            state.record(ChunkOutcome { chunk_size: 800, duration_ms: 1_000, success: true, is_socket_error: false });
        }
        for _ in 0..8 {
            state.record(ChunkOutcome { chunk_size: 800, duration_ms: 0, success: false, is_socket_error: true });
        }
        assert_eq!(state.summary(BOUNDS).initial, 100);
    }

    #[test]
    fn test_state_roundtrip_preserves_summary() {
        let mut state = OptimizerState::default();
        for i in 0..250u64 {
            state.record(ChunkOutcome {
                chunk_size: if i % 2 == 0 { 100 } else { 200 },
                duration_ms: 1_000 + i * 10,
                success: true,
                is_socket_error: false,
            });
        }
        let json = serde_json::to_value(&state).unwrap();
        let restored: OptimizerState = serde_json::from_value(json).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.summary(BOUNDS), state.summary(BOUNDS));
    }

    #[test]
    fn test_operation_string_form() {
        assert_eq!(Operation::NativeBalance.to_string(), "native-balance");
        assert_eq!("contract-check".parse::<Operation>().unwrap(), Operation::ContractCheck);
        assert_eq!("codehash".parse::<Operation>().unwrap(), Operation::Codehash);
    }
}
