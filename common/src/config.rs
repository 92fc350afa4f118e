use crate::time::TimestampSeconds;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// keccak256("Transfer(address,address,uint256)")
// Used as topic0 filter on every eth_getLogs request
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

// keccak256 of the empty byte string, returned by code-hash helpers
// for addresses without bytecode
pub const EMPTY_CODE_HASH: &str =
    "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470";

// All-zero code hash, the aggregator convention for "no code"
pub const ZERO_CODE_HASH: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

// Millis per second, it is used to prevent having random 1000 values anywhere
pub const MILLIS_PER_SECOND: u64 = 1000;

// Scheduler defaults
// Explorer APIs are far stricter than node RPCs, keep the cap low
pub const EXPLORER_MAX_CONCURRENT: usize = 3;
pub const RPC_MAX_CONCURRENT: usize = 8;
pub const EXPLORER_MIN_DELAY_MS: u64 = 250;
pub const EXPLORER_MAX_DELAY_MS: u64 = 600;
pub const RPC_MIN_DELAY_MS: u64 = 20;
pub const RPC_MAX_DELAY_MS: u64 = 120;

// RPC client timeouts
// Hard timeout applied by reqwest on each HTTP request
pub const RPC_REQUEST_TIMEOUT_SECS: u64 = 25;
// Wall-clock cap raced against every RPC call
pub const RPC_WALL_CLOCK_TIMEOUT_SECS: u64 = 120;
// Slow / temporarily-failed endpoint states expire after this delay
pub const ENDPOINT_STATE_TTL_SECS: u64 = 5 * 60;
// Global retries once the whole endpoint list has been exhausted
pub const RPC_GLOBAL_RETRIES: u32 = 3;

// Explorer client retries
pub const EXPLORER_MAX_RETRIES: u32 = 3;
// Base backoff for unified-mode endpoints (shared quota across chains)
pub const EXPLORER_UNIFIED_BACKOFF_SECS: u64 = 12;
// Base backoff for dedicated per-network endpoints
pub const EXPLORER_DEDICATED_BACKOFF_SECS: u64 = 10;
pub const EXPLORER_BACKOFF_JITTER_SECS: u64 = 3;

// Deployment resolver
// getcontractcreation accepts at most 5 comma separated addresses
pub const CREATION_LOOKUP_BATCH: usize = 5;
// Explorer tx hashes of genesis allocations start with this prefix
pub const GENESIS_TX_PREFIX: &str = "GENESIS";

// Batch read engine
// Providers cap a single getLogs response at this many entries
pub const PROVIDER_LOG_HARD_CAP: usize = 10_000;
// Parallel-array responses are re-fetched this many times on length mismatch
pub const SHAPE_MISMATCH_RETRIES: u32 = 3;
pub const SHAPE_MISMATCH_BACKOFF_MS: u64 = 500;

// Fund updater
// Holders are refreshed at most once per this window
pub const DEFAULT_FUND_UPDATE_DELAY_DAYS: u64 = 7;
// A single token position above this USD value is treated as bogus
// (token contract itself, or a mispriced symbol) and dropped
pub const PER_TOKEN_USD_CAP: f64 = 1_000_000_000.0;
// fund is persisted as USD cents
pub const FUND_SCALE: f64 = 100.0;

// Revalidator
pub const DEFAULT_RECENT_DAYS: u64 = 7;
pub const SECONDS_PER_DAY: TimestampSeconds = 86_400;

// Database pool
pub const DB_POOL_MAX_CONNECTIONS: u32 = 20;
pub const DB_POOL_IDLE_TIMEOUT_SECS: u64 = 30;
pub const DB_POOL_ACQUIRE_TIMEOUT_SECS: u64 = 2;
