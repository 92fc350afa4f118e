use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_sol_types::{sol, SolCall};
use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;

use hydrascan_common::{
    config::{SHAPE_MISMATCH_BACKOFF_MS, SHAPE_MISMATCH_RETRIES, ZERO_CODE_HASH},
    network::Network,
    utils::is_empty_code,
};

use crate::optimizer::{
    adjust_chunk_size, reduced_chunk_size, ChunkOptimizer, ChunkOutcome, Operation,
};
use crate::rpc::{RpcClient, RpcError};

// On-chain aggregator helpers: many reads folded into one eth_call
sol! {
    function isContract(address[] accounts) returns (bool[]);
    function getCodeHashes(address[] accounts) returns (bytes32[]);
    function getNativeBalance(address[] accounts) returns (uint256[]);
    function getTokenBalance(address[] holders, address[] tokens) returns (uint256[]);
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("aggregator returned {actual} values, expected {expected}")]
    Shape { expected: usize, actual: usize },
    #[error("{0} helper is not deployed on this network")]
    MissingHelper(&'static str),
    #[error("cannot decode aggregator response: {0}")]
    Abi(String),
    #[error("invalid address '{0}'")]
    BadAddress(String),
}

impl BatchError {
    // Shape mismatches survive the chunk shrink ladder: mismatched
    // data must never be persisted, so they abort the whole operation
    fn is_fatal(&self) -> bool {
        matches!(self, BatchError::Shape { .. } | BatchError::MissingHelper(_))
    }
}

// Socket-class failures shrink harder and get a cooldown
pub fn is_socket_error(error: &BatchError) -> bool {
    match error {
        BatchError::Rpc(RpcError::Timeout) => true,
        BatchError::Rpc(RpcError::Transient(message)) => {
            message.contains("socket hang up")
                || message.contains("ECONNRESET")
                || message.contains("timeout")
        }
        _ => false,
    }
}

// consecutive failures on one chunk before degrading to singles
const SINGLES_AFTER_FAILURES: u32 = 3;

// The optimizer-governed batching loop
// Invariant: the output has exactly items.len() * per_item entries, in
// input order; failed singles contribute sentinel values instead of
// aborting the batch
pub async fn chunk_operation<T, R, F, Fut>(
    optimizer: &ChunkOptimizer,
    items: &[T],
    per_item: usize,
    sentinel: R,
    op: F,
) -> Result<Vec<R>, BatchError>
where
    T: Clone,
    R: Clone,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<Vec<R>, BatchError>>,
{
    let bounds = optimizer.bounds();
    let mut size = optimizer.start_params().initial.max(bounds.min);
    let mut results = Vec::with_capacity(items.len() * per_item);
    let mut index = 0usize;
    let mut consecutive_failures = 0u32;
    let mut sentinel_count = 0usize;

    while index < items.len() {
        let used = size.min(items.len() - index);

        if consecutive_failures >= SINGLES_AFTER_FAILURES {
            // the chunk keeps failing even after shrinking: degrade to
            // single calls so one poisoned entry cannot stall the rest
            for item in &items[index..index + used] {
                match op(vec![item.clone()]).await {
                    Ok(mut single) if single.len() == per_item => results.append(&mut single),
                    Ok(single) => {
                        return Err(BatchError::Shape { expected: per_item, actual: single.len() });
                    }
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(error) => {
                        debug!("single-item call failed, recording sentinel: {}", error);
                        sentinel_count += 1;
                        results.extend(std::iter::repeat(sentinel.clone()).take(per_item));
                    }
                }
            }
            index += used;
            consecutive_failures = 0;
            continue;
        }

        let chunk = items[index..index + used].to_vec();
        let started = Instant::now();
        match op(chunk).await {
            Ok(mut chunk_results) => {
                let expected = used * per_item;
                if chunk_results.len() != expected {
                    return Err(BatchError::Shape { expected, actual: chunk_results.len() });
                }
                let duration_ms = started.elapsed().as_millis() as u64;
                optimizer.record(ChunkOutcome {
                    chunk_size: used,
                    duration_ms,
                    success: true,
                    is_socket_error: false,
                });
                results.append(&mut chunk_results);
                // advance by the chunk size actually used, never by the
                // freshly adjusted one
                index += used;
                consecutive_failures = 0;
                size = adjust_chunk_size(size, duration_ms, bounds);
            }
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                let socket = is_socket_error(&error);
                optimizer.record(ChunkOutcome {
                    chunk_size: used,
                    duration_ms: started.elapsed().as_millis() as u64,
                    success: false,
                    is_socket_error: socket,
                });
                consecutive_failures += 1;
                let reduced = reduced_chunk_size(size, socket, bounds);
                debug!(
                    "chunk of {} failed ({}), retrying at {}",
                    used, error, reduced
                );
                if socket {
                    let cooldown = rand::thread_rng().gen_range(1_000..=2_000);
                    sleep(Duration::from_millis(cooldown)).await;
                }
                size = reduced;
            }
        }
    }

    if sentinel_count > 0 {
        warn!("{} of {} entries resolved to sentinel values", sentinel_count, items.len());
    }
    Ok(results)
}

fn parse_addresses(addresses: &[String]) -> Result<Vec<Address>, BatchError> {
    addresses
        .iter()
        .map(|a| {
            a.parse::<Address>()
                .map_err(|_| BatchError::BadAddress(a.clone()))
        })
        .collect()
}

fn decode_hex_payload(data: &str) -> Result<Vec<u8>, BatchError> {
    hex::decode(data.trim_start_matches("0x")).map_err(|e| BatchError::Abi(e.to_string()))
}

// Aggregator-backed batched reads for one network
// Every chunked path goes through the provider-primary RPC backend so
// the learned chunk sizes describe a single provider
pub struct BatchReader {
    rpc: Arc<RpcClient>,
    balance_helper: Option<String>,
    contract_validator: Option<String>,
    contract_check: Arc<ChunkOptimizer>,
    codehash: Arc<ChunkOptimizer>,
    native_balance: Arc<ChunkOptimizer>,
    erc20: Arc<ChunkOptimizer>,
}

impl BatchReader {
    pub fn new(
        rpc: Arc<RpcClient>,
        balance_helper: Option<String>,
        contract_validator: Option<String>,
        optimizers: &OptimizerSet,
    ) -> Self {
        Self {
            rpc,
            balance_helper,
            contract_validator,
            contract_check: Arc::clone(&optimizers.contract_check),
            codehash: Arc::clone(&optimizers.codehash),
            native_balance: Arc::clone(&optimizers.native_balance),
            erc20: Arc::clone(&optimizers.erc20),
        }
    }

    // EOA/contract classification, order preserving
    pub async fn is_contract(&self, addresses: &[String]) -> Result<Vec<bool>, BatchError> {
        let Some(validator) = self.contract_validator.clone() else {
            return self.is_contract_fallback(addresses).await;
        };

        chunk_operation(&self.contract_check, addresses, 1, false, |chunk| {
            let validator = validator.clone();
            async move {
                let accounts = parse_addresses(&chunk)?;
                let call = isContractCall { accounts };
                let data = format!("0x{}", hex::encode(call.abi_encode()));
                let raw = self.rpc.eth_call_primary(&validator, &data).await?;
                let payload = decode_hex_payload(&raw)?;
                let decoded = isContractCall::abi_decode_returns(&payload)
                    .map_err(|e| BatchError::Abi(e.to_string()))?;
                Ok(decoded)
            }
        })
        .await
    }

    // eth_getCode per address when no validator helper is deployed
    async fn is_contract_fallback(&self, addresses: &[String]) -> Result<Vec<bool>, BatchError> {
        let mut flags = Vec::with_capacity(addresses.len());
        for address in addresses {
            match self.rpc.get_code(address).await {
                Ok(code) => flags.push(!is_empty_code(&code)),
                Err(error) => {
                    debug!("getCode failed for {}: {}", address, error);
                    flags.push(false);
                }
            }
        }
        Ok(flags)
    }

    // keccak256 of the runtime bytecode, zero hash for empty accounts
    pub async fn code_hashes(&self, addresses: &[String]) -> Result<Vec<String>, BatchError> {
        if let Some(validator) = self.contract_validator.clone() {
            return chunk_operation(
                &self.codehash,
                addresses,
                1,
                ZERO_CODE_HASH.to_string(),
                |chunk| {
                    let validator = validator.clone();
                    async move {
                        let accounts = parse_addresses(&chunk)?;
                        let call = getCodeHashesCall { accounts };
                        let data = format!("0x{}", hex::encode(call.abi_encode()));
                        let raw = self.rpc.eth_call_primary(&validator, &data).await?;
                        let payload = decode_hex_payload(&raw)?;
                        let decoded = getCodeHashesCall::abi_decode_returns(&payload)
                            .map_err(|e| BatchError::Abi(e.to_string()))?;
                        Ok(decoded.iter().map(|h: &B256| format!("{:#x}", h)).collect())
                    }
                },
            )
            .await;
        }

        let mut hashes = Vec::with_capacity(addresses.len());
        for address in addresses {
            match self.rpc.get_code(address).await {
                Ok(code) if is_empty_code(&code) => hashes.push(ZERO_CODE_HASH.to_string()),
                Ok(code) => {
                    let bytes = decode_hex_payload(&code)?;
                    hashes.push(format!("{:#x}", keccak256(bytes)));
                }
                Err(error) => {
                    debug!("getCode failed for {}: {}", address, error);
                    hashes.push(ZERO_CODE_HASH.to_string());
                }
            }
        }
        Ok(hashes)
    }

    // Native balances; the aggregator is expected here, the RPC
    // fallback exists but costs one call per address
    pub async fn native_balances(&self, addresses: &[String]) -> Result<Vec<U256>, BatchError> {
        let Some(helper) = self.balance_helper.clone() else {
            warn!(
                "{}: no balance helper configured, falling back to per-address eth_getBalance",
                self.rpc.network()
            );
            let mut balances = Vec::with_capacity(addresses.len());
            for address in addresses {
                match self.rpc.get_balance(address).await {
                    Ok(balance) => balances.push(balance),
                    Err(error) => {
                        debug!("getBalance failed for {}: {}", address, error);
                        balances.push(U256::ZERO);
                    }
                }
            }
            return Ok(balances);
        };

        chunk_operation(&self.native_balance, addresses, 1, U256::ZERO, |chunk| {
            let helper = helper.clone();
            async move {
                let accounts = parse_addresses(&chunk)?;
                let call = getNativeBalanceCall { accounts };
                let data = format!("0x{}", hex::encode(call.abi_encode()));
                let raw = self.rpc.eth_call_primary(&helper, &data).await?;
                let payload = decode_hex_payload(&raw)?;
                let decoded = getNativeBalanceCall::abi_decode_returns(&payload)
                    .map_err(|e| BatchError::Abi(e.to_string()))?;
                Ok(decoded)
            }
        })
        .await
    }

    // ERC-20 balances for every (holder, token) pair, flattened
    // holder-major; the aggregator is mandatory for this engine
    pub async fn token_balances(
        &self,
        holders: &[String],
        tokens: &[String],
    ) -> Result<Vec<U256>, BatchError> {
        let helper = self
            .balance_helper
            .clone()
            .ok_or(BatchError::MissingHelper("BalanceHelper"))?;
        let token_addresses = parse_addresses(tokens)?;

        chunk_operation(&self.erc20, holders, tokens.len(), U256::ZERO, |chunk| {
            let helper = helper.clone();
            let tokens = token_addresses.clone();
            async move {
                let holders = parse_addresses(&chunk)?;
                let expected = holders.len() * tokens.len();
                let call = getTokenBalanceCall { holders, tokens };
                let data = format!("0x{}", hex::encode(call.abi_encode()));

                // parallel-array responses are validated and re-fetched
                // before anything reaches the caller
                let mut attempt = 0u32;
                loop {
                    let raw = self.rpc.eth_call_primary(&helper, &data).await?;
                    let payload = decode_hex_payload(&raw)?;
                    let decoded = getTokenBalanceCall::abi_decode_returns(&payload)
                        .map_err(|e| BatchError::Abi(e.to_string()))?;
                    if decoded.len() == expected {
                        return Ok(decoded);
                    }
                    attempt += 1;
                    warn!(
                        "token balance shape mismatch: got {}, expected {} (attempt {})",
                        decoded.len(),
                        expected,
                        attempt
                    );
                    if attempt > SHAPE_MISMATCH_RETRIES {
                        return Err(BatchError::Shape { expected, actual: decoded.len() });
                    }
                    sleep(Duration::from_millis(SHAPE_MISMATCH_BACKOFF_MS * attempt as u64)).await;
                }
            }
        })
        .await
    }
}

// The four learners of one network, shared between the scanner and
// the fund updater
pub struct OptimizerSet {
    pub contract_check: Arc<ChunkOptimizer>,
    pub codehash: Arc<ChunkOptimizer>,
    pub native_balance: Arc<ChunkOptimizer>,
    pub erc20: Arc<ChunkOptimizer>,
}

impl OptimizerSet {
    pub fn new(network: Network, mut stored: impl FnMut(Operation) -> Option<crate::optimizer::OptimizerState>) -> Self {
        Self {
            contract_check: Arc::new(ChunkOptimizer::new(
                network,
                Operation::ContractCheck,
                stored(Operation::ContractCheck),
            )),
            codehash: Arc::new(ChunkOptimizer::new(
                network,
                Operation::Codehash,
                stored(Operation::Codehash),
            )),
            native_balance: Arc::new(ChunkOptimizer::new(
                network,
                Operation::NativeBalance,
                stored(Operation::NativeBalance),
            )),
            erc20: Arc::new(ChunkOptimizer::new(
                network,
                Operation::Erc20,
                stored(Operation::Erc20),
            )),
        }
    }

    pub fn all(&self) -> [&Arc<ChunkOptimizer>; 4] {
        [
            &self.contract_check,
            &self.codehash,
            &self.native_balance,
            &self.erc20,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn optimizer(op: Operation) -> ChunkOptimizer {
        ChunkOptimizer::new(Network::Ethereum, op, None)
    }

    #[tokio::test]
    async fn test_chunk_operation_preserves_order_and_length() {
        let optimizer = optimizer(Operation::ContractCheck);
        let items: Vec<u32> = (0..1_000).collect();
        let result = chunk_operation(&optimizer, &items, 1, 0u32, |chunk| async move {
            Ok(chunk.into_iter().map(|v| v * 2).collect())
        })
        .await
        .unwrap();

        assert_eq!(result.len(), items.len());
        for (i, value) in result.iter().enumerate() {
            assert_eq!(*value, (i as u32) * 2);
        }
    }

    #[tokio::test]
    async fn test_chunk_operation_degrades_to_singles_with_sentinels() {
        let optimizer = optimizer(Operation::ContractCheck);
        let items: Vec<u32> = (0..40).collect();
        let result = chunk_operation(&optimizer, &items, 1, u32::MAX, |chunk| async move {
            // multi-item chunks always fail; the poisoned item 7 fails
            // even alone
            if chunk.len() > 1 || chunk[0] == 7 {
                Err(BatchError::Rpc(RpcError::Transient("boom".to_string())))
            } else {
                Ok(chunk)
            }
        })
        .await
        .unwrap();

        assert_eq!(result.len(), items.len());
        assert_eq!(result[7], u32::MAX);
        assert_eq!(result[6], 6);
        assert_eq!(result[8], 8);
    }

    #[tokio::test]
    async fn test_chunk_operation_advances_by_used_size() {
        let optimizer = optimizer(Operation::NativeBalance);
        let items: Vec<u32> = (0..500).collect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let result = chunk_operation(&optimizer, &items, 1, 0u32, move |chunk| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.lock().unwrap().extend(chunk.iter().copied());
                Ok(chunk)
            }
        })
        .await
        .unwrap();

        // every input visited exactly once despite growth between chunks
        assert_eq!(result, items);
        assert_eq!(*seen.lock().unwrap(), items);
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_fatal() {
        let optimizer = optimizer(Operation::Erc20);
        let items: Vec<u32> = (0..10).collect();
        let result = chunk_operation(&optimizer, &items, 3, 0u32, |chunk| async move {
            // one value short of chunk.len() * 3
            Ok(vec![0u32; chunk.len() * 3 - 1])
        })
        .await;

        assert!(matches!(result, Err(BatchError::Shape { .. })));
    }

    #[tokio::test]
    async fn test_chunk_shrinks_after_failure() {
        let optimizer = optimizer(Operation::ContractCheck);
        let initial = optimizer.start_params().initial;
        let items: Vec<u32> = (0..initial as u32 * 2).collect();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes_clone = Arc::clone(&sizes);
        let calls_clone = Arc::clone(&calls);

        chunk_operation(&optimizer, &items, 1, 0u32, move |chunk| {
            let sizes = Arc::clone(&sizes_clone);
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(BatchError::Rpc(RpcError::Transient("flaky".to_string())));
                }
                sizes.lock().unwrap().push(chunk.len());
                Ok(chunk)
            }
        })
        .await
        .unwrap();

        // the failed chunk is retried at half its size
        assert_eq!(sizes.lock().unwrap()[0], initial / 2);
    }

    #[test]
    fn test_socket_error_detection() {
        assert!(is_socket_error(&BatchError::Rpc(RpcError::Timeout)));
        assert!(is_socket_error(&BatchError::Rpc(RpcError::Transient(
            "socket hang up".to_string()
        ))));
        assert!(!is_socket_error(&BatchError::Rpc(RpcError::Transient(
            "http status 500".to_string()
        ))));
        assert!(!is_socket_error(&BatchError::Abi("bad".to_string())));
    }

    #[test]
    fn test_helper_call_encoding_roundtrip() {
        let accounts = vec![Address::ZERO, Address::repeat_byte(0x11)];
        let call = isContractCall { accounts: accounts.clone() };
        let encoded = call.abi_encode();
        let decoded = isContractCall::abi_decode(&encoded).unwrap();
        assert_eq!(decoded.accounts, accounts);
    }
}
