use std::collections::HashMap;
use std::sync::Arc;

use hydrascan_common::{
    api::explorer::ContractCreationEntry,
    config::{CREATION_LOOKUP_BATCH, GENESIS_TX_PREFIX},
    network::{genesis_timestamp, Network},
    time::TimestampSeconds,
    utils::{is_empty_code, normalize_address},
};

use crate::blocktime::BlockTimestamps;
use crate::explorer::{ExplorerClient, ExplorerError};
use crate::rpc::RpcClient;

// Resolution result for one contract address
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCreation {
    pub address: String,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub deployment_timestamp: Option<TimestampSeconds>,
    pub is_genesis: bool,
    // the explorer had no record and the chain shows no code either
    pub is_eoa: bool,
}

impl ContractCreation {
    fn pending(address: String, tx_hash: String) -> Self {
        Self {
            address,
            tx_hash: Some(tx_hash),
            block_number: None,
            deployment_timestamp: None,
            is_genesis: false,
            is_eoa: false,
        }
    }

    fn genesis(address: String, tx_hash: String, chain_id: u64) -> Self {
        Self {
            address,
            tx_hash: Some(tx_hash),
            block_number: None,
            // chains without a configured genesis leave this unset
            deployment_timestamp: genesis_timestamp(chain_id),
            is_genesis: true,
            is_eoa: false,
        }
    }
}

// Split explorer rows into genesis allocations (no transaction to
// resolve) and regular creations still needing a block lookup
pub fn partition_entries(
    entries: Vec<ContractCreationEntry>,
    chain_id: u64,
) -> (Vec<ContractCreation>, Vec<ContractCreation>) {
    let mut resolved = Vec::new();
    let mut pending = Vec::new();
    for entry in entries {
        let Some(address) = normalize_address(&entry.contract_address) else {
            warn!("explorer returned invalid contract address '{}'", entry.contract_address);
            continue;
        };
        if entry.tx_hash.starts_with(GENESIS_TX_PREFIX) {
            resolved.push(ContractCreation::genesis(address, entry.tx_hash, chain_id));
        } else {
            pending.push(ContractCreation::pending(address, entry.tx_hash));
        }
    }
    (resolved, pending)
}

// Batched explorer lookup of creation metadata, then transaction and
// block-timestamp resolution over RPC
pub struct DeploymentResolver {
    network: Network,
    rpc: Arc<RpcClient>,
    explorer: Arc<ExplorerClient>,
    block_timestamps: Arc<BlockTimestamps>,
}

impl DeploymentResolver {
    pub fn new(
        network: Network,
        rpc: Arc<RpcClient>,
        explorer: Arc<ExplorerClient>,
        block_timestamps: Arc<BlockTimestamps>,
    ) -> Self {
        Self {
            network,
            rpc,
            explorer,
            block_timestamps,
        }
    }

    // Resolve creation data for contracts; `targets` carries each
    // address with its first-seen fallback timestamp
    pub async fn resolve(
        &self,
        targets: &[(String, TimestampSeconds)],
    ) -> Result<Vec<ContractCreation>, ExplorerError> {
        let mut results = Vec::with_capacity(targets.len());

        for chunk in targets.chunks(CREATION_LOOKUP_BATCH) {
            let addresses: Vec<String> = chunk.iter().map(|(a, _)| a.clone()).collect();
            let entries = self.explorer.contract_creation(&addresses).await?;
            let (mut resolved, pending) = partition_entries(entries, self.network.chain_id());
            let looked_up = self.resolve_pending(pending).await;
            resolved.extend(looked_up);

            // addresses the explorer does not know: EOA when there is
            // no code, first-seen fallback when there is
            let known: HashMap<&str, ()> =
                resolved.iter().map(|c| (c.address.as_str(), ())).collect();
            let mut fallbacks = Vec::new();
            for (address, first_seen) in chunk {
                if !known.contains_key(address.as_str()) {
                    fallbacks.push(self.classify_missing(address, *first_seen).await);
                }
            }
            resolved.extend(fallbacks);
            results.extend(resolved);
        }

        Ok(results)
    }

    // tx hash -> block number -> timestamp; transactions cannot be
    // batched over JSON-RPC so each unique hash costs one call
    async fn resolve_pending(&self, pending: Vec<ContractCreation>) -> Vec<ContractCreation> {
        let mut by_tx: HashMap<String, Vec<ContractCreation>> = HashMap::new();
        for creation in pending {
            let hash = creation.tx_hash.clone().unwrap_or_default();
            by_tx.entry(hash).or_default().push(creation);
        }

        let mut tx_blocks: HashMap<String, u64> = HashMap::new();
        for hash in by_tx.keys() {
            match self.rpc.get_transaction_by_hash(hash).await {
                Ok(Some(tx)) => {
                    if let Some(block) = tx.block_number() {
                        tx_blocks.insert(hash.clone(), block);
                    }
                }
                Ok(None) => debug!("{}: creation tx {} not found", self.network, hash),
                Err(error) => {
                    warn!("{}: cannot resolve creation tx {}: {}", self.network, hash, error)
                }
            }
        }

        let mut block_times: HashMap<u64, TimestampSeconds> = HashMap::new();
        for block in tx_blocks.values() {
            if block_times.contains_key(block) {
                continue;
            }
            if let Some(timestamp) = self.block_timestamps.get(*block).await {
                block_times.insert(*block, timestamp);
            }
        }

        let mut resolved = Vec::new();
        for (hash, creations) in by_tx {
            let block = tx_blocks.get(&hash).copied();
            let timestamp = block.and_then(|b| block_times.get(&b).copied());
            for mut creation in creations {
                creation.block_number = block;
                creation.deployment_timestamp = timestamp;
                resolved.push(creation);
            }
        }
        resolved
    }

    async fn classify_missing(
        &self,
        address: &str,
        first_seen: TimestampSeconds,
    ) -> ContractCreation {
        match self.rpc.get_code(address).await {
            Ok(code) if is_empty_code(&code) => ContractCreation {
                address: address.to_string(),
                tx_hash: None,
                block_number: None,
                deployment_timestamp: None,
                is_genesis: false,
                is_eoa: true,
            },
            Ok(_) => {
                // deployed but not indexed by the explorer: adopt the
                // first observation as the deployment time
                debug!(
                    "{}: {} not indexed by explorer, using first-seen fallback",
                    self.network, address
                );
                ContractCreation {
                    address: address.to_string(),
                    tx_hash: None,
                    block_number: None,
                    deployment_timestamp: Some(first_seen),
                    is_genesis: false,
                    is_eoa: false,
                }
            }
            Err(error) => {
                warn!("{}: getCode failed for {}: {}", self.network, address, error);
                ContractCreation {
                    address: address.to_string(),
                    tx_hash: None,
                    block_number: None,
                    deployment_timestamp: None,
                    is_genesis: false,
                    is_eoa: false,
                }
            }
        }
    }
}
