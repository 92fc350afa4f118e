use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;

use hydrascan_common::{
    api::rpc::RpcLog,
    config::ZERO_CODE_HASH,
    network::Network,
    tags::{reclassify, AddressTag},
    time::get_current_time_in_seconds,
    utils::topic_to_address,
};

use crate::batch::{BatchReader, OptimizerSet};
use crate::blocktime::BlockTimestamps;
use crate::config::{Config, CLASSIFY_BATCH_SIZE};
use crate::deployment::DeploymentResolver;
use crate::explorer::ExplorerClient;
use crate::logs::AdaptiveLogFetcher;
use crate::names::NameResolver;
use crate::registry::NetworkConfig;
use crate::rpc::{EndpointRegistry, RpcClient};
use crate::scheduler::RateLimiter;
use crate::storage::{AddressUpsert, Store};

// Upper bound on classification rounds per cycle so one network
// cannot monopolize a run on a huge backlog
const MAX_CLASSIFY_ROUNDS: usize = 20;

// Verified-name lookups are explorer-expensive; budget per cycle
const NAME_LOOKUP_BUDGET: usize = 50;

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    pub logs: usize,
    pub discovered: usize,
    pub classified: usize,
}

// Transfer participants of one log batch: the from/to topics, not the
// emitting token contract
// Returns each address once with the block it was first seen in
pub fn extract_participants(logs: &[RpcLog]) -> Vec<(String, u64)> {
    let mut seen: HashMap<String, u64> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for log in logs {
        if log.removed || log.topics.len() < 3 {
            continue;
        }
        let block = log.block_number().unwrap_or_default();
        for topic in &log.topics[1..3] {
            let Some(address) = topic_to_address(topic) else {
                continue;
            };
            // the zero address marks mints and burns, not an account
            if address == "0x0000000000000000000000000000000000000000" {
                continue;
            }
            if !seen.contains_key(&address) {
                order.push(address.clone());
                seen.insert(address, block);
            }
        }
    }

    order
        .into_iter()
        .map(|address| {
            let block = seen[&address];
            (address, block)
        })
        .collect()
}

// One network's ingestion pipeline: adaptive log fetch, discovery
// upserts, classification, deployment enrichment, name lookups
pub struct Scanner {
    network: Network,
    rpc: Arc<RpcClient>,
    reader: Arc<BatchReader>,
    fetcher: AdaptiveLogFetcher,
    resolver: Arc<DeploymentResolver>,
    names: Arc<NameResolver>,
    block_times: Arc<BlockTimestamps>,
    store: Arc<Store>,
    optimizers: OptimizerSet,
    window_blocks: u64,
}

impl Scanner {
    pub async fn bootstrap(
        network: Network,
        store: Arc<Store>,
        endpoints: Arc<EndpointRegistry>,
        limiter: Arc<RateLimiter>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let mut net_config = NetworkConfig::resolve(network);
        // helper deployments recorded in the database win over the
        // static tables
        let overrides = store.helper_overrides(network).await?;
        net_config.apply_helper_overrides(&overrides);

        let rpc = Arc::new(RpcClient::new(&net_config, endpoints, Arc::clone(&limiter))?);
        let explorer = Arc::new(ExplorerClient::new(
            network,
            net_config.explorer.clone(),
            Arc::clone(&limiter),
        )?);

        let mut sessions = HashMap::new();
        for operation in [
            crate::optimizer::Operation::ContractCheck,
            crate::optimizer::Operation::Codehash,
            crate::optimizer::Operation::NativeBalance,
            crate::optimizer::Operation::Erc20,
        ] {
            if let Some(state) = store.load_optimizer_session(network, operation).await? {
                sessions.insert(operation, state);
            }
        }
        let optimizers = OptimizerSet::new(network, |op| sessions.remove(&op));

        let reader = Arc::new(BatchReader::new(
            Arc::clone(&rpc),
            net_config.balance_helper.clone(),
            net_config.contract_validator.clone(),
            &optimizers,
        ));

        let density = store.load_density_stats(network).await?;
        let fetcher = AdaptiveLogFetcher::start(Arc::clone(&rpc), &net_config, density).await?;

        let block_times = Arc::new(BlockTimestamps::new(network, Arc::clone(&rpc)));
        let resolver = Arc::new(DeploymentResolver::new(
            network,
            Arc::clone(&rpc),
            Arc::clone(&explorer),
            Arc::clone(&block_times),
        ));
        let names = Arc::new(NameResolver::new(network, explorer));

        let window_secs = config.timedelay_hours() * 3_600;
        let window_blocks = (window_secs / net_config.approx_block_secs.max(1)).max(1);

        Ok(Self {
            network,
            rpc,
            reader,
            fetcher,
            resolver,
            names,
            block_times,
            store,
            optimizers,
            window_blocks,
        })
    }

    pub fn reader(&self) -> Arc<BatchReader> {
        Arc::clone(&self.reader)
    }

    pub fn deployment_resolver(&self) -> Arc<DeploymentResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn name_resolver(&self) -> Arc<NameResolver> {
        Arc::clone(&self.names)
    }

    // Full cycle: catch the log window up to head, then classify and
    // enrich everything the window surfaced
    pub async fn run_once(&self) -> anyhow::Result<ScanStats> {
        let mut stats = ScanStats::default();
        self.run_discovery(&mut stats).await?;
        let leftover_budget = self.run_classification(&mut stats).await?;
        self.run_name_backlog(leftover_budget).await?;
        self.persist_learned_state().await;
        info!(
            "{}: cycle done, {} logs, {} discovered, {} classified",
            self.network, stats.logs, stats.discovered, stats.classified
        );
        Ok(stats)
    }

    async fn run_discovery(&self, stats: &mut ScanStats) -> anyhow::Result<()> {
        let head = self.rpc.get_block_number().await?;
        let start = match self.store.load_cursor(self.network).await? {
            Some(cursor) => cursor.min(head),
            // fresh network: begin a head-relative window back
            None => head.saturating_sub(self.window_blocks),
        };
        if start >= head {
            debug!("{}: already at head {}", self.network, head);
            return Ok(());
        }

        info!(
            "{}: scanning blocks {}..={} (batch {})",
            self.network,
            start + 1,
            head,
            self.fetcher.current_batch_size()
        );

        let mut from = start + 1;
        while from <= head {
            let (logs, covered) = self.fetcher.fetch_batch(from, head).await?;
            stats.logs += logs.len();

            let participants = extract_participants(&logs);
            if !participants.is_empty() {
                let now = get_current_time_in_seconds();
                let mut batch_times: HashMap<u64, u64> = HashMap::new();
                let mut upserts = Vec::with_capacity(participants.len());
                for (address, block) in participants {
                    let seen_at = match batch_times.get(&block) {
                        Some(ts) => *ts,
                        None => {
                            let ts = self.block_times.get(block).await.unwrap_or(now);
                            batch_times.insert(block, ts);
                            ts
                        }
                    };
                    if let Some(upsert) =
                        AddressUpsert::discovered(&address, &self.network.to_string(), seen_at)
                    {
                        upserts.push(upsert);
                    }
                }
                let written = self.store.upsert_addresses(upserts).await?;
                stats.discovered += written;
                counter!("addresses_discovered_total", "network" => self.network.to_string())
                    .increment(written as u64);
            }

            self.store
                .save_cursor(self.network, covered, get_current_time_in_seconds() as i64)
                .await?;
            if self.fetcher.should_persist() {
                let snapshot = self.fetcher.density_snapshot();
                if let Err(error) = self.store.save_density_stats(self.network, &snapshot).await {
                    warn!("{}: cannot persist density stats: {}", self.network, error);
                }
            }

            from = covered + 1;
        }
        Ok(())
    }

    async fn run_classification(&self, stats: &mut ScanStats) -> anyhow::Result<usize> {
        let mut name_budget = NAME_LOOKUP_BUDGET;

        for _ in 0..MAX_CLASSIFY_ROUNDS {
            let batch = self
                .store
                .unclassified_addresses(self.network, CLASSIFY_BATCH_SIZE as i64)
                .await?;
            if batch.is_empty() {
                break;
            }

            let addresses: Vec<String> = batch.iter().map(|r| r.address.clone()).collect();
            let flags = self.reader.is_contract(&addresses).await?;

            let contracts: Vec<(String, u64)> = batch
                .iter()
                .zip(&flags)
                .filter(|(_, flag)| **flag)
                .map(|(record, _)| (record.address.clone(), record.first_seen as u64))
                .collect();
            let contract_addresses: Vec<String> =
                contracts.iter().map(|(a, _)| a.clone()).collect();
            let code_hashes = if contract_addresses.is_empty() {
                Vec::new()
            } else {
                self.reader.code_hashes(&contract_addresses).await?
            };
            let hash_by_address: HashMap<&str, &str> = contract_addresses
                .iter()
                .map(String::as_str)
                .zip(code_hashes.iter().map(String::as_str))
                .collect();

            let creations = if contracts.is_empty() {
                Vec::new()
            } else {
                self.resolver.resolve(&contracts).await?
            };
            let creation_by_address: HashMap<&str, &crate::deployment::ContractCreation> =
                creations.iter().map(|c| (c.address.as_str(), c)).collect();

            let now = get_current_time_in_seconds() as i64;
            let mut upserts = Vec::with_capacity(batch.len());
            for (record, flag) in batch.iter().zip(&flags) {
                let mut upsert = AddressUpsert {
                    address: record.address.clone(),
                    network: record.network.clone(),
                    first_seen: record.first_seen,
                    last_updated: now,
                    ..Default::default()
                };
                // curated labels on the record survive classification
                let mut tags = record.tag_set();

                if *flag {
                    let code_hash = hash_by_address
                        .get(record.address.as_str())
                        .copied()
                        .unwrap_or(ZERO_CODE_HASH);
                    if code_hash == ZERO_CODE_HASH {
                        // sentinel from a degraded call; leave the
                        // record for the next round instead of tagging
                        // a contract without its code hash
                        continue;
                    }
                    reclassify(&mut tags, AddressTag::Contract);

                    if let Some(creation) = creation_by_address.get(record.address.as_str()) {
                        if creation.is_eoa {
                            // explorer and chain both disagree with the
                            // aggregator flag; trust the chain
                            reclassify(&mut tags, AddressTag::Eoa);
                            upserts.push(upsert.with_tags(tags));
                            continue;
                        }
                        upsert.deployed = creation.deployment_timestamp.map(|t| t as i64);
                    }
                    upsert.code_hash = Some(code_hash.to_string());

                    if name_budget > 0 {
                        name_budget -= 1;
                        if let Ok(resolved) = self.names.resolve(&record.address).await {
                            upsert.contract_name = resolved.contract_name;
                            tags.retain(|t| {
                                !matches!(t, AddressTag::Verified | AddressTag::Unverified)
                            });
                            tags.push(resolved.verification);
                            if resolved.is_proxy && !tags.contains(&AddressTag::Proxy) {
                                tags.push(AddressTag::Proxy);
                            }
                            upsert.name_checked = Some(true);
                            upsert.name_checked_at = Some(now);
                        }
                    }
                    upserts.push(upsert.with_tags(tags));
                } else {
                    reclassify(&mut tags, AddressTag::Eoa);
                    upserts.push(upsert.with_tags(tags));
                }
            }

            let written = self.store.upsert_addresses(upserts).await?;
            stats.classified += written;
            counter!("addresses_classified_total", "network" => self.network.to_string())
                .increment(written as u64);

            if batch.len() < CLASSIFY_BATCH_SIZE {
                break;
            }
        }
        Ok(name_budget)
    }

    // Spend any leftover name budget on older contracts whose verified
    // name was never checked
    async fn run_name_backlog(&self, budget: usize) -> anyhow::Result<()> {
        if budget == 0 {
            return Ok(());
        }
        let backlog = self
            .store
            .contracts_missing_name(self.network, budget as i64)
            .await?;
        if backlog.is_empty() {
            return Ok(());
        }

        let now = get_current_time_in_seconds() as i64;
        let mut upserts = Vec::with_capacity(backlog.len());
        for record in &backlog {
            let Ok(resolved) = self.names.resolve(&record.address).await else {
                continue;
            };
            let mut tags = record.tag_set();
            tags.retain(|t| !matches!(t, AddressTag::Verified | AddressTag::Unverified));
            tags.push(resolved.verification);
            if resolved.is_proxy && !tags.contains(&AddressTag::Proxy) {
                tags.push(AddressTag::Proxy);
            }
            upserts.push(
                AddressUpsert {
                    address: record.address.clone(),
                    network: record.network.clone(),
                    first_seen: record.first_seen,
                    last_updated: now,
                    contract_name: resolved.contract_name,
                    name_checked: Some(true),
                    name_checked_at: Some(now),
                    ..Default::default()
                }
                .with_tags(tags),
            );
        }
        if !upserts.is_empty() {
            let written = self.store.upsert_addresses(upserts).await?;
            debug!("{}: filled {} names from the backlog", self.network, written);
        }
        Ok(())
    }

    // Learned state is snapshotted at cycle end; failures only cost
    // the next cold start its head start
    async fn persist_learned_state(&self) {
        let now = get_current_time_in_seconds() as i64;
        let snapshot = self.fetcher.density_snapshot();
        if let Err(error) = self.store.save_density_stats(self.network, &snapshot).await {
            warn!("{}: cannot persist density stats: {}", self.network, error);
        }
        for optimizer in self.optimizers.all() {
            let state = optimizer.snapshot();
            if let Err(error) = self
                .store
                .save_optimizer_session(self.network, optimizer.operation(), &state, now)
                .await
            {
                warn!(
                    "{}/{}: cannot persist optimizer session: {}",
                    self.network,
                    optimizer.operation(),
                    error
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transfer_log(from: &str, to: &str, block: u64, removed: bool) -> RpcLog {
        serde_json::from_value(json!({
            "address": "0xdac17f958d2ee523a2206206994597c13d831ec7",
            "topics": [
                "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef",
                format!("0x000000000000000000000000{}", from),
                format!("0x000000000000000000000000{}", to),
            ],
            "data": "0x",
            "blockNumber": format!("{:#x}", block),
            "logIndex": "0x0",
            "removed": removed,
        }))
        .unwrap()
    }

    #[test]
    fn test_participants_are_from_and_to() {
        let logs = vec![transfer_log(
            "00000000000000000000000000000000000000a1",
            "00000000000000000000000000000000000000b2",
            1_000,
            false,
        )];
        let participants = extract_participants(&logs);
        assert_eq!(
            participants,
            vec![
                ("0x00000000000000000000000000000000000000a1".to_string(), 1_000),
                ("0x00000000000000000000000000000000000000b2".to_string(), 1_000),
            ]
        );
    }

    #[test]
    fn test_duplicates_keep_first_block() {
        let logs = vec![
            transfer_log(
                "00000000000000000000000000000000000000a1",
                "00000000000000000000000000000000000000b2",
                1_000,
                false,
            ),
            transfer_log(
                "00000000000000000000000000000000000000b2",
                "00000000000000000000000000000000000000c3",
                1_001,
                false,
            ),
        ];
        let participants = extract_participants(&logs);
        assert_eq!(participants.len(), 3);
        // b2 was first seen in block 1000, not 1001
        assert!(participants
            .contains(&("0x00000000000000000000000000000000000000b2".to_string(), 1_000)));
    }

    #[test]
    fn test_removed_and_short_logs_are_skipped() {
        let mut no_topics = transfer_log(
            "00000000000000000000000000000000000000a1",
            "00000000000000000000000000000000000000b2",
            1_000,
            false,
        );
        no_topics.topics.truncate(1);
        let removed = transfer_log(
            "00000000000000000000000000000000000000a1",
            "00000000000000000000000000000000000000b2",
            1_000,
            true,
        );
        assert!(extract_participants(&[no_topics, removed]).is_empty());
    }

    #[test]
    fn test_zero_address_is_ignored() {
        let logs = vec![transfer_log(
            "0000000000000000000000000000000000000000",
            "00000000000000000000000000000000000000b2",
            1_000,
            false,
        )];
        let participants = extract_participants(&logs);
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].0, "0x00000000000000000000000000000000000000b2");
    }
}
