use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;

use hydrascan_common::{
    config::{SECONDS_PER_DAY, ZERO_CODE_HASH},
    network::Network,
    tags::{reclassify, AddressTag},
    time::get_current_time_in_seconds,
};

use crate::batch::BatchReader;
use crate::deployment::DeploymentResolver;
use crate::names::NameResolver;
use crate::storage::{AddressRecord, AddressUpsert, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidateMode {
    // incomplete records only
    Standard,
    // everything discovered in the window, validated or not
    Recent { days: u64 },
}

// What a re-check decided for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    // classification agrees with the stored tags, nothing to change
    Keep,
    TagEoa,
    // needs_deployment is set when the record lacks a deployment time
    // or just flipped from EOA
    TagContract { needs_deployment: bool },
    // the chain disagrees with a stored Contract tag; contracts are
    // never silently reversed to EOA, only reported
    Conflict,
}

pub fn plan_repair(record: &AddressRecord, on_chain_contract: bool) -> Repair {
    let has_contract = record.has_tag(&AddressTag::Contract);
    let has_eoa = record.has_tag(&AddressTag::Eoa);

    match (has_contract, has_eoa, on_chain_contract) {
        (true, _, false) => Repair::Conflict,
        (true, _, true) => {
            if record.deployed.is_none() {
                Repair::TagContract { needs_deployment: true }
            } else {
                Repair::Keep
            }
        }
        // an EOA that now has code was re-deployed over; re-classify
        (false, true, true) => Repair::TagContract { needs_deployment: true },
        (false, true, false) => Repair::Keep,
        (false, false, true) => Repair::TagContract {
            needs_deployment: record.deployed.is_none(),
        },
        (false, false, false) => Repair::TagEoa,
    }
}

// Re-checks stored records and patches classification, deployment
// time and verified name gaps
pub struct Revalidator {
    network: Network,
    store: Arc<Store>,
    reader: Arc<BatchReader>,
    resolver: Arc<DeploymentResolver>,
    names: Arc<NameResolver>,
    batch_size: i64,
}

impl Revalidator {
    pub fn new(
        network: Network,
        store: Arc<Store>,
        reader: Arc<BatchReader>,
        resolver: Arc<DeploymentResolver>,
        names: Arc<NameResolver>,
        batch_size: i64,
    ) -> Self {
        Self {
            network,
            store,
            reader,
            resolver,
            names,
            batch_size,
        }
    }

    // Walk the selected set to completion; each mode bounds its own
    // iteration so unrepairable records cannot spin the pass forever
    pub async fn run(&self, mode: RevalidateMode) -> anyhow::Result<usize> {
        match mode {
            RevalidateMode::Standard => self.run_standard().await,
            RevalidateMode::Recent { days } => self.run_recent(days).await,
        }
    }

    async fn run_standard(&self) -> anyhow::Result<usize> {
        let mut total = 0usize;
        let mut previous: Option<Vec<String>> = None;
        loop {
            let records = self
                .store
                .revalidation_standard(self.network, self.batch_size)
                .await?;
            if records.is_empty() {
                break;
            }
            let addresses: Vec<String> = records.iter().map(|r| r.address.clone()).collect();
            // the same selection twice in a row means the leftovers
            // cannot be repaired right now
            if previous.as_ref() == Some(&addresses) {
                debug!(
                    "{}: {} records remain unrepairable this pass",
                    self.network,
                    addresses.len()
                );
                break;
            }
            total += self.process(records).await?;
            previous = Some(addresses);
        }
        Ok(total)
    }

    async fn run_recent(&self, days: u64) -> anyhow::Result<usize> {
        let since = get_current_time_in_seconds().saturating_sub(days * SECONDS_PER_DAY) as i64;
        let mut total = 0usize;
        let mut offset = 0i64;
        loop {
            let records = self
                .store
                .revalidation_recent(self.network, since, offset, self.batch_size)
                .await?;
            if records.is_empty() {
                break;
            }
            offset += records.len() as i64;
            total += self.process(records).await?;
        }
        Ok(total)
    }

    async fn process(&self, records: Vec<AddressRecord>) -> anyhow::Result<usize> {
        let addresses: Vec<String> = records.iter().map(|r| r.address.clone()).collect();
        let flags = self.reader.is_contract(&addresses).await?;

        let mut contracts: Vec<(String, u64)> = Vec::new();
        let mut repairs: HashMap<String, Repair> = HashMap::with_capacity(records.len());
        for (record, flag) in records.iter().zip(&flags) {
            let repair = plan_repair(record, *flag);
            if let Repair::Conflict = repair {
                warn!(
                    "{}: {} is tagged Contract but the chain shows no code, keeping the tag",
                    self.network, record.address
                );
            }
            if matches!(repair, Repair::TagContract { .. }) {
                contracts.push((record.address.clone(), record.first_seen as u64));
            }
            repairs.insert(record.address.clone(), repair);
        }

        // code hashes for everything that is (or became) a contract
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

        let needing_deployment: Vec<(String, u64)> = records
            .iter()
            .filter(|record| {
                matches!(
                    repairs.get(record.address.as_str()),
                    Some(Repair::TagContract { needs_deployment: true })
                )
            })
            .map(|record| (record.address.clone(), record.first_seen as u64))
            .collect();
        let creations = if needing_deployment.is_empty() {
            Vec::new()
        } else {
            self.resolver.resolve(&needing_deployment).await?
        };
        let deployed_by_address: HashMap<&str, Option<i64>> = creations
            .iter()
            .map(|c| (c.address.as_str(), c.deployment_timestamp.map(|t| t as i64)))
            .collect();

        let now = get_current_time_in_seconds() as i64;
        let mut upserts = Vec::new();
        let mut repaired = 0usize;

        for record in &records {
            let repair = repairs
                .get(record.address.as_str())
                .cloned()
                .unwrap_or(Repair::Keep);
            let mut tags = record.tag_set();
            let mut upsert = AddressUpsert {
                address: record.address.clone(),
                network: record.network.clone(),
                first_seen: record.first_seen,
                last_updated: now,
                ..Default::default()
            };

            match repair {
                Repair::Keep | Repair::Conflict => continue,
                Repair::TagEoa => {
                    reclassify(&mut tags, AddressTag::Eoa);
                }
                Repair::TagContract { .. } => {
                    reclassify(&mut tags, AddressTag::Contract);
                    if let Some(hash) = hash_by_address.get(record.address.as_str()) {
                        if *hash != ZERO_CODE_HASH {
                            upsert.code_hash = Some(hash.to_string());
                        }
                    }
                    if let Some(deployed) = deployed_by_address.get(record.address.as_str()) {
                        upsert.deployed = *deployed;
                    }
                    // blank names get one more explorer chance
                    if record.contract_name.is_none() {
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
                }
            }

            upsert = upsert.with_tags(tags);
            upserts.push(upsert);
            repaired += 1;
        }

        if !upserts.is_empty() {
            self.store.upsert_addresses(upserts).await?;
        }
        counter!("revalidated_total", "network" => self.network.to_string())
            .increment(repaired as u64);
        info!(
            "{}: revalidated {} of {} records",
            self.network,
            repaired,
            records.len()
        );
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tags: Option<Vec<&str>>, deployed: Option<i64>) -> AddressRecord {
        AddressRecord {
            address: "0x1111111111111111111111111111111111111111".to_string(),
            network: "ethereum".to_string(),
            first_seen: 1_700_000_000,
            last_updated: 1_700_000_000,
            code_hash: None,
            contract_name: None,
            deployed,
            tags: tags.map(|t| t.into_iter().map(str::to_string).collect()),
            fund: None,
            last_fund_updated: None,
            name_checked: None,
            name_checked_at: None,
        }
    }

    #[test]
    fn test_unclassified_gets_tagged() {
        assert_eq!(plan_repair(&record(None, None), false), Repair::TagEoa);
        assert_eq!(
            plan_repair(&record(None, None), true),
            Repair::TagContract { needs_deployment: true }
        );
    }

    #[test]
    fn test_eoa_with_code_is_reclassified() {
        assert_eq!(
            plan_repair(&record(Some(vec!["EOA"]), None), true),
            Repair::TagContract { needs_deployment: true }
        );
    }

    #[test]
    fn test_contract_is_never_silently_reversed() {
        assert_eq!(
            plan_repair(&record(Some(vec!["Contract"]), Some(1)), false),
            Repair::Conflict
        );
    }

    #[test]
    fn test_complete_records_are_kept() {
        assert_eq!(
            plan_repair(&record(Some(vec!["Contract"]), Some(1)), true),
            Repair::Keep
        );
        assert_eq!(plan_repair(&record(Some(vec!["EOA"]), None), false), Repair::Keep);
    }

    #[test]
    fn test_contract_missing_deployment_is_repaired() {
        assert_eq!(
            plan_repair(&record(Some(vec!["Contract"]), None), true),
            Repair::TagContract { needs_deployment: true }
        );
    }
}
