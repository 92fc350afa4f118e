use std::sync::Arc;

use alloy_primitives::U256;
use metrics::counter;

use hydrascan_common::{
    config::{FUND_SCALE, PER_TOKEN_USD_CAP},
    network::Network,
    time::get_current_time_in_seconds,
    token::TokenMetadata,
};

use crate::batch::{BatchError, BatchReader};
use crate::prices::PriceCache;
use crate::storage::{AddressUpsert, Store};

// Native currencies are uniformly 18 decimals on the tracked chains
const NATIVE_DECIMALS: u8 = 18;

// Lossy but monotonic conversion; balances far exceed u64 so the
// limbs are folded in explicitly
pub fn u256_to_f64(value: U256) -> f64 {
    value
        .into_limbs()
        .iter()
        .enumerate()
        .map(|(i, limb)| *limb as f64 * 2f64.powi(64 * i as i32))
        .sum()
}

fn units(balance: U256, decimals: u8) -> f64 {
    u256_to_f64(balance) / 10f64.powi(decimals as i32)
}

// Aggregate USD value of one holder: native balance plus the curated
// token set, each priced by symbol
// Per-token values above the cap are dropped: they indicate the token
// contract itself (or a mispriced symbol), not a user balance
pub fn compute_fund_usd(
    native_balance: U256,
    native_symbol: &str,
    tokens: &[TokenMetadata],
    token_balances: &[U256],
    prices: &PriceCache,
) -> f64 {
    debug_assert_eq!(tokens.len(), token_balances.len());

    let mut total = 0.0;
    if let Some(price) = prices.price(native_symbol) {
        total += units(native_balance, NATIVE_DECIMALS) * price;
    }

    for (token, balance) in tokens.iter().zip(token_balances) {
        if balance.is_zero() {
            continue;
        }
        let Some(price) = prices.price(&token.symbol) else {
            continue;
        };
        let value = units(*balance, token.decimals) * price;
        if value > PER_TOKEN_USD_CAP {
            warn!(
                "dropping {} position worth ${:.0}: likely the token contract or a bad price",
                token.symbol, value
            );
            continue;
        }
        total += value;
    }
    total
}

pub fn usd_to_cents(usd: f64) -> i64 {
    (usd * FUND_SCALE).round().max(0.0) as i64
}

// Periodic holdings refresh for stale holders of one network
pub struct FundUpdater {
    network: Network,
    reader: Arc<BatchReader>,
    store: Arc<Store>,
    tokens: Vec<TokenMetadata>,
    update_delay_secs: u64,
    batch_size: i64,
}

impl FundUpdater {
    pub fn new(
        network: Network,
        reader: Arc<BatchReader>,
        store: Arc<Store>,
        tokens: Vec<TokenMetadata>,
        update_delay_secs: u64,
        batch_size: i64,
    ) -> Self {
        Self {
            network,
            reader,
            store,
            tokens,
            update_delay_secs,
            batch_size,
        }
    }

    // One pass over the stale holders; returns how many records were
    // refreshed so callers can loop until the backlog drains
    pub async fn run_once(&self, prices: &PriceCache) -> anyhow::Result<usize> {
        let now = get_current_time_in_seconds();
        let cutoff = now.saturating_sub(self.update_delay_secs) as i64;
        let holders = self
            .store
            .stale_fund_holders(self.network, cutoff, self.batch_size)
            .await?;
        if holders.is_empty() {
            return Ok(0);
        }

        let addresses: Vec<String> = holders.iter().map(|h| h.address.clone()).collect();
        let native_balances = self.reader.native_balances(&addresses).await?;

        let token_addresses: Vec<String> =
            self.tokens.iter().map(|t| t.address.clone()).collect();
        let token_balances = if token_addresses.is_empty() {
            Vec::new()
        } else {
            match self.reader.token_balances(&addresses, &token_addresses).await {
                Ok(balances) => balances,
                Err(error @ BatchError::Shape { .. }) => {
                    // never persist funds computed from mismatched data
                    return Err(error.into());
                }
                Err(error) => return Err(error.into()),
            }
        };

        let native_symbol = self.network.native_symbol();
        let mut upserts = Vec::with_capacity(holders.len());
        for (index, holder) in holders.iter().enumerate() {
            let slice: &[U256] = if self.tokens.is_empty() {
                &[]
            } else {
                let start = index * self.tokens.len();
                &token_balances[start..start + self.tokens.len()]
            };
            let usd = compute_fund_usd(
                native_balances[index],
                native_symbol,
                &self.tokens,
                slice,
                prices,
            );

            upserts.push(AddressUpsert {
                address: holder.address.clone(),
                network: holder.network.clone(),
                first_seen: holder.first_seen,
                last_updated: now as i64,
                fund: Some(usd_to_cents(usd)),
                last_fund_updated: Some(now as i64),
                ..Default::default()
            });
        }

        let updated = self.store.upsert_addresses(upserts).await?;
        counter!("fund_updates_total", "network" => self.network.to_string())
            .increment(updated as u64);
        info!("{}: refreshed funds for {} holders", self.network, updated);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cache(entries: &[(&str, f64)]) -> PriceCache {
        PriceCache::from_map(
            entries
                .iter()
                .map(|(s, p)| (s.to_string(), *p))
                .collect::<HashMap<_, _>>(),
        )
    }

    fn usdt() -> TokenMetadata {
        TokenMetadata {
            address: "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string(),
            symbol: "USDT".to_string(),
            decimals: 6,
        }
    }

    #[test]
    fn test_u256_to_f64() {
        assert_eq!(u256_to_f64(U256::ZERO), 0.0);
        assert_eq!(u256_to_f64(U256::from(1_000_000u64)), 1_000_000.0);
        let one_ether = U256::from(10u64).pow(U256::from(18));
        assert!((u256_to_f64(one_ether) - 1e18).abs() < 1e6);
    }

    #[test]
    fn test_compute_fund_combines_native_and_tokens() {
        let prices = cache(&[("ETH", 3_000.0), ("USDT", 1.0)]);
        // 2 ETH + 500 USDT
        let native = U256::from(2u64) * U256::from(10u64).pow(U256::from(18));
        let balances = vec![U256::from(500_000_000u64)];
        let usd = compute_fund_usd(native, "ETH", &[usdt()], &balances, &prices);
        assert!((usd - 6_500.0).abs() < 0.01);
        assert_eq!(usd_to_cents(usd), 650_000);
    }

    #[test]
    fn test_unpriced_symbols_contribute_nothing() {
        let prices = cache(&[]);
        let native = U256::from(10u64).pow(U256::from(18));
        let usd = compute_fund_usd(native, "ETH", &[], &[], &prices);
        assert_eq!(usd, 0.0);
    }

    #[test]
    fn test_billion_dollar_position_is_dropped() {
        let prices = cache(&[("USDT", 1.0)]);
        // 2e9 USDT: over the cap, clearly the token contract itself
        let balances = vec![U256::from(2_000_000_000_000_000u64)];
        let usd = compute_fund_usd(U256::ZERO, "ETH", &[usdt()], &balances, &prices);
        assert_eq!(usd, 0.0);
    }

    #[test]
    fn test_fund_is_never_negative() {
        assert_eq!(usd_to_cents(-0.4), 0);
        assert_eq!(usd_to_cents(0.004), 0);
        assert_eq!(usd_to_cents(0.006), 1);
    }
}
