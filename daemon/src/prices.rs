use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use hydrascan_common::time::get_current_time_in_seconds;

use crate::storage::Store;

// One row of a price file fed to the refresh-prices entrypoint
#[derive(Debug, Clone, Deserialize)]
pub struct PriceEntry {
    pub symbol: String,
    pub price_usd: f64,
}

// Parse a price file, rejecting non-finite and negative quotes before
// anything reaches the database
pub fn read_price_file(path: &Path) -> anyhow::Result<Vec<(String, f64)>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read price file {}", path.display()))?;
    let entries: Vec<PriceEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid price file {}", path.display()))?;

    let mut prices = Vec::with_capacity(entries.len());
    for entry in entries {
        if !entry.price_usd.is_finite() || entry.price_usd < 0.0 {
            anyhow::bail!("rejected price {} for {}", entry.price_usd, entry.symbol);
        }
        prices.push((entry.symbol, entry.price_usd));
    }
    Ok(prices)
}

// In-memory view of symbol_prices, loaded once per update cycle
// Lookups are case-insensitive on the symbol
#[derive(Debug, Clone, Default)]
pub struct PriceCache {
    prices: HashMap<String, f64>,
}

impl PriceCache {
    pub fn from_map(prices: HashMap<String, f64>) -> Self {
        let prices = prices
            .into_iter()
            .map(|(symbol, price)| (symbol.to_uppercase(), price))
            .collect();
        Self { prices }
    }

    pub async fn load(store: &Store) -> sqlx::Result<Self> {
        let prices = store.load_price_map().await?;
        info!("loaded {} symbol prices", prices.len());
        Ok(Self { prices })
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.prices.get(&symbol.to_uppercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

// Replace the whole price set in one transaction
pub async fn refresh_prices(store: &Store, prices: Vec<(String, f64)>) -> sqlx::Result<()> {
    let now = get_current_time_in_seconds() as i64;
    let normalized: Vec<(String, f64)> = prices
        .into_iter()
        .map(|(symbol, price)| (symbol.to_uppercase(), price))
        .collect();
    store.upsert_prices(&normalized, now).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_price_file() {
        let dir = std::env::temp_dir().join("hydrascan-prices");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("prices.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"[{"symbol": "eth", "price_usd": 3200.5}, {"symbol": "USDT", "price_usd": 1.0}]"#)
            .unwrap();

        let prices = read_price_file(&path).unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0], ("eth".to_string(), 3200.5));
    }

    #[test]
    fn test_read_price_file_rejects_negative() {
        let dir = std::env::temp_dir().join("hydrascan-prices-bad");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("prices.json");
        std::fs::write(&path, r#"[{"symbol": "ETH", "price_usd": -1.0}]"#).unwrap();
        assert!(read_price_file(&path).is_err());
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let mut map = HashMap::new();
        map.insert("usdt".to_string(), 1.0);
        map.insert("WETH".to_string(), 3_200.0);
        let cache = PriceCache::from_map(map);

        assert_eq!(cache.price("USDT"), Some(1.0));
        assert_eq!(cache.price("usdt"), Some(1.0));
        assert_eq!(cache.price("weth"), Some(3_200.0));
        assert_eq!(cache.price("UNKNOWN"), None);
    }
}
