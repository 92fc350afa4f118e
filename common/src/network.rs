use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::time::TimestampSeconds;

// Every chain tracked by the indexer
// The string form is the canonical network name used as DB key,
// in log lines and in environment variable prefixes
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Ethereum,
    Binance,
    Polygon,
    Arbitrum,
    Optimism,
    Base,
    Avalanche,
    Gnosis,
    Fantom,
    Celo,
    Moonbeam,
    Linea,
    Scroll,
    Mantle,
}

// Rough Transfer-log density class of a chain, used to select the
// initial logs optimization profile before any learned stats exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ActivityLevel {
    UltraHigh,
    High,
    Medium,
    Low,
    Legacy,
}

// Billing tier of the RPC provider behind the primary endpoint
// Free tiers enforce hard getLogs block-range caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderTier {
    Free,
    Payg,
    Growth,
}

impl Network {
    pub const ALL: [Network; 14] = [
        Network::Ethereum,
        Network::Binance,
        Network::Polygon,
        Network::Arbitrum,
        Network::Optimism,
        Network::Base,
        Network::Avalanche,
        Network::Gnosis,
        Network::Fantom,
        Network::Celo,
        Network::Moonbeam,
        Network::Linea,
        Network::Scroll,
        Network::Mantle,
    ];

    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Ethereum => 1,
            Network::Binance => 56,
            Network::Polygon => 137,
            Network::Arbitrum => 42161,
            Network::Optimism => 10,
            Network::Base => 8453,
            Network::Avalanche => 43114,
            Network::Gnosis => 100,
            Network::Fantom => 250,
            Network::Celo => 42220,
            Network::Moonbeam => 1284,
            Network::Linea => 59144,
            Network::Scroll => 534352,
            Network::Mantle => 5000,
        }
    }

    pub fn from_chain_id(chain_id: u64) -> Option<Network> {
        Network::ALL.iter().copied().find(|n| n.chain_id() == chain_id)
    }

    // Symbol of the native currency, used to price native balances
    pub fn native_symbol(&self) -> &'static str {
        match self {
            Network::Ethereum
            | Network::Arbitrum
            | Network::Optimism
            | Network::Base
            | Network::Linea
            | Network::Scroll => "ETH",
            Network::Binance => "BNB",
            Network::Polygon => "POL",
            Network::Avalanche => "AVAX",
            Network::Gnosis => "XDAI",
            Network::Fantom => "FTM",
            Network::Celo => "CELO",
            Network::Moonbeam => "GLMR",
            Network::Mantle => "MNT",
        }
    }

    pub fn activity(&self) -> ActivityLevel {
        match self {
            Network::Ethereum | Network::Binance | Network::Polygon | Network::Base => {
                ActivityLevel::UltraHigh
            }
            Network::Arbitrum | Network::Optimism | Network::Avalanche => ActivityLevel::High,
            Network::Gnosis | Network::Linea | Network::Scroll => ActivityLevel::Medium,
            Network::Mantle | Network::Celo | Network::Moonbeam => ActivityLevel::Low,
            Network::Fantom => ActivityLevel::Legacy,
        }
    }

    // Environment variable consulted for RPC endpoint overrides,
    // e.g. ETHEREUM_RPC_URL
    pub fn rpc_env_var(&self) -> String {
        format!("{}_RPC_URL", self.to_string().to_uppercase())
    }
}

// Block-zero timestamps, keyed by chain id
// Genesis allocations have no creation transaction; the explorer marks
// them with a GENESIS tx-hash prefix and we fall back to this table.
// Chains without an entry leave the deployment timestamp unset.
pub fn genesis_timestamp(chain_id: u64) -> Option<TimestampSeconds> {
    let ts = match chain_id {
        1 => 1438269973,
        56 => 1598671449,
        137 => 1590824836,
        42161 => 1622243344,
        10 => 1636665385,
        8453 => 1686789347,
        43114 => 1600858926,
        100 => 1539024180,
        250 => 1577836800,
        42220 => 1587571205,
        1284 => 1639785600,
        59144 => 1689593920,
        534352 => 1696917600,
        5000 => 1688314800,
        _ => return None,
    };
    Some(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_string_roundtrip() {
        for network in Network::ALL {
            let s = network.to_string();
            assert_eq!(s, s.to_lowercase());
            assert_eq!(s.parse::<Network>().unwrap(), network);
        }
    }

    #[test]
    fn test_chain_id_lookup() {
        assert_eq!(Network::from_chain_id(10), Some(Network::Optimism));
        assert_eq!(Network::from_chain_id(8453), Some(Network::Base));
        assert_eq!(Network::from_chain_id(31337), None);
    }

    #[test]
    fn test_optimism_genesis_timestamp() {
        assert_eq!(genesis_timestamp(10), Some(1636665385));
        assert_eq!(genesis_timestamp(999_999), None);
    }

    #[test]
    fn test_rpc_env_var() {
        assert_eq!(Network::Ethereum.rpc_env_var(), "ETHEREUM_RPC_URL");
        assert_eq!(Network::Binance.rpc_env_var(), "BINANCE_RPC_URL");
    }
}
