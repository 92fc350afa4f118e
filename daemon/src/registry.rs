use std::collections::HashMap;

use hydrascan_common::network::{Network, ProviderTier};

use crate::config::{env_list, env_string, use_etherscan_proxy, use_rpc_proxy};

// getLogs block-range caps imposed by the provider, keyed by tier
#[derive(Debug, Clone, Copy)]
pub struct TierCaps {
    pub free: u64,
    pub payg: u64,
    pub growth: u64,
}

impl TierCaps {
    pub fn cap_for(&self, tier: ProviderTier) -> u64 {
        match tier {
            ProviderTier::Free => self.free,
            ProviderTier::Payg => self.payg,
            ProviderTier::Growth => self.growth,
        }
    }
}

// Alchemy free tier enforces a hard 10-block getLogs range
const DEFAULT_TIER_CAPS: TierCaps = TierCaps {
    free: 10,
    payg: 2_000,
    growth: 100_000,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplorerMode {
    // Single v2 endpoint shared by all chains, selected by the
    // mandatory chainid query parameter
    Unified,
    // Network-specific endpoint, no chainid parameter
    Dedicated,
}

#[derive(Debug, Clone)]
pub struct ExplorerConfig {
    pub mode: ExplorerMode,
    pub base_url: String,
    pub chain_id: Option<u64>,
    pub api_keys: Vec<String>,
    // Optional local proxy; direct mode is the fallback when it is down
    pub proxy_url: Option<String>,
}

// Static per-chain configuration plus the environment overrides
// applied at startup
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: Network,
    pub rpc_urls: Vec<String>,
    pub explorer: ExplorerConfig,
    // Canonical endpoint for calls that must stay on one provider
    // (getLogs, tier detection, optimizer-governed batch reads)
    pub provider_url: Option<String>,
    pub balance_helper: Option<String>,
    pub contract_validator: Option<String>,
    pub tier_caps: TierCaps,
    // Rough seconds per block, used to size the head-relative
    // cold-start window
    pub approx_block_secs: u64,
}

const UNIFIED_EXPLORER_URL: &str = "https://api.etherscan.io/v2/api";

fn default_rpc_urls(network: Network) -> Vec<&'static str> {
    match network {
        Network::Ethereum => vec![
            "https://eth.llamarpc.com",
            "https://rpc.ankr.com/eth",
            "https://ethereum-rpc.publicnode.com",
            "https://eth.drpc.org",
        ],
        Network::Binance => vec![
            "https://bsc-dataseed.bnbchain.org",
            "https://bsc-dataseed1.defibit.io",
            "https://bsc-rpc.publicnode.com",
        ],
        Network::Polygon => vec![
            "https://polygon-rpc.com",
            "https://rpc.ankr.com/polygon",
            "https://polygon-bor-rpc.publicnode.com",
        ],
        Network::Arbitrum => vec![
            "https://arb1.arbitrum.io/rpc",
            "https://rpc.ankr.com/arbitrum",
            "https://arbitrum-one-rpc.publicnode.com",
        ],
        Network::Optimism => vec![
            "https://mainnet.optimism.io",
            "https://rpc.ankr.com/optimism",
            "https://optimism-rpc.publicnode.com",
        ],
        Network::Base => vec![
            "https://mainnet.base.org",
            "https://base-rpc.publicnode.com",
            "https://base.llamarpc.com",
        ],
        Network::Avalanche => vec![
            "https://api.avax.network/ext/bc/C/rpc",
            "https://avalanche-c-chain-rpc.publicnode.com",
        ],
        Network::Gnosis => vec![
            "https://rpc.gnosischain.com",
            "https://gnosis-rpc.publicnode.com",
        ],
        Network::Fantom => vec![
            "https://rpc.ftm.tools",
            "https://fantom-rpc.publicnode.com",
        ],
        Network::Celo => vec![
            "https://forno.celo.org",
            "https://celo-rpc.publicnode.com",
        ],
        Network::Moonbeam => vec![
            "https://rpc.api.moonbeam.network",
            "https://moonbeam-rpc.publicnode.com",
        ],
        Network::Linea => vec![
            "https://rpc.linea.build",
            "https://linea-rpc.publicnode.com",
        ],
        Network::Scroll => vec![
            "https://rpc.scroll.io",
            "https://scroll-rpc.publicnode.com",
        ],
        Network::Mantle => vec![
            "https://rpc.mantle.xyz",
            "https://mantle-rpc.publicnode.com",
        ],
    }
}

// Chains covered by the unified v2 explorer; the rest keep their own
// endpoint and key ring
fn dedicated_explorer(network: Network) -> Option<(&'static str, &'static str)> {
    match network {
        Network::Celo => Some(("https://api.celoscan.io/api", "CELOSCAN_API_KEYS")),
        Network::Mantle => Some(("https://api.mantlescan.xyz/api", "MANTLESCAN_API_KEYS")),
        _ => None,
    }
}

// Subdomain of the provider-primary endpoint, when the chain is served
fn alchemy_subdomain(network: Network) -> Option<&'static str> {
    match network {
        Network::Ethereum => Some("eth-mainnet"),
        Network::Polygon => Some("polygon-mainnet"),
        Network::Arbitrum => Some("arb-mainnet"),
        Network::Optimism => Some("opt-mainnet"),
        Network::Base => Some("base-mainnet"),
        Network::Avalanche => Some("avax-mainnet"),
        Network::Gnosis => Some("gnosis-mainnet"),
        Network::Linea => Some("linea-mainnet"),
        Network::Scroll => Some("scroll-mainnet"),
        _ => None,
    }
}

// Helper aggregators are deployed at the same CREATE2 address on every
// supported chain; chains where deployment is still pending fall back
// to per-address RPC reads
fn default_balance_helper(network: Network) -> Option<&'static str> {
    match network {
        Network::Fantom => None,
        _ => Some("0xb1f8e55c7f64d203c1400b9d8555d050f94adf39"),
    }
}

fn default_contract_validator(network: Network) -> Option<&'static str> {
    match network {
        Network::Fantom => None,
        _ => Some("0x90f79bf6eb2c4f870365e785982e1f101e93b906"),
    }
}

fn approx_block_secs(network: Network) -> u64 {
    match network {
        Network::Ethereum => 12,
        Network::Binance => 3,
        Network::Polygon | Network::Gnosis | Network::Celo => 5,
        Network::Arbitrum => 1,
        Network::Optimism | Network::Base | Network::Fantom | Network::Mantle => 2,
        Network::Avalanche | Network::Linea | Network::Scroll => 3,
        Network::Moonbeam => 12,
    }
}

impl NetworkConfig {
    // Resolve the effective configuration for one network: static
    // tables first, then environment overrides
    pub fn resolve(network: Network) -> Self {
        let mut rpc_urls: Vec<String> = env_list(&network.rpc_env_var());
        if rpc_urls.is_empty() {
            rpc_urls = default_rpc_urls(network)
                .into_iter()
                .map(str::to_string)
                .collect();
        }

        let explorer = match dedicated_explorer(network) {
            Some((base_url, keys_env)) => {
                let mut api_keys = env_list(keys_env);
                if api_keys.is_empty() {
                    api_keys = env_list("ETHERSCAN_API_KEYS");
                }
                ExplorerConfig {
                    mode: ExplorerMode::Dedicated,
                    base_url: base_url.to_string(),
                    chain_id: None,
                    api_keys,
                    proxy_url: explorer_proxy_url(),
                }
            }
            None => ExplorerConfig {
                mode: ExplorerMode::Unified,
                base_url: UNIFIED_EXPLORER_URL.to_string(),
                chain_id: Some(network.chain_id()),
                api_keys: env_list("ETHERSCAN_API_KEYS"),
                proxy_url: explorer_proxy_url(),
            },
        };

        let provider_url = if use_rpc_proxy() {
            env_string("RPC_PROXY_URL").map(|base| format!("{}/{}", base.trim_end_matches('/'), network))
        } else {
            env_string("ALCHEMY_API_KEY").and_then(|key| {
                alchemy_subdomain(network)
                    .map(|sub| format!("https://{}.g.alchemy.com/v2/{}", sub, key))
            })
        };

        Self {
            network,
            rpc_urls,
            explorer,
            provider_url,
            balance_helper: default_balance_helper(network).map(str::to_string),
            contract_validator: default_contract_validator(network).map(str::to_string),
            tier_caps: DEFAULT_TIER_CAPS,
            approx_block_secs: approx_block_secs(network),
        }
    }

    // Discovered helper deployments stored in the database take
    // precedence over the static tables
    pub fn apply_helper_overrides(&mut self, overrides: &HashMap<String, String>) {
        if let Some(addr) = overrides.get("balance_helper") {
            self.balance_helper = Some(addr.clone());
        }
        if let Some(addr) = overrides.get("contract_validator") {
            self.contract_validator = Some(addr.clone());
        }
    }

    // Endpoint used when a call must be pinned to one provider;
    // falls back to the head of the rotation list
    pub fn primary_url(&self) -> &str {
        self.provider_url
            .as_deref()
            .unwrap_or_else(|| self.rpc_urls.first().map(String::as_str).unwrap_or_default())
    }
}

fn explorer_proxy_url() -> Option<String> {
    if use_etherscan_proxy() {
        env_string("ETHERSCAN_PROXY_URL")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        let config = NetworkConfig::resolve(Network::Ethereum);
        assert!(!config.rpc_urls.is_empty());
        assert_eq!(config.explorer.mode, ExplorerMode::Unified);
        assert_eq!(config.explorer.chain_id, Some(1));
        assert!(config.balance_helper.is_some());
    }

    #[test]
    fn test_dedicated_explorer_has_no_chain_id() {
        let config = NetworkConfig::resolve(Network::Celo);
        assert_eq!(config.explorer.mode, ExplorerMode::Dedicated);
        assert_eq!(config.explorer.chain_id, None);
    }

    #[test]
    fn test_tier_caps() {
        assert_eq!(DEFAULT_TIER_CAPS.cap_for(ProviderTier::Free), 10);
        assert!(DEFAULT_TIER_CAPS.cap_for(ProviderTier::Growth) > DEFAULT_TIER_CAPS.cap_for(ProviderTier::Payg));
    }

    #[test]
    fn test_helper_overrides_take_precedence() {
        let mut config = NetworkConfig::resolve(Network::Base);
        let mut overrides = HashMap::new();
        overrides.insert(
            "balance_helper".to_string(),
            "0x1111111111111111111111111111111111111111".to_string(),
        );
        config.apply_helper_overrides(&overrides);
        assert_eq!(
            config.balance_helper.as_deref(),
            Some("0x1111111111111111111111111111111111111111")
        );
    }
}
