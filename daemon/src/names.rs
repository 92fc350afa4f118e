use std::sync::Arc;

use hydrascan_common::{
    api::explorer::SourceCodeEntry,
    network::Network,
    tags::AddressTag,
};

use crate::explorer::{ExplorerClient, ExplorerError};

// Verified-name lookup result for one contract
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedName {
    pub address: String,
    pub contract_name: Option<String>,
    pub verification: AddressTag,
    pub is_proxy: bool,
}

// Derive name and verification tags from a getsourcecode row
// Proxies get labelled with the implementation's name so the listing
// shows what the contract actually does
pub fn resolve_entry(address: &str, entry: &SourceCodeEntry) -> ResolvedName {
    if !entry.is_verified() {
        return ResolvedName {
            address: address.to_string(),
            contract_name: None,
            verification: AddressTag::Unverified,
            is_proxy: false,
        };
    }

    let is_proxy = entry.is_proxy();
    let contract_name = if is_proxy && !entry.implementation.is_empty() {
        Some(entry.implementation.clone())
    } else {
        Some(entry.contract_name.clone())
    };

    ResolvedName {
        address: address.to_string(),
        contract_name,
        verification: AddressTag::Verified,
        is_proxy,
    }
}

// Explorer-backed verified contract name resolver
pub struct NameResolver {
    network: Network,
    explorer: Arc<ExplorerClient>,
}

impl NameResolver {
    pub fn new(network: Network, explorer: Arc<ExplorerClient>) -> Self {
        Self { network, explorer }
    }

    // One getsourcecode call per contract; the action has no batch form
    pub async fn resolve(&self, address: &str) -> Result<ResolvedName, ExplorerError> {
        let entries = self.explorer.source_code(address).await?;
        match entries.first() {
            Some(entry) => Ok(resolve_entry(address, entry)),
            None => {
                debug!("{}: no source entry for {}", self.network, address);
                Ok(ResolvedName {
                    address: address.to_string(),
                    contract_name: None,
                    verification: AddressTag::Unverified,
                    is_proxy: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str, proxy: &str, implementation: &str, abi: &str) -> SourceCodeEntry {
        serde_json::from_value(json!({
            "ContractName": name,
            "Proxy": proxy,
            "Implementation": implementation,
            "ABI": abi,
        }))
        .unwrap()
    }

    #[test]
    fn test_verified_contract() {
        let resolved = resolve_entry("0xabc", &entry("TetherToken", "0", "", "[{}]"));
        assert_eq!(resolved.contract_name.as_deref(), Some("TetherToken"));
        assert_eq!(resolved.verification, AddressTag::Verified);
        assert!(!resolved.is_proxy);
    }

    #[test]
    fn test_proxy_uses_implementation_name() {
        let resolved = resolve_entry("0xabc", &entry("TransparentProxy", "1", "FiatTokenV2", "[{}]"));
        assert_eq!(resolved.contract_name.as_deref(), Some("FiatTokenV2"));
        assert!(resolved.is_proxy);
    }

    #[test]
    fn test_unverified_contract_has_no_name() {
        let resolved = resolve_entry(
            "0xabc",
            &entry("", "0", "", "Contract source code not verified"),
        );
        assert_eq!(resolved.contract_name, None);
        assert_eq!(resolved.verification, AddressTag::Unverified);
    }
}
