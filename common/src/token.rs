use std::fs;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::Network;
use crate::utils::normalize_address;

// Curated ERC-20 token set used by the fund updater, one file per
// network under tokens/<network>.json
// The decimals recorded here are authoritative; we never trust the
// on-chain decimals() call for pricing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Error)]
pub enum TokenConfigError {
    #[error("cannot read token file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("invalid token file {0}: {1}")]
    Parse(String, #[source] serde_json::Error),
}

// Load the curated token list for a network
// A missing file is not an error: networks without a curated set only
// track native balances
pub fn load_tokens(dir: &Path, network: Network) -> Result<Vec<TokenMetadata>, TokenConfigError> {
    let path = dir.join(format!("{}.json", network));
    if !path.exists() {
        return Ok(Vec::new());
    }

    let display = path.display().to_string();
    let raw = fs::read_to_string(&path).map_err(|e| TokenConfigError::Io(display.clone(), e))?;
    let parsed: Vec<TokenMetadata> =
        serde_json::from_str(&raw).map_err(|e| TokenConfigError::Parse(display.clone(), e))?;

    let mut tokens = Vec::with_capacity(parsed.len());
    for mut token in parsed {
        match normalize_address(&token.address) {
            Some(normalized) => {
                token.address = normalized;
                tokens.push(token);
            }
            None => {
                warn!(
                    "Skipping token {} on {}: invalid address '{}'",
                    token.symbol, network, token.address
                );
            }
        }
    }

    Ok(tokens)
}
