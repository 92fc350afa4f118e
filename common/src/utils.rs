use alloy_primitives::{Address, U256};
use anyhow::{anyhow, Context, Result};

// Addresses are persisted lowercase with the 0x prefix, one canonical
// form per account across the whole pipeline
pub fn normalize_address(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let hex_part = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X"))?;
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", hex_part.to_lowercase()))
}

pub fn parse_address(input: &str) -> Option<Address> {
    normalize_address(input)?.parse().ok()
}

// Extract the address packed into a 32-byte log topic
pub fn topic_to_address(topic: &str) -> Option<String> {
    let hex_part = topic.strip_prefix("0x")?;
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    // the address occupies the low 20 bytes
    Some(format!("0x{}", hex_part[24..].to_lowercase()))
}

// Comma or whitespace separated lists, used for RPC URL overrides
// and explorer API key rings
pub fn split_list(input: &str) -> Vec<String> {
    input
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// JSON-RPC quantities are 0x-prefixed hex without leading zeros
pub fn parse_quantity(input: &str) -> Result<u64> {
    let hex_part = input
        .strip_prefix("0x")
        .ok_or_else(|| anyhow!("quantity '{}' is missing the 0x prefix", input))?;
    u64::from_str_radix(hex_part, 16)
        .with_context(|| format!("invalid hex quantity '{}'", input))
}

pub fn parse_u256(input: &str) -> Result<U256> {
    let hex_part = input
        .strip_prefix("0x")
        .ok_or_else(|| anyhow!("quantity '{}' is missing the 0x prefix", input))?;
    // an empty result ("0x") is returned by some nodes for zero
    if hex_part.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(hex_part, 16)
        .with_context(|| format!("invalid hex quantity '{}'", input))
}

pub fn to_quantity(value: u64) -> String {
    format!("{:#x}", value)
}

// "0x" or empty means the account has no deployed bytecode
pub fn is_empty_code(code: &str) -> bool {
    matches!(code, "" | "0x" | "0X")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address("0xDAC17F958D2ee523a2206206994597C13D831ec7").as_deref(),
            Some("0xdac17f958d2ee523a2206206994597c13d831ec7")
        );
        assert_eq!(normalize_address("dac17f958d2ee523a2206206994597c13d831ec7"), None);
        assert_eq!(normalize_address("0x1234"), None);
        assert_eq!(normalize_address("0xzz..."), None);
    }

    #[test]
    fn test_topic_to_address() {
        let topic = "0x000000000000000000000000DAC17F958D2ee523a2206206994597C13D831ec7";
        assert_eq!(
            topic_to_address(topic).as_deref(),
            Some("0xdac17f958d2ee523a2206206994597c13d831ec7")
        );
        assert_eq!(topic_to_address("0x1234"), None);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list("https://a.example, https://b.example\nhttps://c.example"),
            vec!["https://a.example", "https://b.example", "https://c.example"]
        );
        assert!(split_list("  ").is_empty());
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x10").unwrap(), 16);
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert!(parse_quantity("16").is_err());
    }

    #[test]
    fn test_parse_u256_empty_is_zero() {
        assert_eq!(parse_u256("0x").unwrap(), U256::ZERO);
        assert_eq!(parse_u256("0xde0b6b3a7640000").unwrap(), U256::from(10u64.pow(18)));
    }

    #[test]
    fn test_is_empty_code() {
        assert!(is_empty_code("0x"));
        assert!(!is_empty_code("0x6080"));
    }
}
