use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// Classification and enrichment labels attached to an address record
// Stored as a text[] column; unknown strings are preserved as curated
// labels so operator-added tags survive pipeline rewrites
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AddressTag {
    Eoa,
    Contract,
    Verified,
    Unverified,
    Proxy,
    Custom(String),
}

impl AddressTag {
    pub fn as_str(&self) -> &str {
        match self {
            AddressTag::Eoa => "EOA",
            AddressTag::Contract => "Contract",
            AddressTag::Verified => "Verified",
            AddressTag::Unverified => "Unverified",
            AddressTag::Proxy => "Proxy",
            AddressTag::Custom(s) => s,
        }
    }

    // true for the two mutually exclusive classification tags
    pub fn is_classification(&self) -> bool {
        matches!(self, AddressTag::Eoa | AddressTag::Contract)
    }
}

impl fmt::Display for AddressTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressTag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "EOA" => AddressTag::Eoa,
            "Contract" => AddressTag::Contract,
            "Verified" => AddressTag::Verified,
            "Unverified" => AddressTag::Unverified,
            "Proxy" => AddressTag::Proxy,
            other => AddressTag::Custom(other.to_string()),
        })
    }
}

impl From<String> for AddressTag {
    fn from(s: String) -> Self {
        s.parse().expect("infallible")
    }
}

impl From<AddressTag> for String {
    fn from(tag: AddressTag) -> Self {
        tag.as_str().to_string()
    }
}

// Replace any previous classification with the new one, keeping all
// non-classification tags untouched
pub fn reclassify(tags: &mut Vec<AddressTag>, classification: AddressTag) {
    debug_assert!(classification.is_classification());
    tags.retain(|t| !t.is_classification());
    tags.push(classification);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_string_roundtrip() {
        for tag in [
            AddressTag::Eoa,
            AddressTag::Contract,
            AddressTag::Verified,
            AddressTag::Unverified,
            AddressTag::Proxy,
            AddressTag::Custom("Exchange".to_string()),
        ] {
            let s = tag.to_string();
            assert_eq!(s.parse::<AddressTag>().unwrap(), tag);
        }
    }

    #[test]
    fn test_reclassify_replaces_previous_classification() {
        let mut tags = vec![
            AddressTag::Eoa,
            AddressTag::Custom("Bridge".to_string()),
        ];
        reclassify(&mut tags, AddressTag::Contract);
        assert_eq!(
            tags,
            vec![
                AddressTag::Custom("Bridge".to_string()),
                AddressTag::Contract
            ]
        );
    }
}
