use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use hydrascan_common::{
    tags::AddressTag,
    time::TimestampSeconds,
    utils::normalize_address,
};

// One row of the addresses aggregate table
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct AddressRecord {
    pub address: String,
    pub network: String,
    pub first_seen: i64,
    pub last_updated: i64,
    pub code_hash: Option<String>,
    pub contract_name: Option<String>,
    pub deployed: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub fund: Option<i64>,
    pub last_fund_updated: Option<i64>,
    pub name_checked: Option<bool>,
    pub name_checked_at: Option<i64>,
}

impl AddressRecord {
    pub fn tag_set(&self) -> Vec<AddressTag> {
        self.tags
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|t| t.parse().expect("infallible"))
            .collect()
    }

    pub fn has_tag(&self, tag: &AddressTag) -> bool {
        self.tags
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|t| t == tag.as_str())
    }

    pub fn is_classified(&self) -> bool {
        self.has_tag(&AddressTag::Eoa) || self.has_tag(&AddressTag::Contract)
    }
}

// Incoming upsert payload; a None never erases what the row already
// holds (enforced by the SQL merge and mirrored by merge_into)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressUpsert {
    pub address: String,
    pub network: String,
    pub first_seen: i64,
    pub last_updated: i64,
    pub code_hash: Option<String>,
    pub contract_name: Option<String>,
    pub deployed: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub fund: Option<i64>,
    pub last_fund_updated: Option<i64>,
    pub name_checked: Option<bool>,
    pub name_checked_at: Option<i64>,
}

impl AddressUpsert {
    // Discovery payload for a fresh Transfer observation
    pub fn discovered(
        address: &str,
        network: &str,
        seen_at: TimestampSeconds,
    ) -> Option<Self> {
        let address = normalize_address(address)?;
        Some(Self {
            address,
            network: network.to_string(),
            first_seen: seen_at as i64,
            last_updated: seen_at as i64,
            ..Default::default()
        })
    }

    pub fn with_tags(mut self, tags: Vec<AddressTag>) -> Self {
        self.tags = Some(tags.into_iter().map(String::from).collect());
        self
    }

    // Combine two payloads for the same (address, network) before the
    // database round trip, with the same field-preservation rules the
    // SQL merge applies
    pub fn merge_from(&mut self, other: AddressUpsert) {
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_updated = self.last_updated.max(other.last_updated);
        if other.code_hash.is_some() {
            self.code_hash = other.code_hash;
        }
        if other.contract_name.is_some() {
            self.contract_name = other.contract_name;
        }
        if other.deployed.is_some() {
            self.deployed = other.deployed;
        }
        if other.tags.as_ref().is_some_and(|t| !t.is_empty()) {
            self.tags = other.tags;
        }
        if other.fund.is_some() {
            self.fund = other.fund;
            self.last_fund_updated = other.last_fund_updated;
        }
        if other.name_checked.is_some() {
            self.name_checked = other.name_checked;
            self.name_checked_at = other.name_checked_at;
        }
    }
}

// In-memory mirror of the ON CONFLICT merge, used by tests and by the
// batch deduplication path
pub fn merge_into(existing: &AddressRecord, payload: &AddressUpsert) -> AddressRecord {
    AddressRecord {
        address: existing.address.clone(),
        network: existing.network.clone(),
        first_seen: existing.first_seen.min(payload.first_seen),
        last_updated: payload.last_updated,
        code_hash: payload.code_hash.clone().or_else(|| existing.code_hash.clone()),
        contract_name: payload
            .contract_name
            .clone()
            .or_else(|| existing.contract_name.clone()),
        deployed: payload.deployed.or(existing.deployed),
        tags: match &payload.tags {
            Some(tags) if !tags.is_empty() => Some(tags.clone()),
            _ => existing.tags.clone(),
        },
        fund: payload.fund.or(existing.fund),
        last_fund_updated: payload.last_fund_updated.or(existing.last_fund_updated),
        name_checked: payload.name_checked.or(existing.name_checked),
        name_checked_at: payload.name_checked_at.or(existing.name_checked_at),
    }
}

// Sort keys the paginated listing supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Fund,
    FirstSeen,
}

// Opaque keyset cursor: the sort-key values of the last returned row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub sort: SortKey,
    pub fund: Option<i64>,
    pub deployed: Option<i64>,
    pub first_seen: Option<i64>,
    pub address: String,
}

impl Cursor {
    pub fn after_row(sort: SortKey, row: &AddressRecord) -> Self {
        Self {
            sort,
            fund: row.fund,
            deployed: row.deployed,
            first_seen: Some(row.first_seen),
            address: row.address.clone(),
        }
    }

    // The wire form is deliberately opaque to clients
    pub fn encode(&self) -> String {
        hex::encode(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = hex::decode(raw).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[derive(Debug, Clone)]
pub struct AddressQuery {
    pub networks: Vec<String>,
    pub sort: SortKey,
    pub limit: i64,
    pub cursor: Option<Cursor>,
    // listing fast path: only rows with a verified contract name
    pub named_only: bool,
    pub include_total: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing() -> AddressRecord {
        AddressRecord {
            address: "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string(),
            network: "ethereum".to_string(),
            first_seen: 1_600_000_000,
            last_updated: 1_600_000_000,
            code_hash: Some("0xabc".to_string()),
            contract_name: Some("Tether".to_string()),
            deployed: Some(1_511_266_584),
            tags: Some(vec!["Contract".to_string()]),
            fund: Some(100),
            last_fund_updated: Some(1_600_000_000),
            name_checked: Some(true),
            name_checked_at: Some(1_600_000_000),
        }
    }

    #[test]
    fn test_null_payload_preserves_fields() {
        let payload = AddressUpsert {
            address: "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string(),
            network: "ethereum".to_string(),
            first_seen: 1_700_000_000,
            last_updated: 1_700_000_000,
            tags: Some(vec!["Contract".to_string(), "Verified".to_string()]),
            ..Default::default()
        };
        let merged = merge_into(&existing(), &payload);

        assert_eq!(merged.deployed, Some(1_511_266_584));
        assert_eq!(merged.code_hash.as_deref(), Some("0xabc"));
        assert_eq!(merged.contract_name.as_deref(), Some("Tether"));
        assert_eq!(
            merged.tags,
            Some(vec!["Contract".to_string(), "Verified".to_string()])
        );
        assert_eq!(merged.last_updated, 1_700_000_000);
    }

    #[test]
    fn test_replaying_discovery_keeps_first_seen() {
        let payload = AddressUpsert {
            address: "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string(),
            network: "ethereum".to_string(),
            first_seen: 1_650_000_000,
            last_updated: 1_650_000_000,
            ..Default::default()
        };
        let merged = merge_into(&existing(), &payload);
        assert_eq!(merged.first_seen, 1_600_000_000);
        assert_eq!(merged.last_updated, 1_650_000_000);
    }

    #[test]
    fn test_empty_tags_are_retained_not_erased() {
        let payload = AddressUpsert {
            address: "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string(),
            network: "ethereum".to_string(),
            first_seen: 1_700_000_000,
            last_updated: 1_700_000_000,
            tags: Some(Vec::new()),
            ..Default::default()
        };
        let merged = merge_into(&existing(), &payload);
        assert_eq!(merged.tags, Some(vec!["Contract".to_string()]));
    }

    #[test]
    fn test_merge_from_combines_batch_duplicates() {
        let mut first = AddressUpsert::discovered(
            "0xDAC17F958D2ee523a2206206994597C13D831ec7",
            "ethereum",
            1_700_000_100,
        )
        .unwrap();
        let second = AddressUpsert {
            address: first.address.clone(),
            network: "ethereum".to_string(),
            first_seen: 1_700_000_000,
            last_updated: 1_700_000_200,
            code_hash: Some("0xdef".to_string()),
            ..Default::default()
        };
        first.merge_from(second);

        assert_eq!(first.first_seen, 1_700_000_000);
        assert_eq!(first.last_updated, 1_700_000_200);
        assert_eq!(first.code_hash.as_deref(), Some("0xdef"));
    }

    #[test]
    fn test_discovery_normalizes_address() {
        let payload = AddressUpsert::discovered(
            "0xDAC17F958D2ee523a2206206994597C13D831ec7",
            "ethereum",
            1_700_000_000,
        )
        .unwrap();
        assert_eq!(payload.address, "0xdac17f958d2ee523a2206206994597c13d831ec7");
        assert!(AddressUpsert::discovered("garbage", "ethereum", 0).is_none());
    }

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = Cursor {
            sort: SortKey::Fund,
            fund: Some(123_456),
            deployed: Some(1_511_266_584),
            first_seen: None,
            address: "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string(),
        };
        let encoded = cursor.encode();
        assert_eq!(Cursor::decode(&encoded), Some(cursor));
        assert_eq!(Cursor::decode("not-a-cursor"), None);
    }
}
