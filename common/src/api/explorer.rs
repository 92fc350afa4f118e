use serde::Deserialize;
use serde_json::Value;

// Envelope of every non-proxy explorer response
// status "1" carries data, status "0" is either "no data" or an error,
// distinguished by the message text
#[derive(Debug, Clone, Deserialize)]
pub struct ExplorerEnvelope {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    // module=proxy responses are JSON-RPC shaped instead
    #[serde(default)]
    pub error: Option<Value>,
}

// Messages that mean "the query matched nothing", which is data and
// not a failure
const NO_DATA_MESSAGES: [&str; 3] = [
    "No data found",
    "No transactions found",
    "No records found",
];

pub fn is_no_data_message(message: &str) -> bool {
    NO_DATA_MESSAGES.iter().any(|m| message.contains(m))
}

pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("max rate") || message.contains("NOTOK")
}

// One row of module=contract&action=getcontractcreation
#[derive(Debug, Clone, Deserialize)]
pub struct ContractCreationEntry {
    #[serde(rename = "contractAddress")]
    pub contract_address: String,
    #[serde(rename = "contractCreator", default)]
    pub contract_creator: Option<String>,
    #[serde(rename = "txHash")]
    pub tx_hash: String,
}

// Reduced row of module=contract&action=getsourcecode
#[derive(Debug, Clone, Deserialize)]
pub struct SourceCodeEntry {
    #[serde(rename = "ContractName", default)]
    pub contract_name: String,
    #[serde(rename = "Proxy", default)]
    pub proxy: String,
    #[serde(rename = "Implementation", default)]
    pub implementation: String,
    #[serde(rename = "ABI", default)]
    pub abi: String,
}

impl SourceCodeEntry {
    // The explorer reports verification by returning a real ABI;
    // unverified contracts carry the literal "not verified" sentinel
    pub fn is_verified(&self) -> bool {
        !self.contract_name.is_empty() && !self.abi.contains("not verified")
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy == "1" && !self.implementation.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_data_detection() {
        assert!(is_no_data_message("No data found"));
        assert!(is_no_data_message("No transactions found"));
        assert!(is_no_data_message("No records found"));
        assert!(!is_no_data_message("Max rate limit reached"));
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(is_rate_limit_message("Max rate limit reached"));
        assert!(is_rate_limit_message("NOTOK"));
        assert!(!is_rate_limit_message("No data found"));
    }

    #[test]
    fn test_creation_entry_deserialization() {
        let entry: ContractCreationEntry = serde_json::from_value(json!({
            "contractAddress": "0x4200000000000000000000000000000000000006",
            "contractCreator": null,
            "txHash": "GENESIS_4200000000000000000000000000000000000006"
        }))
        .unwrap();
        assert!(entry.tx_hash.starts_with("GENESIS"));
    }

    #[test]
    fn test_source_code_verification() {
        let verified: SourceCodeEntry = serde_json::from_value(json!({
            "ContractName": "TetherToken",
            "Proxy": "0",
            "Implementation": "",
            "ABI": "[{\"constant\":true}]"
        }))
        .unwrap();
        assert!(verified.is_verified());
        assert!(!verified.is_proxy());

        let unverified: SourceCodeEntry = serde_json::from_value(json!({
            "ContractName": "",
            "Proxy": "0",
            "Implementation": "",
            "ABI": "Contract source code not verified"
        }))
        .unwrap();
        assert!(!unverified.is_verified());
    }
}
