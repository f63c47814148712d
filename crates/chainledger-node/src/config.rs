//! Node connection settings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    /// Ceiling for a single HTTP round trip, in seconds.
    pub request_timeout_secs: u64,
    /// Error codes the node uses for "no block at this height yet". A `null`
    /// block result always counts as not found.
    pub not_found_codes: Vec<i64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8000".into(),
            request_timeout_secs: 500,
            not_found_codes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: NodeConfig =
            serde_json::from_str(r#"{"rpc_url": "http://node:8000", "not_found_codes": [-32000]}"#)
                .unwrap();
        assert_eq!(cfg.rpc_url, "http://node:8000");
        assert_eq!(cfg.request_timeout_secs, 500);
        assert_eq!(cfg.not_found_codes, vec![-32000]);
    }
}
