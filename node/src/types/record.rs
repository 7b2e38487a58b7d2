//! Provenance records for completed inferences.

use serde::{Deserialize, Serialize};

use super::Hash256;

/// An immutable record of a single completed inference.
///
/// This is the atomic unit of the provenance ledger. It stores hashes of
/// the query and the output rather than raw text, so the ledger can be
/// shared without leaking user data, while still allowing anyone holding
/// the text to prove it matches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceRecord {
    pub query_hash: Hash256,
    pub output_hash: Hash256,
    pub model_id: String,
    /// Nodes that contributed, in pipeline order.
    pub node_ids: Vec<String>,
    pub energy_mj: u64,
    pub latency_ms: u64,
    pub timestamp: f64,
    pub tokens_generated: u32,
}

impl InferenceRecord {
    /// Content identifier of the record.
    ///
    /// Uses the same canonical bincode-2 encoding as block hashing.
    pub fn to_hash(&self) -> Hash256 {
        let cfg = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec(self, cfg).unwrap_or_default();
        Hash256::compute(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(energy_mj: u64) -> InferenceRecord {
        InferenceRecord {
            query_hash: Hash256::compute(b"q"),
            output_hash: Hash256::compute(b"o"),
            model_id: "aria-2b-1bit".to_string(),
            node_ids: vec!["a".to_string(), "b".to_string()],
            energy_mj,
            latency_ms: 450,
            timestamp: 1_700_000_000.5,
            tokens_generated: 12,
        }
    }

    #[test]
    fn record_hash_is_deterministic_and_content_sensitive() {
        assert_eq!(record(28).to_hash(), record(28).to_hash());
        assert_ne!(record(28).to_hash(), record(29).to_hash());
    }

    #[test]
    fn json_form_keeps_hashes_as_hex() {
        let json = serde_json::to_value(record(1)).expect("serialize record");
        let q = json["query_hash"].as_str().expect("hex string");
        assert_eq!(q.len(), 64);
    }
}
