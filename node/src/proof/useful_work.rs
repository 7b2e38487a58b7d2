//! Proof of Useful Work: structural validation of completed-inference
//! claims and work-weighted contributor selection.
//!
//! Proofs are checked, not re-executed. A rejected proof is a counted
//! outcome ([`ProofRejection`]), never an error.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Hash256, unix_now};

/// Upper bound on a single claim's energy (1000 J).
pub const MAX_ENERGY_MJ: i64 = 1_000_000;
/// Upper bound on a single claim's latency (5 min).
pub const MAX_LATENCY_MS: i64 = 300_000;
/// Maximum clock skew between the proof timestamp and the validator.
pub const MAX_TIMESTAMP_SKEW_SECS: f64 = 3600.0;

/// A node's claim that it performed one inference.
///
/// Energy and latency are signed so that malformed negative claims coming
/// off the wire can be represented and rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsefulWorkProof {
    pub node_id: String,
    pub inference_id: String,
    /// All-zero hashes count as missing.
    pub query_hash: Hash256,
    pub output_hash: Hash256,
    pub model_id: String,
    pub energy_mj: i64,
    pub latency_ms: i64,
    pub timestamp: f64,
    #[serde(default)]
    pub nonce: u64,
}

/// Why a proof was refused.
#[derive(Clone, Debug, PartialEq)]
pub enum ProofRejection {
    MissingField(&'static str),
    EnergyOutOfRange(i64),
    LatencyOutOfRange(i64),
    TimestampSkew { skew_secs: f64 },
}

impl fmt::Display for ProofRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProofRejection::MissingField(name) => write!(f, "missing field {name}"),
            ProofRejection::EnergyOutOfRange(v) => {
                write!(f, "energy {v} mJ outside [0, {MAX_ENERGY_MJ}]")
            }
            ProofRejection::LatencyOutOfRange(v) => {
                write!(f, "latency {v} ms outside [0, {MAX_LATENCY_MS}]")
            }
            ProofRejection::TimestampSkew { skew_secs } => {
                write!(f, "timestamp skew {skew_secs:.0}s exceeds {MAX_TIMESTAMP_SKEW_SECS}s")
            }
        }
    }
}

impl UsefulWorkProof {
    /// Content hash of the proof, over the canonical bincode encoding.
    pub fn proof_hash(&self) -> Hash256 {
        let cfg = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec(self, cfg).unwrap_or_default();
        Hash256::compute(&bytes)
    }

    /// Structural checks against the validator's clock `now`.
    pub fn validate_at(&self, now: f64) -> Result<(), ProofRejection> {
        let strings = [
            ("node_id", &self.node_id),
            ("inference_id", &self.inference_id),
            ("model_id", &self.model_id),
        ];
        if let Some((name, _)) = strings.iter().find(|(_, v)| v.is_empty()) {
            return Err(ProofRejection::MissingField(*name));
        }
        if self.query_hash == Hash256::ZERO {
            return Err(ProofRejection::MissingField("query_hash"));
        }
        if self.output_hash == Hash256::ZERO {
            return Err(ProofRejection::MissingField("output_hash"));
        }

        if !(0..=MAX_ENERGY_MJ).contains(&self.energy_mj) {
            return Err(ProofRejection::EnergyOutOfRange(self.energy_mj));
        }
        if !(0..=MAX_LATENCY_MS).contains(&self.latency_ms) {
            return Err(ProofRejection::LatencyOutOfRange(self.latency_ms));
        }

        let skew_secs = (now - self.timestamp).abs();
        if skew_secs.is_nan() || skew_secs > MAX_TIMESTAMP_SKEW_SECS {
            return Err(ProofRejection::TimestampSkew { skew_secs });
        }
        Ok(())
    }

    pub fn verify(&self) -> bool {
        self.validate_at(unix_now()).is_ok()
    }
}

/// Accepted-proof pool with acceptance counters.
#[derive(Debug, Default)]
pub struct ProofOfUsefulWork {
    proofs: Vec<UsefulWorkProof>,
    verified_count: u64,
    rejected_count: u64,
}

impl ProofOfUsefulWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a proof stamped with the current time.
    #[allow(clippy::too_many_arguments)]
    pub fn create_proof(
        &self,
        node_id: &str,
        inference_id: &str,
        query_hash: Hash256,
        output_hash: Hash256,
        model_id: &str,
        energy_mj: i64,
        latency_ms: i64,
    ) -> UsefulWorkProof {
        UsefulWorkProof {
            node_id: node_id.to_string(),
            inference_id: inference_id.to_string(),
            query_hash,
            output_hash,
            model_id: model_id.to_string(),
            energy_mj,
            latency_ms,
            timestamp: unix_now(),
            nonce: 0,
        }
    }

    /// Validates and stores the proof. Returns whether it was accepted.
    pub fn submit_proof(&mut self, proof: UsefulWorkProof) -> bool {
        self.submit_proof_at(proof, unix_now())
    }

    pub fn submit_proof_at(&mut self, proof: UsefulWorkProof, now: f64) -> bool {
        match proof.validate_at(now) {
            Ok(()) => {
                self.proofs.push(proof);
                self.verified_count += 1;
                true
            }
            Err(reason) => {
                debug!(node_id = %proof.node_id, %reason, "rejected useful-work proof");
                self.rejected_count += 1;
                false
            }
        }
    }

    pub fn verified_count(&self) -> u64 {
        self.verified_count
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected_count
    }

    pub fn proofs(&self) -> &[UsefulWorkProof] {
        &self.proofs
    }

    /// Accepted proofs per node whose timestamp lies within `window_secs`
    /// of `now`.
    pub fn proof_counts_at(&self, now: f64, window_secs: f64) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for proof in &self.proofs {
            if now - proof.timestamp <= window_secs {
                *counts.entry(proof.node_id.as_str()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Node with the most accepted proofs in the last hour.
    pub fn select_top_contributor(&self) -> Option<String> {
        self.select_top_contributor_at(unix_now(), MAX_TIMESTAMP_SKEW_SECS)
    }

    /// Node with the most accepted proofs within the window. Equal counts
    /// resolve to the lexicographically smallest node id.
    pub fn select_top_contributor_at(&self, now: f64, window_secs: f64) -> Option<String> {
        let counts = self.proof_counts_at(now, window_secs);
        // BTreeMap iterates ascending; keep the first of any equal maximum.
        let mut best: Option<(&str, usize)> = None;
        for (node, count) in counts {
            if best.is_none_or(|(_, c)| count > c) {
                best = Some((node, count));
            }
        }
        best.map(|(node, _)| node.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: f64 = 1_700_000_000.0;

    fn proof(node: &str) -> UsefulWorkProof {
        UsefulWorkProof {
            node_id: node.to_string(),
            inference_id: "req_1".to_string(),
            query_hash: Hash256::compute(b"q"),
            output_hash: Hash256::compute(b"o"),
            model_id: "aria-2b-1bit".to_string(),
            energy_mj: 28,
            latency_ms: 450,
            timestamp: NOW,
            nonce: 0,
        }
    }

    #[test]
    fn well_formed_proof_is_accepted() {
        let mut pouw = ProofOfUsefulWork::new();
        assert!(pouw.submit_proof_at(proof("a"), NOW + 10.0));
        assert_eq!(pouw.verified_count(), 1);
        assert_eq!(pouw.rejected_count(), 0);
    }

    #[test]
    fn negative_energy_is_rejected_and_counted() {
        let mut pouw = ProofOfUsefulWork::new();
        let mut p = proof("a");
        p.energy_mj = -1;
        assert_eq!(p.validate_at(NOW), Err(ProofRejection::EnergyOutOfRange(-1)));
        assert!(!pouw.submit_proof_at(p, NOW));
        assert_eq!(pouw.rejected_count(), 1);
        assert!(pouw.proofs().is_empty());
    }

    #[test]
    fn stale_and_future_timestamps_are_rejected() {
        let mut pouw = ProofOfUsefulWork::new();
        let mut stale = proof("a");
        stale.timestamp = NOW - 3601.0;
        let mut future = proof("a");
        future.timestamp = NOW + 3601.0;

        assert!(!pouw.submit_proof_at(stale, NOW));
        assert!(!pouw.submit_proof_at(future, NOW));
        assert_eq!(pouw.rejected_count(), 2);
    }

    #[test]
    fn boundaries_are_inclusive() {
        let mut p = proof("a");
        p.energy_mj = MAX_ENERGY_MJ;
        p.latency_ms = MAX_LATENCY_MS;
        assert!(p.validate_at(NOW + 3600.0).is_ok());

        p.latency_ms = MAX_LATENCY_MS + 1;
        assert!(matches!(
            p.validate_at(NOW),
            Err(ProofRejection::LatencyOutOfRange(_))
        ));
    }

    #[test]
    fn missing_identifiers_are_rejected() {
        let mut p = proof("");
        assert_eq!(p.validate_at(NOW), Err(ProofRejection::MissingField("node_id")));
        p.node_id = "a".to_string();
        p.output_hash = Hash256::ZERO;
        assert_eq!(p.validate_at(NOW), Err(ProofRejection::MissingField("output_hash")));
    }

    #[test]
    fn top_contributor_by_count_with_lowest_id_on_tie() {
        let mut pouw = ProofOfUsefulWork::new();
        assert_eq!(pouw.select_top_contributor_at(NOW, 3600.0), None);

        for node in ["b", "c", "b", "a", "c"] {
            assert!(pouw.submit_proof_at(proof(node), NOW));
        }
        // b and c both have 2.
        assert_eq!(pouw.select_top_contributor_at(NOW, 3600.0).as_deref(), Some("b"));

        pouw.submit_proof_at(proof("c"), NOW);
        assert_eq!(pouw.select_top_contributor_at(NOW, 3600.0).as_deref(), Some("c"));
    }

    #[test]
    fn window_excludes_old_proofs() {
        let mut pouw = ProofOfUsefulWork::new();
        let mut old = proof("old");
        old.timestamp = NOW - 1000.0;
        pouw.submit_proof_at(old.clone(), NOW);
        pouw.submit_proof_at(old, NOW);
        pouw.submit_proof_at(proof("new"), NOW);

        assert_eq!(pouw.select_top_contributor_at(NOW, 100.0).as_deref(), Some("new"));
        assert_eq!(pouw.select_top_contributor_at(NOW, 3600.0).as_deref(), Some("old"));
    }

    #[test]
    fn proof_hash_changes_with_content() {
        let a = proof("a");
        let mut b = a.clone();
        b.nonce = 1;
        assert_ne!(a.proof_hash(), b.proof_hash());
        assert_eq!(a.proof_hash(), proof("a").proof_hash());
    }
}
