// node/src/types/block.rs

//! Ledger blocks and their sealing proof.
//!
//! A [`Block`] bundles a bounded batch of [`InferenceRecord`]s and links to
//! its predecessor through `previous_hash`. The block hash covers every
//! field except `hash` itself.
//!
//! Serialization for hashing is done with **bincode 2** using the `serde`
//! integration (`bincode::serde::encode_to_vec`) and an explicit
//! `standard()` config. The same canonical encoding is used by the
//! RocksDB store.

use serde::{Deserialize, Serialize};

use super::{Hash256, InferenceRecord};

/// A block in the provenance chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: f64,
    pub records: Vec<InferenceRecord>,
    /// Stored hash of the previous block; all zeros for genesis.
    pub previous_hash: Hash256,
    /// Sealing counter, incremented until the hash meets the difficulty.
    pub nonce: u64,
    pub contributor_id: String,
    pub hash: Hash256,
}

/// Borrowed view of everything that is covered by the block hash.
#[derive(Serialize)]
struct HashedFields<'a> {
    index: u64,
    timestamp: f64,
    records: &'a [InferenceRecord],
    previous_hash: &'a Hash256,
    nonce: u64,
    contributor_id: &'a str,
}

impl Block {
    /// Builds the genesis block: index 0, zero parent, no records.
    pub fn genesis(timestamp: f64) -> Self {
        let mut block = Block {
            index: 0,
            timestamp,
            records: Vec::new(),
            previous_hash: Hash256::ZERO,
            nonce: 0,
            contributor_id: "genesis".to_string(),
            hash: Hash256::ZERO,
        };
        block.hash = block.compute_hash();
        block
    }

    /// Returns the canonical byte representation of the hashed fields.
    ///
    /// This uses **bincode 2** with the `standard()` configuration. All
    /// hashing that depends on a "canonical" form goes through this method
    /// to avoid format drift.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let view = HashedFields {
            index: self.index,
            timestamp: self.timestamp,
            records: &self.records,
            previous_hash: &self.previous_hash,
            nonce: self.nonce,
            contributor_id: &self.contributor_id,
        };
        let cfg = bincode::config::standard();
        // Encoding into a Vec cannot fail for these plain field types.
        bincode::serde::encode_to_vec(&view, cfg).unwrap_or_default()
    }

    /// Recomputes the hash from the block's contents (ignoring `hash`).
    pub fn compute_hash(&self) -> Hash256 {
        Hash256::compute(&self.canonical_bytes())
    }

    /// Increments the nonce until the hash has `difficulty` leading zero
    /// hex characters, then stores and returns it.
    ///
    /// The proof makes tampering detectable and mildly expensive; it is
    /// not an admission-control mechanism.
    pub fn seal(&mut self, difficulty: usize) -> Hash256 {
        loop {
            let hash = self.compute_hash();
            if hash.leading_hex_zeros() >= difficulty {
                self.hash = hash;
                return hash;
            }
            self.nonce += 1;
        }
    }

    /// Returns `true` if the stored hash matches the contents and meets
    /// `difficulty`.
    pub fn is_sealed(&self, difficulty: usize) -> bool {
        self.hash == self.compute_hash() && self.hash.leading_hex_zeros() >= difficulty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(i: u64) -> InferenceRecord {
        InferenceRecord {
            query_hash: Hash256::compute(&i.to_le_bytes()),
            output_hash: Hash256::compute(b"out"),
            model_id: "aria-2b-1bit".to_string(),
            node_ids: vec!["a".to_string()],
            energy_mj: 28,
            latency_ms: 100,
            timestamp: 1_700_000_000.0,
            tokens_generated: 4,
        }
    }

    fn block() -> Block {
        Block {
            index: 1,
            timestamp: 1_700_000_001.0,
            records: vec![record(1), record(2)],
            previous_hash: Hash256::compute(b"parent"),
            nonce: 0,
            contributor_id: "node-a".to_string(),
            hash: Hash256::ZERO,
        }
    }

    #[test]
    fn genesis_has_zero_parent_and_no_records() {
        let g = Block::genesis(1_700_000_000.0);
        assert_eq!(g.index, 0);
        assert_eq!(g.previous_hash.to_hex(), "0".repeat(64));
        assert!(g.records.is_empty());
        assert_eq!(g.hash, g.compute_hash());
    }

    #[test]
    fn block_hash_ignores_stored_hash_field() {
        let mut b = block();
        let h1 = b.compute_hash();
        b.hash = Hash256([9u8; 32]);
        assert_eq!(b.compute_hash(), h1);
    }

    #[test]
    fn sealing_meets_difficulty() {
        for difficulty in 0..=2 {
            let mut b = block();
            let hash = b.seal(difficulty);
            assert!(hash.to_hex().starts_with(&"0".repeat(difficulty)));
            assert!(b.is_sealed(difficulty));
        }
    }

    #[test]
    fn content_change_breaks_seal() {
        let mut b = block();
        b.seal(1);
        b.records[0].energy_mj += 1;
        assert!(!b.is_sealed(1));
    }
}
