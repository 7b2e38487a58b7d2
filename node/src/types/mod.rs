//! Core domain types shared by every component of a node.
//!
//! This module defines the strongly-typed content hash used by the ledger
//! and the proofs, together with the data model that flows between nodes:
//! consent descriptors, model shards, pipeline state, inference results,
//! provenance records and ledger blocks. The goal is to avoid "naked"
//! byte buffers and loosely-typed maps in public APIs.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod block;
pub mod consent;
pub mod pipeline;
pub mod record;

pub use block::Block;
pub use consent::{ConsentDescriptor, ConsentError, Day, InferenceRequest, Schedule, TaskType};
pub use pipeline::{
    CodecError, InferenceResult, LayerRange, ModelShard, PipelineState, decode_activations,
    encode_activations,
};
pub use record::InferenceRecord;

/// Length in bytes of all 256-bit hash types used in this module.
pub const HASH_LEN: usize = 32;

/// Strongly-typed 256-bit hash wrapper (BLAKE3-256).
///
/// This type backs every content hash in the node (query and output
/// hashes, block hashes, proof hashes). On the wire and in the ledger
/// export it is always rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; HASH_LEN]);

impl Hash256 {
    /// The all-zero hash, used as the parent link of the genesis block.
    pub const ZERO: Hash256 = Hash256([0u8; HASH_LEN]);

    /// Computes a new [`Hash256`] as the BLAKE3-256 hash of `data`.
    ///
    /// The result is deterministic for a given byte slice and is suitable
    /// for use as an identifier or content hash, but it is **not**
    /// a password hash or KDF.
    pub fn compute(data: &[u8]) -> Self {
        let h = blake3::hash(data);
        Hash256(*h.as_bytes())
    }

    /// Returns the underlying 32-byte hash as a borrowed array.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex rendering (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut arr = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Hash256(arr))
    }

    /// Number of leading `'0'` characters in the hex rendering.
    pub fn leading_hex_zeros(&self) -> usize {
        let mut zeros = 0;
        for byte in self.0 {
            if byte == 0 {
                zeros += 2;
                continue;
            }
            if byte >> 4 == 0 {
                zeros += 1;
            }
            break;
        }
        zeros
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Returns the current wall-clock time as fractional seconds since Unix epoch.
///
/// On error (system clock before epoch) this falls back to 0.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs_f64()
}
