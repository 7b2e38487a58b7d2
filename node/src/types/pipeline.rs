//! Model shards and the state carried through the layer pipeline.
//!
//! A request's forward pass is split across a chain of nodes, each owning a
//! contiguous, inclusive range of the model's layers (a [`ModelShard`]).
//! The partial computation travels between nodes as a [`PipelineState`];
//! once every layer has been applied the final node derives an
//! [`InferenceResult`].
//!
//! On the wire the activation vector is packed as consecutive little-endian
//! IEEE-754 `f32` values and base64-encoded into a single
//! `activations_b64` field. No arithmetic happens in transit, so the
//! round-trip is bit-exact.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::{Hash256, InferenceRecord};

/// Inclusive range of layer indices `[start, end]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: u32,
    pub end: u32,
}

impl LayerRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, layer: u32) -> bool {
        self.start <= layer && layer <= self.end
    }
}

impl fmt::Display for LayerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// A contiguous fragment of a model held by one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelShard {
    /// `"{model_id}_L{start}-{end}"`.
    pub shard_id: String,
    pub model_id: String,
    pub layer_start: u32,
    pub layer_end: u32,
    pub size_bytes: u64,
    pub checksum: Hash256,
}

impl ModelShard {
    /// Describes the shard of `model_id` covering `[layer_start, layer_end]`
    /// for a model with square `hidden_dim × hidden_dim` ternary layers.
    pub fn new(model_id: &str, layer_start: u32, layer_end: u32, hidden_dim: u32) -> Self {
        let weights_per_layer = u64::from(hidden_dim) * u64::from(hidden_dim);
        // 1.58 bits per ternary weight.
        let bytes_per_layer = (weights_per_layer * 158).div_ceil(800);
        let layers = u64::from(layer_end.saturating_sub(layer_start)) + 1;
        let checksum_input = format!("{model_id}:{layer_start}:{layer_end}:{hidden_dim}");
        Self {
            shard_id: Self::format_id(model_id, layer_start, layer_end),
            model_id: model_id.to_string(),
            layer_start,
            layer_end,
            size_bytes: bytes_per_layer * layers,
            checksum: Hash256::compute(checksum_input.as_bytes()),
        }
    }

    pub fn format_id(model_id: &str, layer_start: u32, layer_end: u32) -> String {
        format!("{model_id}_L{layer_start}-{layer_end}")
    }

    /// Splits a shard id back into `(model_id, layer range)`.
    ///
    /// Returns `None` for ids that do not follow the `_L{start}-{end}`
    /// convention.
    pub fn parse_id(shard_id: &str) -> Option<(&str, LayerRange)> {
        let (model_id, range) = shard_id.rsplit_once("_L")?;
        let (start, end) = range.split_once('-')?;
        let start: u32 = start.parse().ok()?;
        let end: u32 = end.parse().ok()?;
        if model_id.is_empty() || end < start {
            return None;
        }
        Some((model_id, LayerRange::new(start, end)))
    }

    pub fn layers(&self) -> LayerRange {
        LayerRange::new(self.layer_start, self.layer_end)
    }

    pub fn num_layers(&self) -> u32 {
        self.layers().len()
    }
}

/// Errors raised when decoding wire data.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    Base64(String),
    /// Packed payload length is not a multiple of 4 bytes.
    Misaligned(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Base64(e) => write!(f, "invalid base64 activations: {e}"),
            CodecError::Misaligned(len) => {
                write!(f, "activation payload of {len} bytes is not a multiple of 4")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Packs `activations` as little-endian `f32` and base64-encodes them.
pub fn encode_activations(activations: &[f32]) -> String {
    let mut packed = Vec::with_capacity(activations.len() * 4);
    for value in activations {
        packed.extend_from_slice(&value.to_le_bytes());
    }
    STANDARD.encode(packed)
}

/// Inverse of [`encode_activations`].
pub fn decode_activations(encoded: &str) -> Result<Vec<f32>, CodecError> {
    let packed = STANDARD
        .decode(encoded)
        .map_err(|e| CodecError::Base64(e.to_string()))?;
    if packed.len() % 4 != 0 {
        return Err(CodecError::Misaligned(packed.len()));
    }
    Ok(packed
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

mod activations_b64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_activations(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::decode_activations(&s).map_err(serde::de::Error::custom)
    }
}

/// The unit of work in flight between pipeline stages.
///
/// Treated as an immutable value: every stage transition builds a new
/// state through [`PipelineState::advance`] rather than mutating the one
/// it received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub request_id: String,
    pub model_id: String,
    pub query: String,
    pub max_tokens: u32,
    #[serde(rename = "activations_b64", with = "activations_b64")]
    pub activations: Vec<f32>,
    /// Next layer index to process.
    pub current_layer: u32,
    pub total_layers: u32,
    /// Contributing nodes, in traversal order.
    #[serde(default)]
    pub nodes_used: Vec<String>,
    #[serde(default)]
    pub total_energy_mj: f64,
    pub start_time: f64,
    #[serde(default)]
    pub originator_id: String,
}

impl PipelineState {
    /// Returns `true` once every layer has been applied.
    pub fn is_complete(&self) -> bool {
        self.current_layer >= self.total_layers
    }

    /// Produces the state that follows a stage run by `node_id`.
    #[must_use]
    pub fn advance(
        &self,
        activations: Vec<f32>,
        next_layer: u32,
        node_id: &str,
        energy_mj: f64,
    ) -> PipelineState {
        let mut nodes_used = self.nodes_used.clone();
        nodes_used.push(node_id.to_string());
        PipelineState {
            request_id: self.request_id.clone(),
            model_id: self.model_id.clone(),
            query: self.query.clone(),
            max_tokens: self.max_tokens,
            activations,
            current_layer: next_layer,
            total_layers: self.total_layers,
            nodes_used,
            total_energy_mj: self.total_energy_mj + energy_mj,
            start_time: self.start_time,
            originator_id: self.originator_id.clone(),
        }
    }
}

/// Result of a completed distributed inference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub request_id: String,
    #[serde(default)]
    pub output_tokens: Vec<u32>,
    pub output_text: String,
    pub latency_ms: u64,
    pub energy_mj: u64,
    pub nodes_used: Vec<String>,
    pub model_id: String,
    pub tokens_generated: u32,
}

impl InferenceResult {
    /// Builds the provenance entry for this result. Only hashes of the
    /// query and the output are kept.
    pub fn to_provenance_record(&self, query: &str, timestamp: f64) -> InferenceRecord {
        InferenceRecord {
            query_hash: Hash256::compute(query.as_bytes()),
            output_hash: Hash256::compute(self.output_text.as_bytes()),
            model_id: self.model_id.clone(),
            node_ids: self.nodes_used.clone(),
            energy_mj: self.energy_mj,
            latency_ms: self.latency_ms,
            timestamp,
            tokens_generated: self.tokens_generated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(activations: Vec<f32>) -> PipelineState {
        PipelineState {
            request_id: "r1".to_string(),
            model_id: "aria-2b-1bit".to_string(),
            query: "hello".to_string(),
            max_tokens: 8,
            activations,
            current_layer: 0,
            total_layers: 24,
            nodes_used: vec![],
            total_energy_mj: 0.0,
            start_time: 1_700_000_000.0,
            originator_id: "a".to_string(),
        }
    }

    #[test]
    fn activation_codec_is_bit_exact() {
        for v in [
            vec![],
            vec![1.5f32],
            vec![0.0, -0.0, f32::MIN_POSITIVE, f32::MAX, -123.456, 1e-30],
        ] {
            let decoded = decode_activations(&encode_activations(&v)).expect("decode");
            let a: Vec<u32> = v.iter().map(|x| x.to_bits()).collect();
            let b: Vec<u32> = decoded.iter().map(|x| x.to_bits()).collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn codec_packs_little_endian() {
        let encoded = encode_activations(&[1.0]);
        let raw = STANDARD.decode(encoded).unwrap();
        assert_eq!(raw, 1.0f32.to_le_bytes().to_vec());
    }

    #[test]
    fn codec_rejects_misaligned_payloads() {
        let encoded = STANDARD.encode([1u8, 2, 3]);
        assert_eq!(decode_activations(&encoded), Err(CodecError::Misaligned(3)));
        assert!(matches!(
            decode_activations("@@not base64@@"),
            Err(CodecError::Base64(_))
        ));
    }

    #[test]
    fn pipeline_state_wire_form_is_lossless() {
        let original = state(vec![0.25, -7.5, 3.0e8]);
        let json = serde_json::to_value(&original).expect("serialize state");
        assert!(json["activations_b64"].is_string());
        assert!(json.get("activations").is_none());

        let back: PipelineState = serde_json::from_value(json).expect("deserialize state");
        assert_eq!(back, original);
    }

    #[test]
    fn advance_builds_a_new_state() {
        let s0 = state(vec![1.0, 2.0]);
        let s1 = s0.advance(vec![3.0], 8, "node-a", 2.5);

        assert_eq!(s0.current_layer, 0);
        assert!(s0.nodes_used.is_empty());
        assert_eq!(s1.current_layer, 8);
        assert_eq!(s1.nodes_used, vec!["node-a".to_string()]);
        assert_eq!(s1.total_energy_mj, 2.5);
        assert!(!s1.is_complete());

        let s2 = s1.advance(vec![], 24, "node-b", 1.0);
        assert!(s2.is_complete());
        assert_eq!(s2.nodes_used.len(), 2);
    }

    #[test]
    fn shard_ids_roundtrip_through_parse() {
        let shard = ModelShard::new("aria-2b-1bit", 8, 15, 2048);
        assert_eq!(shard.shard_id, "aria-2b-1bit_L8-15");
        assert_eq!(shard.num_layers(), 8);
        assert!(shard.size_bytes > 0);

        let (model, range) = ModelShard::parse_id(&shard.shard_id).expect("parse");
        assert_eq!(model, "aria-2b-1bit");
        assert_eq!(range, LayerRange::new(8, 15));

        assert!(ModelShard::parse_id("no-range").is_none());
        assert!(ModelShard::parse_id("m_L9-3").is_none());
    }

    #[test]
    fn provenance_record_hashes_text() {
        let result = InferenceResult {
            request_id: "r1".to_string(),
            output_tokens: vec![1, 2],
            output_text: "out".to_string(),
            latency_ms: 12,
            energy_mj: 30,
            nodes_used: vec!["a".to_string()],
            model_id: "m".to_string(),
            tokens_generated: 2,
        };
        let record = result.to_provenance_record("in", 5.0);
        assert_eq!(record.query_hash, Hash256::compute(b"in"));
        assert_eq!(record.output_hash, Hash256::compute(b"out"));
        assert_eq!(record.energy_mj, 30);
        assert_eq!(record.timestamp, 5.0);
    }
}
