//! Pipeline chain construction from advertised shards.
//!
//! The builder walks layer indices upward from 0. At each step it picks a
//! candidate whose shard holds the next uncovered layer: one starting
//! exactly there if any, otherwise one that overlaps it (that holder then
//! runs only its layers from the cursor on). Ties go to the widest shard
//! and then the best-scored holder. Other holders ending at the same layer
//! become that stage's replicas. A layer no candidate holds is a gap, and
//! the build fails there.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::LayerRange;

/// A node able to serve one shard of the model.
#[derive(Clone, Debug, PartialEq)]
pub struct StageCandidate {
    pub node_id: String,
    pub shard_id: String,
    pub layers: LayerRange,
    pub host: String,
    pub port: u16,
    pub quality: f64,
}

/// One resolved stage of a pipeline chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub node_id: String,
    pub shard_id: String,
    pub layers: LayerRange,
    pub host: String,
    pub port: u16,
    /// Alternate holders of the same range, best first.
    pub replicas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainError {
    /// Model declares zero layers.
    NoLayers,
    /// No candidate holds `layer`.
    Gap { layer: u32 },
    /// The last shard reaches past the model's final layer.
    Overrun { end: u32, total_layers: u32 },
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::NoLayers => write!(f, "model declares no layers"),
            ChainError::Gap { layer } => write!(f, "no shard holds layer {layer}"),
            ChainError::Overrun { end, total_layers } => write!(
                f,
                "shard ends at layer {end} but the model has {total_layers} layers"
            ),
        }
    }
}

impl std::error::Error for ChainError {}

/// Ranks candidates: widest range, then quality, then node id.
fn rank(a: &StageCandidate, b: &StageCandidate) -> Ordering {
    b.layers
        .end
        .cmp(&a.layers.end)
        .then_with(|| b.quality.partial_cmp(&a.quality).unwrap_or(Ordering::Equal))
        .then_with(|| a.node_id.cmp(&b.node_id))
}

/// Builds a chain covering `[0, total_layers - 1]` exactly.
pub fn build_chain(
    total_layers: u32,
    candidates: &[StageCandidate],
) -> Result<Vec<PipelineStage>, ChainError> {
    if total_layers == 0 {
        return Err(ChainError::NoLayers);
    }

    let mut chain = Vec::new();
    let mut cursor = 0u32;
    while cursor < total_layers {
        let mut holding: Vec<&StageCandidate> = candidates
            .iter()
            .filter(|c| !c.layers.is_empty() && c.layers.contains(cursor))
            .collect();
        if holding.is_empty() {
            return Err(ChainError::Gap { layer: cursor });
        }
        holding.sort_by(|a, b| {
            (b.layers.start == cursor)
                .cmp(&(a.layers.start == cursor))
                .then_with(|| rank(a, b))
        });

        let primary = holding[0];
        if primary.layers.end >= total_layers {
            return Err(ChainError::Overrun {
                end: primary.layers.end,
                total_layers,
            });
        }

        let mut replicas: Vec<String> = Vec::new();
        for c in &holding[1..] {
            if c.layers.end == primary.layers.end
                && c.node_id != primary.node_id
                && !replicas.contains(&c.node_id)
            {
                replicas.push(c.node_id.clone());
            }
        }

        chain.push(PipelineStage {
            node_id: primary.node_id.clone(),
            shard_id: primary.shard_id.clone(),
            layers: primary.layers,
            host: primary.host.clone(),
            port: primary.port,
            replicas,
        });
        cursor = primary.layers.end + 1;
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(node: &str, start: u32, end: u32, quality: f64) -> StageCandidate {
        StageCandidate {
            node_id: node.to_string(),
            shard_id: format!("m_L{start}-{end}"),
            layers: LayerRange::new(start, end),
            host: "127.0.0.1".to_string(),
            port: 0,
            quality,
        }
    }

    #[test]
    fn three_shards_cover_24_layers_in_order() {
        let cands = [
            cand("c", 16, 23, 1.0),
            cand("a", 0, 7, 1.0),
            cand("b", 8, 15, 1.0),
        ];
        let chain = build_chain(24, &cands).unwrap();
        let nodes: Vec<_> = chain.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(nodes, ["a", "b", "c"]);
        assert_eq!(chain[2].layers, LayerRange::new(16, 23));
    }

    #[test]
    fn gap_fails_fast() {
        let cands = [cand("a", 0, 7, 1.0), cand("c", 16, 23, 1.0)];
        assert_eq!(build_chain(24, &cands), Err(ChainError::Gap { layer: 8 }));
    }

    #[test]
    fn missing_tail_is_a_gap() {
        let cands = [cand("a", 0, 7, 1.0)];
        assert_eq!(build_chain(24, &cands), Err(ChainError::Gap { layer: 8 }));
    }

    #[test]
    fn shard_past_last_layer_is_rejected() {
        let cands = [cand("a", 0, 31, 1.0)];
        assert_eq!(
            build_chain(24, &cands),
            Err(ChainError::Overrun {
                end: 31,
                total_layers: 24
            })
        );
    }

    #[test]
    fn widest_then_best_quality_wins_and_others_become_replicas() {
        let cands = [
            cand("narrow", 0, 3, 1.0),
            cand("wide-low", 0, 7, 0.5),
            cand("wide-high", 0, 7, 0.9),
            cand("tail", 8, 11, 1.0),
        ];
        let chain = build_chain(12, &cands).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].node_id, "wide-high");
        assert_eq!(chain[0].replicas, vec!["wide-low".to_string()]);
        assert!(chain[1].replicas.is_empty());
    }

    #[test]
    fn overlapping_shard_resumes_at_the_cursor() {
        let cands = [
            cand("a", 0, 7, 1.0),
            cand("b", 4, 15, 1.0),
            cand("c", 16, 23, 1.0),
        ];
        let chain = build_chain(24, &cands).unwrap();
        let nodes: Vec<_> = chain.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(nodes, ["a", "b", "c"]);
        assert_eq!(chain[1].layers, LayerRange::new(4, 15));
    }

    #[test]
    fn exact_start_beats_a_wider_overlap() {
        let cands = [
            cand("a", 0, 7, 1.0),
            cand("overlap", 4, 23, 1.0),
            cand("exact", 8, 23, 0.5),
        ];
        let chain = build_chain(24, &cands).unwrap();
        assert_eq!(chain[1].node_id, "exact");
        assert_eq!(chain[1].replicas, vec!["overlap".to_string()]);
    }

    #[test]
    fn zero_layers_is_an_error() {
        assert_eq!(build_chain(0, &[]), Err(ChainError::NoLayers));
    }
}
