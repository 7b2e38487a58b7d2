//! Per-node stage processing for distributed inference.
//!
//! A request moves `CREATED → FORWARDING → COMPLETE`. The originator builds
//! the initial [`PipelineState`] from the query; every stage applies the
//! layers it holds from `current_layer` to the end of its shard and hands
//! back either a state to forward or, once every layer is done, the
//! decoded [`InferenceResult`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::types::{InferenceResult, LayerRange, ModelShard, PipelineState, unix_now};

use super::compute::{LayerCompute, LayerOutput};
use super::error::PipelineError;

/// Characters of the query turned into input embeddings.
const MAX_QUERY_CHARS: usize = 512;
const VOCAB_SIZE: u64 = 50_000;

/// What a stage produced.
#[derive(Clone, Debug, PartialEq)]
pub enum StageOutcome {
    /// More layers remain; send the state on.
    Forward(PipelineState),
    /// Every layer has been applied.
    Complete {
        state: PipelineState,
        result: InferenceResult,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub node_id: String,
    pub loaded_models: Vec<String>,
    pub loaded_shards: usize,
    /// Layers held locally across all models.
    pub local_layers: u32,
    pub total_memory_bytes: u64,
    pub total_inferences: u64,
    pub total_energy_mj: f64,
    pub avg_energy_per_inference_mj: f64,
}

struct LoadedModel {
    shard: ModelShard,
    total_layers: u32,
}

#[derive(Default)]
struct CoordinatorState {
    models: BTreeMap<String, LoadedModel>,
    total_inferences: u64,
    total_energy_mj: f64,
}

pub struct PipelineCoordinator {
    node_id: String,
    hidden_dim: u32,
    compute: Arc<dyn LayerCompute>,
    state: Mutex<CoordinatorState>,
}

/// Maps final activations to token ids, one per activation up to
/// `max_tokens`.
pub fn generate_tokens(activations: &[f32], max_tokens: u32) -> Vec<u32> {
    activations
        .iter()
        .take(max_tokens as usize)
        .map(|a| ((f64::from(a.abs()) * VOCAB_SIZE as f64) as u64 % VOCAB_SIZE) as u32)
        .collect()
}

pub fn detokenize(tokens: &[u32]) -> String {
    format!("[ARIA inference output: {} tokens generated]", tokens.len())
}

fn checked_energy(output: &LayerOutput) -> Result<f64, PipelineError> {
    if !output.energy_mj.is_finite() || output.energy_mj < 0.0 {
        return Err(PipelineError::InvalidEnergy(output.energy_mj));
    }
    Ok(output.energy_mj)
}

impl PipelineCoordinator {
    pub fn new(node_id: impl Into<String>, hidden_dim: u32, compute: Arc<dyn LayerCompute>) -> Self {
        Self {
            node_id: node_id.into(),
            hidden_dim,
            compute,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Loads layers `[shard_start, shard_end]` of `model_id`, replacing any
    /// shard of the same model. `None` as the end means the last layer.
    pub fn load_model(
        &self,
        model_id: &str,
        total_layers: u32,
        shard_start: u32,
        shard_end: Option<u32>,
    ) -> Result<ModelShard, PipelineError> {
        let shard_end = shard_end.unwrap_or(total_layers.saturating_sub(1));
        if total_layers == 0 || shard_start > shard_end || shard_end >= total_layers {
            return Err(PipelineError::InvalidShard {
                model_id: model_id.to_string(),
                layers: LayerRange::new(shard_start, shard_end),
                total_layers,
            });
        }

        let shard = ModelShard::new(model_id, shard_start, shard_end, self.hidden_dim);
        info!(
            node_id = %self.node_id,
            shard_id = %shard.shard_id,
            size_bytes = shard.size_bytes,
            "loaded model shard"
        );
        self.lock().models.insert(
            model_id.to_string(),
            LoadedModel {
                shard: shard.clone(),
                total_layers,
            },
        );
        Ok(shard)
    }

    pub fn shard_for(&self, model_id: &str) -> Option<ModelShard> {
        self.lock().models.get(model_id).map(|m| m.shard.clone())
    }

    pub fn total_layers_for(&self, model_id: &str) -> Option<u32> {
        self.lock().models.get(model_id).map(|m| m.total_layers)
    }

    /// Embeds the query: one value per character, padded or truncated to
    /// the hidden dimension.
    pub fn initial_activations(&self, query: &str) -> Vec<f32> {
        let mut activations: Vec<f32> = query
            .chars()
            .take(MAX_QUERY_CHARS)
            .map(|c| u32::from(c) as f32 / 1000.0)
            .collect();
        activations.resize(self.hidden_dim as usize, 0.0);
        activations
    }

    /// Builds the state a request starts from, with this node as
    /// originator.
    pub fn create_state(
        &self,
        request_id: &str,
        query: &str,
        model_id: &str,
        max_tokens: u32,
        total_layers: u32,
    ) -> PipelineState {
        PipelineState {
            request_id: request_id.to_string(),
            model_id: model_id.to_string(),
            query: query.to_string(),
            max_tokens,
            activations: self.initial_activations(query),
            current_layer: 0,
            total_layers,
            nodes_used: Vec::new(),
            total_energy_mj: 0.0,
            start_time: unix_now(),
            originator_id: self.node_id.clone(),
        }
    }

    /// Runs this node's stage on `state`.
    ///
    /// A state behind this shard is a protocol violation. A state already
    /// past it is passed on unchanged.
    pub fn process_stage(&self, state: &PipelineState) -> Result<StageOutcome, PipelineError> {
        if state.is_complete() {
            return Ok(StageOutcome::Complete {
                result: self.finalize(state),
                state: state.clone(),
            });
        }

        let shard = self
            .shard_for(&state.model_id)
            .ok_or_else(|| PipelineError::ModelNotLoaded(state.model_id.clone()))?;
        let held = shard.layers();
        if state.current_layer < held.start {
            return Err(PipelineError::MissingLayers {
                current_layer: state.current_layer,
                shard: held,
            });
        }
        if state.current_layer > held.end {
            debug!(
                request_id = %state.request_id,
                layer = state.current_layer,
                "state already past local shard"
            );
            return Ok(StageOutcome::Forward(state.clone()));
        }

        let work = LayerRange::new(state.current_layer.max(held.start), held.end);
        let output = self.compute.apply_layers(&state.activations, work)?;
        let energy_mj = checked_energy(&output)?;
        let next = state.advance(output.activations, held.end + 1, &self.node_id, energy_mj);
        {
            let mut counters = self.lock();
            counters.total_inferences += 1;
            counters.total_energy_mj += energy_mj;
        }
        debug!(
            request_id = %state.request_id,
            layers = %work,
            energy_mj,
            "applied local layers"
        );

        if next.is_complete() {
            let result = self.finalize(&next);
            Ok(StageOutcome::Complete {
                state: next,
                result,
            })
        } else {
            Ok(StageOutcome::Forward(next))
        }
    }

    fn finalize(&self, state: &PipelineState) -> InferenceResult {
        let output_tokens = generate_tokens(&state.activations, state.max_tokens);
        let latency_ms = ((unix_now() - state.start_time) * 1000.0).max(0.0) as u64;
        InferenceResult {
            request_id: state.request_id.clone(),
            output_text: detokenize(&output_tokens),
            tokens_generated: output_tokens.len() as u32,
            output_tokens,
            latency_ms,
            energy_mj: state.total_energy_mj as u64,
            nodes_used: state.nodes_used.clone(),
            model_id: state.model_id.clone(),
        }
    }

    /// Runs the query through the locally held layers only.
    pub fn infer_local(
        &self,
        request_id: &str,
        query: &str,
        model_id: &str,
        max_tokens: u32,
    ) -> Result<InferenceResult, PipelineError> {
        let shard = self
            .shard_for(model_id)
            .ok_or_else(|| PipelineError::ModelNotLoaded(model_id.to_string()))?;
        let started = Instant::now();

        let output = self
            .compute
            .apply_layers(&self.initial_activations(query), shard.layers())?;
        let energy_mj = checked_energy(&output)?;
        {
            let mut counters = self.lock();
            counters.total_inferences += 1;
            counters.total_energy_mj += energy_mj;
        }

        let output_tokens = generate_tokens(&output.activations, max_tokens);
        Ok(InferenceResult {
            request_id: request_id.to_string(),
            output_text: detokenize(&output_tokens),
            tokens_generated: output_tokens.len() as u32,
            output_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
            energy_mj: energy_mj as u64,
            nodes_used: vec![self.node_id.clone()],
            model_id: model_id.to_string(),
        })
    }

    pub fn total_inferences(&self) -> u64 {
        self.lock().total_inferences
    }

    pub fn stats(&self) -> CoordinatorStats {
        let state = self.lock();
        CoordinatorStats {
            node_id: self.node_id.clone(),
            loaded_models: state.models.keys().cloned().collect(),
            loaded_shards: state.models.len(),
            local_layers: state.models.values().map(|m| m.shard.num_layers()).sum(),
            total_memory_bytes: state.models.values().map(|m| m.shard.size_bytes).sum(),
            total_inferences: state.total_inferences,
            total_energy_mj: state.total_energy_mj,
            avg_energy_per_inference_mj: if state.total_inferences > 0 {
                state.total_energy_mj / state.total_inferences as f64
            } else {
                0.0
            },
        }
    }
}
