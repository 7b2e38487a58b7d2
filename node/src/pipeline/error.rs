use std::fmt;

use crate::types::LayerRange;

/// Errors raised by a [`crate::pipeline::LayerCompute`] backend.
#[derive(Debug)]
pub enum ComputeError {
    /// Transport-level error (e.g. HTTP failure, timeout).
    Transport(String),
    /// The engine returned a malformed or unexpected response.
    Protocol(String),
    /// The engine refused the request.
    Service(String),
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Transport(msg) => write!(f, "compute transport error: {msg}"),
            ComputeError::Protocol(msg) => write!(f, "compute protocol error: {msg}"),
            ComputeError::Service(msg) => write!(f, "compute service error: {msg}"),
        }
    }
}

impl std::error::Error for ComputeError {}

/// Errors raised while loading shards or processing pipeline stages.
#[derive(Debug)]
pub enum PipelineError {
    /// No shard of this model is loaded locally.
    ModelNotLoaded(String),
    /// Requested shard range does not fit the model.
    InvalidShard {
        model_id: String,
        layers: LayerRange,
        total_layers: u32,
    },
    /// The state still needs layers before this node's shard.
    MissingLayers { current_layer: u32, shard: LayerRange },
    /// The compute backend reported a negative or non-finite energy figure.
    InvalidEnergy(f64),
    Compute(ComputeError),
}

impl From<ComputeError> for PipelineError {
    fn from(e: ComputeError) -> Self {
        PipelineError::Compute(e)
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::ModelNotLoaded(model) => write!(f, "model {model} not loaded on this node"),
            PipelineError::InvalidShard {
                model_id,
                layers,
                total_layers,
            } => write!(
                f,
                "shard {layers} does not fit {model_id} with {total_layers} layers"
            ),
            PipelineError::MissingLayers {
                current_layer,
                shard,
            } => write!(
                f,
                "pipeline state at layer {current_layer} but this node has layers {shard}"
            ),
            PipelineError::InvalidEnergy(e) => write!(f, "compute reported invalid energy {e}"),
            PipelineError::Compute(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Compute(e) => Some(e),
            _ => None,
        }
    }
}
