use std::time::Duration;

/// Which model this node serves and which of its layers it holds.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub model_id: String,
    /// Layers in the full model.
    pub total_layers: u32,
    /// First layer held locally.
    pub shard_start: u32,
    /// Last layer held locally; `None` means through the final layer.
    pub shard_end: Option<u32>,
    pub hidden_dim: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_id: "aria-2b-1bit".to_string(),
            total_layers: 24,
            shard_start: 0,
            shard_end: None,
            hidden_dim: 2048,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ComputeBackend {
    /// In-process hash-derived layers.
    Simulated,
    /// External engine reached over HTTP.
    Http { base_url: String, timeout: Duration },
}

#[derive(Clone, Debug)]
pub struct ComputeConfig {
    pub backend: ComputeBackend,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            backend: ComputeBackend::Simulated,
        }
    }
}
