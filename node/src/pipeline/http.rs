//! HTTP client for an external layer engine.
//!
//! This implementation of [`LayerCompute`] talks to an out-of-process
//! inference engine (e.g. a bitnet.cpp wrapper) over HTTP. It assumes the
//! engine exposes a JSON API of the form:
//!
//! ```json
//! POST /layers
//! {
//!   "activations_b64": "AACAPwAAAEA=",
//!   "layer_start": 8,
//!   "layer_end": 15
//! }
//!
//! Response:
//! {
//!   "activations_b64": "...",
//!   "energy_mj": 33.5
//! }
//! ```
//!
//! Activations use the same packing as `pipeline_forward` on the wire.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::types::{LayerRange, decode_activations, encode_activations};

use super::compute::{LayerCompute, LayerOutput};
use super::error::ComputeError;

/// HTTP-based layer engine.
///
/// Uses the blocking `reqwest` client; callers inside a Tokio runtime run
/// it through `spawn_blocking`.
pub struct HttpLayerCompute {
    base_url: String,
    client: Client,
}

impl HttpLayerCompute {
    /// `base_url` is the root of the engine, e.g. `"http://127.0.0.1:8080"`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ComputeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ComputeError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Serialize)]
struct LayersRequest {
    activations_b64: String,
    layer_start: u32,
    layer_end: u32,
}

#[derive(Debug, Deserialize)]
struct LayersResponse {
    activations_b64: String,
    energy_mj: f64,
}

impl LayerCompute for HttpLayerCompute {
    fn apply_layers(
        &self,
        activations: &[f32],
        layers: LayerRange,
    ) -> Result<LayerOutput, ComputeError> {
        let url = self.endpoint("/layers");
        let body = LayersRequest {
            activations_b64: encode_activations(activations),
            layer_start: layers.start,
            layer_end: layers.end,
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| ComputeError::Transport(format!("HTTP POST {url} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ComputeError::Service(format!(
                "layer engine returned HTTP status {status}"
            )));
        }

        let body = resp
            .json::<LayersResponse>()
            .map_err(|e| ComputeError::Protocol(format!("failed to parse JSON response: {e}")))?;
        let activations = decode_activations(&body.activations_b64)
            .map_err(|e| ComputeError::Protocol(e.to_string()))?;

        Ok(LayerOutput {
            activations,
            energy_mj: body.energy_mj,
        })
    }
}
