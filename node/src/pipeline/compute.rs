//! Local compute collaborator: applies a range of layers to activations.
//!
//! The coordinator only needs new activations and a non-negative energy
//! estimate back. [`SimulatedCompute`] stands in for a 1-bit kernel: each
//! layer derives its output from a BLAKE3 hash of its input, so outputs are
//! reproducible without any model weights.

use crate::types::LayerRange;

use super::error::ComputeError;

/// Energy of one ternary weight operation, in millijoules.
const MJ_PER_WEIGHT_OP: f64 = 1e-6;

#[derive(Clone, Debug, PartialEq)]
pub struct LayerOutput {
    pub activations: Vec<f32>,
    pub energy_mj: f64,
}

/// Abstract layer engine used by [`super::PipelineCoordinator`].
///
/// Calls may block; async callers run them on a blocking thread.
pub trait LayerCompute: Send + Sync {
    fn apply_layers(&self, activations: &[f32], layers: LayerRange)
    -> Result<LayerOutput, ComputeError>;
}

/// Hash-derived stand-in for square `hidden_dim × hidden_dim` ternary
/// layers.
#[derive(Clone, Debug)]
pub struct SimulatedCompute {
    hidden_dim: usize,
}

impl SimulatedCompute {
    pub fn new(hidden_dim: u32) -> Self {
        Self {
            hidden_dim: hidden_dim as usize,
        }
    }

    pub fn energy_per_layer_mj(&self) -> f64 {
        (self.hidden_dim * self.hidden_dim) as f64 * MJ_PER_WEIGHT_OP
    }

    fn forward(&self, input: &[f32], layer: u32) -> Vec<f32> {
        let mut hasher = blake3::Hasher::new();
        for value in input {
            hasher.update(&value.to_le_bytes());
        }
        hasher.update(&layer.to_le_bytes());

        let mut stream = vec![0u8; self.hidden_dim * 4];
        hasher.finalize_xof().fill(&mut stream);
        stream
            .chunks_exact(4)
            .map(|c| {
                let seed = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                (seed % 1000) as f32 / 1000.0 * 2.0 - 1.0
            })
            .collect()
    }
}

impl LayerCompute for SimulatedCompute {
    fn apply_layers(
        &self,
        activations: &[f32],
        layers: LayerRange,
    ) -> Result<LayerOutput, ComputeError> {
        let mut current = activations.to_vec();
        let mut energy_mj = 0.0;
        for layer in layers.start..=layers.end {
            current = self.forward(&current, layer);
            energy_mj += self.energy_per_layer_mj();
        }
        Ok(LayerOutput {
            activations: current,
            energy_mj,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_layers_are_bounded_and_reproducible() {
        let compute = SimulatedCompute::new(64);
        let input = vec![0.1f32; 64];
        let a = compute.apply_layers(&input, LayerRange::new(0, 3)).unwrap();
        let b = compute.apply_layers(&input, LayerRange::new(0, 3)).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.activations.len(), 64);
        assert!(a.activations.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn energy_scales_with_layer_count() {
        let compute = SimulatedCompute::new(2048);
        let one = compute.apply_layers(&[], LayerRange::new(5, 5)).unwrap();
        let eight = compute.apply_layers(&[], LayerRange::new(0, 7)).unwrap();

        assert!((one.energy_mj - 4.194304).abs() < 1e-9);
        assert!((eight.energy_mj - 8.0 * one.energy_mj).abs() < 1e-9);
    }

    #[test]
    fn splitting_a_range_matches_applying_it_whole() {
        let compute = SimulatedCompute::new(32);
        let input: Vec<f32> = (0..32).map(|i| i as f32 / 100.0).collect();
        let whole = compute.apply_layers(&input, LayerRange::new(0, 5)).unwrap();
        let head = compute.apply_layers(&input, LayerRange::new(0, 2)).unwrap();
        let tail = compute
            .apply_layers(&head.activations, LayerRange::new(3, 5))
            .unwrap();
        assert_eq!(whole.activations, tail.activations);
    }
}
