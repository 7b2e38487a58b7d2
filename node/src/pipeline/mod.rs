//! Distributed layer pipeline.
//!
//! - [`chain`] resolves which node runs which layer range,
//! - [`coordinator`] runs this node's stage of a request,
//! - [`compute`] / [`http`] provide the layer engine behind it.

pub mod chain;
pub mod compute;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;

pub use chain::{ChainError, PipelineStage, StageCandidate, build_chain};
pub use compute::{LayerCompute, LayerOutput, SimulatedCompute};
pub use config::{ComputeBackend, ComputeConfig, PipelineConfig};
pub use coordinator::{CoordinatorStats, PipelineCoordinator, StageOutcome};
pub use error::{ComputeError, PipelineError};
pub use http::HttpLayerCompute;
