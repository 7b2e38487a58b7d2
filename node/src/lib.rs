//! ARIA node library crate.
//!
//! This crate provides the coordination machinery that lets independent,
//! CPU-only machines cooperatively serve LLM inference:
//!
//! - strongly-typed domain types and consent descriptors (`types`),
//! - the peer directory, wire protocol and TCP transport (`network`),
//! - the distributed layer pipeline and its compute backends (`pipeline`),
//! - the hash-chained provenance ledger (`ledger`) and its storage
//!   backends (`storage`),
//! - useful-work and sobriety proofs (`proof`),
//! - Prometheus-based metrics (`metrics`),
//! - the node facade wiring it all together (`node`),
//! - and a top-level node configuration (`config`).

pub mod config;
pub mod ledger;
pub mod metrics;
pub mod network;
pub mod node;
pub mod pipeline;
pub mod proof;
pub mod storage;
pub mod types;

// Re-export top-level configuration types.
pub use config::{ConfigError, MetricsConfig, NodeConfig, StorageConfig};

// Re-export the node facade.
pub use node::{AriaNode, NodeError, NodeStats, reward_per_node};

// Re-export the transport and routing types.
pub use network::{NetworkConfig, NetworkError, PeerDirectory, PeerRecord, Transport};

// Re-export pipeline types.
pub use pipeline::{
    ComputeBackend, ComputeConfig, LayerCompute, PipelineConfig, PipelineCoordinator,
    PipelineError,
};

// Re-export the ledger, its storage backends and the proofs.
pub use ledger::{LedgerConfig, LedgerError, LedgerStore, ProvenanceLedger};
pub use proof::{ProofOfSobriety, ProofOfUsefulWork};
pub use storage::{InMemoryLedgerStore, RocksDbConfig, RocksDbLedgerStore};

// Re-export metrics registry and node metrics.
pub use metrics::{MetricsRegistry, NodeMetrics, run_prometheus_http_server};

// Re-export domain types at the crate root for convenience.
pub use types::*;
