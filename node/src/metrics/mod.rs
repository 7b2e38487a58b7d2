//! Metrics and instrumentation for the node.
//!
//! Prometheus-compatible counters for the transport, pipeline, proofs and
//! ledger, plus a small HTTP exporter that serves `/metrics`:
//!
//! ```ignore
//! let registry = Arc::new(MetricsRegistry::new()?);
//! tokio::spawn(run_prometheus_http_server(registry.clone(), addr));
//! registry.node.blocks_sealed.inc();
//! ```

pub mod prometheus;

pub use prometheus::{MetricsRegistry, NodeMetrics, run_prometheus_http_server};
