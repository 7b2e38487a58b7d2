// src/main.rs
//
// Runs a single ARIA node:
//
// - configuration from defaults + ARIA_* environment variables
// - Prometheus metrics exporter on /metrics
// - the configured model shard, loaded and announced
// - bootstrap peers dialled at startup
// - graceful stop on Ctrl-C (pending ledger records are sealed).

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aria_node::{AriaNode, MetricsRegistry, NodeConfig, run_prometheus_http_server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aria_node=info")),
        )
        .init();

    if let Err(err) = run_node().await {
        error!(error = %err, "fatal error");
        std::process::exit(1);
    }
}

async fn run_node() -> Result<(), String> {
    let cfg = NodeConfig::from_env().map_err(|e| format!("invalid configuration: {e}"))?;

    // ---------------------------
    // Metrics registry + exporter
    // ---------------------------

    let metrics = Arc::new(
        MetricsRegistry::new()
            .map_err(|e| format!("failed to initialise metrics registry: {e}"))?,
    );

    if cfg.metrics.enabled {
        let metrics_clone = metrics.clone();
        let addr = cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(metrics_clone, addr).await {
                warn!(error = %e, "metrics HTTP server stopped");
            }
        });
    }

    // ---------------------------
    // Node + model shard
    // ---------------------------

    let pipeline = cfg.pipeline.clone();
    let bootstrap = cfg.network.bootstrap_peers.clone();
    let node = AriaNode::new(cfg, metrics.node.clone())
        .map_err(|e| format!("failed to build node: {e}"))?;

    let shard = node
        .load_model(
            &pipeline.model_id,
            pipeline.total_layers,
            pipeline.shard_start,
            pipeline.shard_end,
        )
        .await
        .map_err(|e| format!("failed to load model shard: {e}"))?;

    let addr = node
        .start()
        .await
        .map_err(|e| format!("failed to start node: {e}"))?;
    info!(
        node_id = %node.node_id(),
        %addr,
        shard_id = %shard.shard_id,
        "node ready"
    );

    // ---------------------------
    // Bootstrap peers
    // ---------------------------

    if !bootstrap.is_empty() {
        let connected = node.connect_to_peers(&bootstrap).await;
        info!(
            connected = connected.len(),
            attempted = bootstrap.len(),
            "bootstrap finished"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to wait for Ctrl-C: {e}"))?;
    info!("shutting down");

    node.stop()
        .await
        .map_err(|e| format!("failed to stop node cleanly: {e}"))?;
    let stats = node.get_stats().await;
    info!(
        blocks = stats.ledger.chain_length,
        inferences = stats.ledger.total_inferences,
        chain_valid = stats.ledger.chain_valid,
        tokens_earned = stats.tokens_earned,
        "final ledger state"
    );
    Ok(())
}
