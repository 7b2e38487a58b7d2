//! Prometheus-backed node metrics and the `/metrics` HTTP exporter.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, header, server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

/// Metrics updated by the transport, the pipeline and the ledger.
///
/// Handles are cheap to clone; clones update the same series.
#[derive(Clone)]
pub struct NodeMetrics {
    pub messages_sent: IntCounter,
    pub messages_received: IntCounter,
    /// Wall time of one local pipeline stage, in seconds.
    pub stage_seconds: Histogram,
    /// Forwarding attempts that failed on a single target.
    pub forward_failures: IntCounter,
    pub proofs_accepted: IntCounter,
    pub proofs_rejected: IntCounter,
    pub blocks_sealed: IntCounter,
    pub alive_peers: IntGauge,
}

impl NodeMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let messages_sent = IntCounter::with_opts(Opts::new(
            "network_messages_sent_total",
            "Protocol messages sent to peers",
        ))?;
        registry.register(Box::new(messages_sent.clone()))?;

        let messages_received = IntCounter::with_opts(Opts::new(
            "network_messages_received_total",
            "Protocol messages received from peers",
        ))?;
        registry.register(Box::new(messages_received.clone()))?;

        let stage_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "pipeline_stage_seconds",
                "Time to apply this node's layers to one pipeline state",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        registry.register(Box::new(stage_seconds.clone()))?;

        let forward_failures = IntCounter::with_opts(Opts::new(
            "pipeline_forward_failures_total",
            "Pipeline forwards that failed on one target (primary or replica)",
        ))?;
        registry.register(Box::new(forward_failures.clone()))?;

        let proofs_accepted = IntCounter::with_opts(Opts::new(
            "proofs_accepted_total",
            "Useful-work proofs accepted",
        ))?;
        registry.register(Box::new(proofs_accepted.clone()))?;

        let proofs_rejected = IntCounter::with_opts(Opts::new(
            "proofs_rejected_total",
            "Useful-work proofs rejected by structural validation",
        ))?;
        registry.register(Box::new(proofs_rejected.clone()))?;

        let blocks_sealed = IntCounter::with_opts(Opts::new(
            "ledger_blocks_sealed_total",
            "Ledger blocks sealed by this node",
        ))?;
        registry.register(Box::new(blocks_sealed.clone()))?;

        let alive_peers = IntGauge::with_opts(Opts::new(
            "network_alive_peers",
            "Peers heard from within the liveness window",
        ))?;
        registry.register(Box::new(alive_peers.clone()))?;

        Ok(Self {
            messages_sent,
            messages_received,
            stage_seconds,
            forward_failures,
            proofs_accepted,
            proofs_rejected,
            blocks_sealed,
            alive_peers,
        })
    }
}

/// A Prometheus registry (namespace `aria`) plus the node metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub node: NodeMetrics,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("aria".to_string()), None)?;
        let node = NodeMetrics::register(&registry)?;
        Ok(Self { registry, node })
    }

    /// Encodes all metrics into the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "failed to encode Prometheus metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Serves `GET /metrics` on `addr`; every other path is a 404.
///
/// Intended to be spawned:
///
/// ```ignore
/// tokio::spawn(run_prometheus_http_server(registry.clone(), addr));
/// ```
pub async fn run_prometheus_http_server(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics exporter listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let metrics = metrics.clone();
                handle_request(req, metrics)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                warn!(error = %err, "metrics connection error");
            }
        });
    }
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            metrics.gather_text(),
        ),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "not found".to_string()),
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_metrics_register_and_record() {
        let registry = Registry::new();
        let metrics = NodeMetrics::register(&registry).expect("register metrics");

        metrics.messages_sent.inc();
        metrics.stage_seconds.observe(0.004);
        metrics.alive_peers.set(3);
        metrics.blocks_sealed.inc();

        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn gather_text_uses_aria_namespace() {
        let registry = MetricsRegistry::new().expect("create metrics registry");
        registry.node.proofs_rejected.inc();
        let text = registry.gather_text();
        assert!(text.contains("aria_proofs_rejected_total 1"));
    }

    #[tokio::test]
    async fn exporter_serves_metrics_and_404() {
        let registry = Arc::new(MetricsRegistry::new().expect("registry"));
        registry.node.messages_received.inc();

        // Reserve a free port, then hand it to the exporter.
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);
        tokio::spawn(run_prometheus_http_server(registry, addr));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let base = format!("http://{addr}");
        let (ok, missing) = tokio::task::spawn_blocking(move || {
            let client = reqwest::blocking::Client::new();
            let ok = client.get(format!("{base}/metrics")).send().unwrap();
            let missing = client.get(format!("{base}/nope")).send().unwrap();
            (
                (ok.status().as_u16(), ok.text().unwrap()),
                missing.status().as_u16(),
            )
        })
        .await
        .unwrap();

        assert_eq!(ok.0, 200);
        assert!(ok.1.contains("aria_network_messages_received_total 1"));
        assert_eq!(missing, 404);
    }
}
