//! Top-level configuration for an ARIA node.
//!
//! This module aggregates configuration for:
//!
//! - the peer transport (`NetworkConfig`),
//! - the model shard this node serves (`PipelineConfig`),
//! - the layer engine (`ComputeConfig`),
//! - the provenance ledger and where it is stored,
//! - the metrics exporter (enable flag + listen address),
//! - and the consent descriptor the node publishes.
//!
//! Every struct has defaults matching the reference deployment.
//! [`NodeConfig::from_env`] overlays `ARIA_*` environment variables on top.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::ledger::LedgerConfig;
use crate::network::NetworkConfig;
use crate::pipeline::{ComputeBackend, ComputeConfig, PipelineConfig};
use crate::storage::RocksDbConfig;
use crate::types::{ConsentDescriptor, ConsentError, Schedule};

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Whether to run a `/metrics` HTTP exporter.
    pub enabled: bool,
    /// Address to bind the metrics HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        // Safe to unwrap: this is a fixed, valid address literal.
        let addr: SocketAddr = "127.0.0.1:9898"
            .parse()
            .expect("hard-coded metrics listen address should parse");
        Self {
            enabled: true,
            listen_addr: addr,
        }
    }
}

/// Where ledger blocks live.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum StorageConfig {
    /// Blocks are lost when the node exits.
    #[default]
    Memory,
    RocksDb(RocksDbConfig),
}

/// Top-level configuration for a node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: String,
    pub consent: ConsentDescriptor,
    pub network: NetworkConfig,
    pub pipeline: PipelineConfig,
    pub ledger: LedgerConfig,
    pub storage: StorageConfig,
    pub compute: ComputeConfig,
    pub metrics: MetricsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let mut node_id = uuid::Uuid::new_v4().simple().to_string();
        node_id.truncate(8);
        Self {
            node_id: format!("node_{node_id}"),
            consent: ConsentDescriptor::default(),
            network: NetworkConfig::default(),
            pipeline: PipelineConfig::default(),
            ledger: LedgerConfig::default(),
            storage: StorageConfig::default(),
            compute: ComputeConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// A malformed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    Consent(ConsentError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "invalid value {value:?} for {var}: {reason}")
            }
            ConfigError::Consent(e) => write!(f, "invalid consent: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConsentError> for ConfigError {
    fn from(e: ConsentError) -> Self {
        ConfigError::Consent(e)
    }
}

struct Overlay<F> {
    lookup: F,
}

impl<F> Overlay<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, var: &'static str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(value) = self.raw(var) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
    }

    fn secs(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_secs))
    }
}

impl NodeConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by `ARIA_*`
    /// variable name. Unset and blank variables keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Overlay { lookup };
        let mut cfg = NodeConfig::default();

        if let Some(id) = env.raw("ARIA_NODE_ID") {
            cfg.node_id = id.trim().to_string();
        }

        // network
        if let Some(addr) = env.parse("ARIA_LISTEN_ADDR")? {
            cfg.network.listen_addr = addr;
        }
        if let Some(host) = env.raw("ARIA_ADVERTISE_HOST") {
            cfg.network.advertise_host = host.trim().to_string();
        }
        if let Some(peers) = env.raw("ARIA_BOOTSTRAP_PEERS") {
            cfg.network.bootstrap_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(d) = env.secs("ARIA_HANDSHAKE_TIMEOUT_SECS")? {
            cfg.network.handshake_timeout = d;
        }
        if let Some(d) = env.secs("ARIA_REQUEST_TIMEOUT_SECS")? {
            cfg.network.request_timeout = d;
        }
        if let Some(d) = env.secs("ARIA_PING_TIMEOUT_SECS")? {
            cfg.network.ping_timeout = d;
        }
        if let Some(d) = env.secs("ARIA_FORWARD_TIMEOUT_SECS")? {
            cfg.network.forward_timeout = d;
        }
        if let Some(d) = env.secs("ARIA_HEARTBEAT_SECS")? {
            cfg.network.heartbeat_interval = d;
        }

        // pipeline
        if let Some(model) = env.raw("ARIA_MODEL_ID") {
            cfg.pipeline.model_id = model.trim().to_string();
        }
        if let Some(n) = env.parse("ARIA_TOTAL_LAYERS")? {
            cfg.pipeline.total_layers = n;
        }
        if let Some(n) = env.parse("ARIA_SHARD_START")? {
            cfg.pipeline.shard_start = n;
        }
        if let Some(n) = env.parse("ARIA_SHARD_END")? {
            cfg.pipeline.shard_end = Some(n);
        }
        if let Some(n) = env.parse("ARIA_HIDDEN_DIM")? {
            cfg.pipeline.hidden_dim = n;
        }

        // ledger
        if let Some(n) = env.parse("ARIA_LEDGER_DIFFICULTY")? {
            cfg.ledger.difficulty = n;
        }
        if let Some(n) = env.parse::<usize>("ARIA_RECORDS_PER_BLOCK")? {
            if n == 0 {
                return Err(ConfigError::Invalid {
                    var: "ARIA_RECORDS_PER_BLOCK",
                    value: n.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            cfg.ledger.records_per_block = n;
        }
        if let Some(path) = env.raw("ARIA_LEDGER_PATH") {
            cfg.storage = StorageConfig::RocksDb(RocksDbConfig {
                path: path.trim().to_string(),
                ..RocksDbConfig::default()
            });
        }

        // compute
        if let Some(base_url) = env.raw("ARIA_COMPUTE_URL") {
            let timeout = env
                .secs("ARIA_COMPUTE_TIMEOUT_SECS")?
                .unwrap_or(Duration::from_secs(30));
            cfg.compute.backend = ComputeBackend::Http {
                base_url: base_url.trim().to_string(),
                timeout,
            };
        }

        // metrics
        if let Some(enabled) = env.parse("ARIA_METRICS_ENABLED")? {
            cfg.metrics.enabled = enabled;
        }
        if let Some(addr) = env.parse("ARIA_METRICS_ADDR")? {
            cfg.metrics.listen_addr = addr;
        }

        // consent
        if let Some(schedule) = env.raw("ARIA_CONSENT_SCHEDULE") {
            cfg.consent.schedule = Schedule::parse(&schedule)?;
        }
        if let Some(cpu) = env.parse("ARIA_CONSENT_CPU_PERCENT")? {
            cfg.consent.cpu_percent = cpu;
        }
        if let Some(ram) = env.parse("ARIA_CONSENT_RAM_MB")? {
            cfg.consent.max_ram_mb = ram;
        }
        if let Some(reward) = env.parse("ARIA_CONSENT_MIN_REWARD")? {
            cfg.consent.min_reward_per_inference = reward;
        }
        cfg.consent.node_id = Some(cfg.node_id.clone());
        cfg.consent.validate()?;

        Ok(cfg)
    }
}
