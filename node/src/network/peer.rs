//! Per-peer routing record.

use serde::{Deserialize, Serialize};

use crate::types::{ConsentDescriptor, unix_now};

use super::message::PeerAdvert;

/// Seconds without a message after which a peer counts as dead.
pub const PEER_TTL_SECS: f64 = 300.0;

const REPUTATION_REWARD: f64 = 0.01;
const REPUTATION_PENALTY: f64 = 0.1;
/// Weight of the newest sample in the running averages.
const EMA_ALPHA: f64 = 0.2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub consent: Option<ConsentDescriptor>,
    /// Reliability in `[0, 1]`.
    pub reputation: f64,
    pub available_shards: Vec<String>,
    pub last_seen: f64,
    pub total_inferences: u64,
    pub avg_latency_ms: f64,
    pub avg_energy_mj: f64,
    /// Relative energy cost; lower is better.
    pub energy_efficiency: f64,
}

impl PeerRecord {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            consent: None,
            reputation: 1.0,
            available_shards: Vec::new(),
            last_seen: unix_now(),
            total_inferences: 0,
            avg_latency_ms: 0.0,
            avg_energy_mj: 0.0,
            energy_efficiency: 1.0,
        }
    }

    pub fn from_advert(advert: PeerAdvert) -> Self {
        let mut peer = Self::new(advert.node_id, advert.host, advert.port);
        peer.consent = advert.consent;
        peer.available_shards = advert.shards;
        peer
    }

    pub fn to_advert(&self) -> PeerAdvert {
        PeerAdvert {
            node_id: self.node_id.clone(),
            host: self.host.clone(),
            port: self.port,
            consent: self.consent.clone(),
            shards: self.available_shards.clone(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_alive_at(&self, now: f64) -> bool {
        now - self.last_seen < PEER_TTL_SECS
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive_at(unix_now())
    }

    pub fn touch(&mut self, now: f64) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Composite routing score; higher is better.
    pub fn quality_score(&self) -> f64 {
        let uptime = self.reputation.min(1.0);
        let latency = (1.0 - self.avg_latency_ms / 5000.0).max(0.0);
        let efficiency = 1.0 / self.energy_efficiency.max(0.1);
        0.4 * uptime + 0.3 * latency + 0.3 * efficiency
    }

    pub fn record_latency(&mut self, latency_ms: f64) {
        self.avg_latency_ms = if self.avg_latency_ms == 0.0 {
            latency_ms
        } else {
            EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * self.avg_latency_ms
        };
    }

    /// Folds a completed stage into the running averages and rewards the
    /// peer.
    pub fn record_success(&mut self, latency_ms: f64, energy_mj: f64) {
        self.total_inferences += 1;
        self.record_latency(latency_ms);
        self.avg_energy_mj = if self.total_inferences == 1 {
            energy_mj
        } else {
            EMA_ALPHA * energy_mj + (1.0 - EMA_ALPHA) * self.avg_energy_mj
        };
        self.reputation = (self.reputation + REPUTATION_REWARD).min(1.0);
    }

    pub fn record_failure(&mut self) {
        self.reputation = (self.reputation - REPUTATION_PENALTY).max(0.0);
    }
}
